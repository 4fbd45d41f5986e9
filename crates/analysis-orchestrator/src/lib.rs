use std::sync::Arc;
use std::time::Instant;

use analysis_core::{
    Decision, Direction, MarketSnapshot, PipelineError, PipelineResult, StageContext, StageName,
    StageResult,
};
use ml_client::{
    AdjudicationContext, Adjudicator, AiAdjudicatorStage, MlEnsembleStage, StageSummary,
    WeightedModel,
};
use multi_timeframe::HtfAlignmentStage;
use technical_analysis::PriceActionStage;

pub mod config;
pub mod metrics;
pub mod stage;

pub use config::{parse_stage_weights, AiMode, LevelParams, PipelineConfig};
pub use metrics::{StageCounts, StageMetrics};
pub use stage::{AiStage, Stage};


/// Protective levels derived for a candidate entry
#[derive(Debug, Clone, Copy, PartialEq)]
struct Levels {
    stop_loss: f64,
    take_profit: f64,
    risk_reward: Option<f64>,
}

/// Runs the stage chain for one symbol and folds it into a `Decision`.
///
/// Gating stages run in the fixed order ML-ensemble, price action, HTF
/// alignment; every one of them runs even after an earlier failure so the
/// decision records a complete picture. The AI adjudicator runs last and only
/// for decisions that already passed everything else.
pub struct EntryPipeline {
    config: PipelineConfig,
    stages: Vec<Stage>,
    ai: AiStage,
    metrics: StageMetrics,
}

impl EntryPipeline {
    pub fn new(
        config: PipelineConfig,
        models: Vec<WeightedModel>,
        adjudicator: Option<Arc<dyn Adjudicator>>,
    ) -> PipelineResult<Self> {
        config.validate()?;

        let ml = if config.ml_enabled {
            Stage::MlEnsemble(MlEnsembleStage::new(models, config.ml.clone())?)
        } else {
            Stage::Disabled(StageName::MlEnsemble)
        };
        let price_action = if config.price_action_enabled {
            Stage::PriceAction(PriceActionStage::new(config.price_action.clone()))
        } else {
            Stage::Disabled(StageName::PriceAction)
        };
        let htf = if config.htf_enabled {
            Stage::HtfAlignment(HtfAlignmentStage::new(config.htf.clone()))
        } else {
            Stage::Disabled(StageName::HtfAlignment)
        };

        let ai = match (config.ai_enabled, adjudicator) {
            (true, Some(client)) => AiStage::Enabled {
                stage: AiAdjudicatorStage::new(
                    client,
                    config.ai_retry.clone(),
                    config.ai_failure_policy,
                ),
                mode: config.ai_mode,
                band: config.ai_borderline_band,
            },
            (true, None) => {
                return Err(PipelineError::config(
                    "AI validator enabled but no adjudicator client configured",
                ))
            }
            (false, _) => AiStage::Disabled,
        };

        Ok(Self {
            config,
            stages: vec![ml, price_action, htf],
            ai,
            metrics: StageMetrics::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Evaluate one symbol. Never fails: anything unresolved rejects the entry.
    pub async fn evaluate(
        &self,
        symbol: &str,
        snapshot: &MarketSnapshot,
        higher: Option<&MarketSnapshot>,
    ) -> Decision {
        let started = Instant::now();
        let mut results: Vec<StageResult> = Vec::with_capacity(4);
        let mut skipped = Vec::new();
        let mut gates = Vec::new();
        let mut candidate = Direction::Neutral;

        for stage in &self.stages {
            let ctx = StageContext {
                symbol,
                snapshot,
                higher,
                candidate,
            };
            let Some(result) = stage.evaluate(&ctx) else {
                skipped.push(stage.name());
                continue;
            };

            self.metrics.record(result.stage, result.passed);
            if stage.is_gate() {
                gates.push(result.stage);
                if !candidate.is_directional() && result.opinion.is_directional() {
                    candidate = result.opinion;
                }
            }
            results.push(result);
        }

        let mut decision = Decision {
            symbol: symbol.to_string(),
            should_enter: false,
            direction: Direction::Neutral,
            confidence: 0.0,
            entry_price: snapshot.last_close().unwrap_or(0.0),
            stop_loss: None,
            take_profit: None,
            risk_reward: None,
            reason: String::new(),
            stage_results: Vec::new(),
            passed_stages: Vec::new(),
            failed_stages: Vec::new(),
            skipped_stages: Vec::new(),
            latency: Default::default(),
        };

        let rejection = self.judge(&mut decision, snapshot, &results, &gates);

        match rejection {
            Some(reason) => {
                decision.reason = reason;
                skipped.push(StageName::AiAdjudicator);
            }
            None if self.ai.should_invoke(decision.confidence, self.config.min_confidence) => {
                if let AiStage::Enabled { stage, .. } = &self.ai {
                    let context = adjudication_context(&decision, &results);
                    let result = stage.evaluate(&context).await;
                    self.metrics.record(result.stage, result.passed);

                    if result.passed {
                        decision.should_enter = true;
                        decision.reason = format!("{}; {}", approval_reason(&decision), result.reason);
                    } else {
                        decision.reason = result.reason.clone();
                    }
                    results.push(result);
                }
            }
            None => {
                decision.should_enter = true;
                decision.reason = approval_reason(&decision);
                skipped.push(StageName::AiAdjudicator);
            }
        }

        decision.passed_stages = results.iter().filter(|r| r.passed).map(|r| r.stage).collect();
        decision.failed_stages = results.iter().filter(|r| !r.passed).map(|r| r.stage).collect();
        decision.skipped_stages = skipped;
        decision.stage_results = results;
        decision.latency = started.elapsed();

        tracing::info!(
            symbol = %decision.symbol,
            direction = %decision.direction,
            should_enter = decision.should_enter,
            confidence = decision.confidence,
            passed = ?decision.passed_stages,
            failed = ?decision.failed_stages,
            latency_ms = decision.latency.as_millis() as u64,
            "Entry decision: {}",
            decision.reason
        );

        decision
    }

    /// Apply the gating rules in order. Fills direction, confidence and
    /// levels as far as they can be determined; returns the rejection reason.
    fn judge(
        &self,
        decision: &mut Decision,
        snapshot: &MarketSnapshot,
        results: &[StageResult],
        gates: &[StageName],
    ) -> Option<String> {
        let gating: Vec<&StageResult> = results.iter().filter(|r| gates.contains(&r.stage)).collect();

        let failed: Vec<String> = gating
            .iter()
            .filter(|r| !r.passed)
            .map(|r| format!("{}: {}", r.stage, r.reason))
            .collect();
        if !failed.is_empty() {
            return Some(format!("stage failed ({})", failed.join("; ")));
        }

        let mut opinions = gating.iter().map(|r| r.opinion).filter(Direction::is_directional);
        let Some(direction) = opinions.next() else {
            return Some("no stage expressed a direction".to_string());
        };
        if opinions.any(|o| o != direction) {
            return Some("direction conflict".to_string());
        }
        decision.direction = direction;
        decision.confidence = self.blend_confidence(&gating);

        let Some(levels) = self.levels(decision.entry_price, direction, snapshot.atr()) else {
            return Some("snapshot has no usable price".to_string());
        };
        decision.stop_loss = Some(levels.stop_loss);
        decision.take_profit = Some(levels.take_profit);
        decision.risk_reward = levels.risk_reward;
        if levels.take_profit <= 0.0 {
            return Some(format!(
                "take-profit {:.4} is not a positive price",
                levels.take_profit
            ));
        }

        if decision.confidence < self.config.min_confidence {
            return Some(format!(
                "confidence {:.3} below minimum {:.3}",
                decision.confidence, self.config.min_confidence
            ));
        }

        match levels.risk_reward {
            Some(rr) if rr >= self.config.min_risk_reward => None,
            Some(rr) => Some(format!(
                "risk/reward {:.2} below minimum {:.2}",
                rr, self.config.min_risk_reward
            )),
            None => Some("stop distance is zero, risk/reward undefined".to_string()),
        }
    }

    /// Weighted mean of the gating scores, weights renormalized over the
    /// stages that actually ran
    fn blend_confidence(&self, gating: &[&StageResult]) -> f64 {
        let weight = |r: &StageResult| {
            self.config
                .stage_weights
                .get(&r.stage)
                .copied()
                .unwrap_or(0.0)
        };
        let total: f64 = gating.iter().map(|r| weight(*r)).sum();
        if total <= 0.0 {
            return 0.0;
        }

        let blended: f64 = gating.iter().map(|r| r.score * weight(*r)).sum::<f64>() / total;
        blended.clamp(0.0, 1.0)
    }

    /// ATR-based stop and target, percentage-based when the snapshot has no ATR
    fn levels(&self, entry: f64, direction: Direction, atr: Option<f64>) -> Option<Levels> {
        if !(entry.is_finite() && entry > 0.0) {
            return None;
        }

        let params = &self.config.levels;
        let (stop_distance, target_distance) = match atr {
            Some(atr) => (
                atr * params.stop_atr_multiple,
                atr * params.take_profit_atr_multiple,
            ),
            None => (
                entry * params.stop_loss_percent / 100.0,
                entry * params.take_profit_percent / 100.0,
            ),
        };

        let sign = direction.sign();
        let stop_loss = entry - sign * stop_distance;
        let take_profit = entry + sign * target_distance;
        let risk = (entry - stop_loss).abs();
        let reward = (take_profit - entry).abs();

        Some(Levels {
            stop_loss,
            take_profit,
            risk_reward: (risk > 0.0).then(|| reward / risk),
        })
    }
}

fn approval_reason(decision: &Decision) -> String {
    format!(
        "{} entry approved: confidence {:.3}, risk/reward {:.2}",
        decision.direction,
        decision.confidence,
        decision.risk_reward.unwrap_or(0.0)
    )
}

fn adjudication_context(decision: &Decision, results: &[StageResult]) -> AdjudicationContext {
    AdjudicationContext {
        symbol: decision.symbol.clone(),
        direction: decision.direction,
        confidence: decision.confidence,
        entry_price: decision.entry_price,
        stop_loss: decision.stop_loss.unwrap_or(decision.entry_price),
        take_profit: decision.take_profit.unwrap_or(decision.entry_price),
        risk_reward: decision.risk_reward.unwrap_or(0.0),
        stages: results.iter().map(StageSummary::from).collect(),
    }
}
