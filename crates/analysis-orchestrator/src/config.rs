use std::collections::BTreeMap;

use analysis_core::{PipelineError, PipelineResult, StageName};
use ml_client::{FailurePolicy, MlParams, RetryPolicy};
use multi_timeframe::HtfParams;
use serde::{Deserialize, Serialize};
use technical_analysis::PriceActionParams;

/// When the AI adjudicator is consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiMode {
    /// Every decision that passed the gating stages
    All,
    /// Only decisions whose confidence sits within the band above the minimum
    #[default]
    Borderline,
}

impl AiMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "all" => Some(AiMode::All),
            "borderline" => Some(AiMode::Borderline),
            _ => None,
        }
    }
}

/// Stop-loss / take-profit placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelParams {
    pub stop_atr_multiple: f64,
    pub take_profit_atr_multiple: f64,
    /// Fallbacks when the snapshot carries no ATR
    pub stop_loss_percent: f64,
    pub take_profit_percent: f64,
}

impl Default for LevelParams {
    fn default() -> Self {
        Self {
            stop_atr_multiple: 1.5,
            take_profit_atr_multiple: 3.0,
            stop_loss_percent: 2.0,
            take_profit_percent: 4.0,
        }
    }
}

/// Stage enable flags and thresholds of one pipeline instance
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub ml_enabled: bool,
    pub ml: MlParams,

    pub price_action_enabled: bool,
    pub price_action: PriceActionParams,

    pub htf_enabled: bool,
    pub htf: HtfParams,

    pub ai_enabled: bool,
    pub ai_mode: AiMode,
    pub ai_borderline_band: f64,
    pub ai_retry: RetryPolicy,
    pub ai_failure_policy: FailurePolicy,

    pub min_confidence: f64,
    pub min_risk_reward: f64,
    /// Relative weight of each gating stage in the overall confidence
    pub stage_weights: BTreeMap<StageName, f64>,
    pub levels: LevelParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ml_enabled: true,
            ml: MlParams::default(),
            price_action_enabled: true,
            price_action: PriceActionParams::default(),
            htf_enabled: true,
            htf: HtfParams::default(),
            ai_enabled: false,
            ai_mode: AiMode::default(),
            ai_borderline_band: 0.10,
            ai_retry: RetryPolicy::default(),
            ai_failure_policy: FailurePolicy::default(),
            min_confidence: 0.55,
            min_risk_reward: 1.5,
            stage_weights: default_stage_weights(),
            levels: LevelParams::default(),
        }
    }
}

pub fn default_stage_weights() -> BTreeMap<StageName, f64> {
    BTreeMap::from([
        (StageName::MlEnsemble, 0.40),
        (StageName::PriceAction, 0.35),
        (StageName::HtfAlignment, 0.25),
    ])
}

/// Parse `ml_ensemble=0.4,price_action=0.35,htf_alignment=0.25`
pub fn parse_stage_weights(value: &str) -> PipelineResult<BTreeMap<StageName, f64>> {
    let mut weights = BTreeMap::new();
    for pair in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, weight) = pair
            .split_once('=')
            .ok_or_else(|| PipelineError::config(format!("stage weight '{}' is not name=value", pair)))?;
        let stage = StageName::parse(name.trim())
            .ok_or_else(|| PipelineError::config(format!("unknown stage '{}' in weights", name.trim())))?;
        let weight: f64 = weight
            .trim()
            .parse()
            .map_err(|_| PipelineError::config(format!("stage weight '{}' is not a number", pair)))?;
        weights.insert(stage, weight);
    }
    Ok(weights)
}

fn check_unit(name: &str, value: f64) -> PipelineResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(PipelineError::config(format!("{} must be in [0, 1], got {}", name, value)));
    }
    Ok(())
}

fn check_positive(name: &str, value: f64) -> PipelineResult<()> {
    if !(value.is_finite() && value > 0.0) {
        return Err(PipelineError::config(format!("{} must be positive, got {}", name, value)));
    }
    Ok(())
}

impl PipelineConfig {
    /// Reject settings the pipeline cannot evaluate with
    pub fn validate(&self) -> PipelineResult<()> {
        if !(0.0..0.5).contains(&self.ml.neutral_zone) {
            return Err(PipelineError::config(format!(
                "ml neutral zone must be in [0, 0.5), got {}",
                self.ml.neutral_zone
            )));
        }
        check_unit("ml confidence threshold", self.ml.confidence_threshold)?;
        check_unit("min confidence", self.min_confidence)?;
        check_unit("ai borderline band", self.ai_borderline_band)?;

        if self.price_action.min_score > 8 {
            return Err(PipelineError::config(format!(
                "min price action score {} exceeds the maximum of 8",
                self.price_action.min_score
            )));
        }
        if !(self.min_risk_reward.is_finite() && self.min_risk_reward >= 0.0) {
            return Err(PipelineError::config(format!(
                "min risk/reward must be non-negative, got {}",
                self.min_risk_reward
            )));
        }

        check_positive("stop ATR multiple", self.levels.stop_atr_multiple)?;
        check_positive("take-profit ATR multiple", self.levels.take_profit_atr_multiple)?;
        check_positive("stop-loss percent", self.levels.stop_loss_percent)?;
        check_positive("take-profit percent", self.levels.take_profit_percent)?;

        if let Some((stage, w)) = self
            .stage_weights
            .iter()
            .find(|(_, w)| !(w.is_finite() && **w >= 0.0))
        {
            return Err(PipelineError::config(format!(
                "weight for {} must be non-negative, got {}",
                stage, w
            )));
        }
        if self.stage_weights.contains_key(&StageName::AiAdjudicator) {
            return Err(PipelineError::config(
                "ai_adjudicator does not contribute to confidence and takes no weight",
            ));
        }
        let enabled_weight: f64 = self
            .contributing_stages()
            .iter()
            .map(|s| self.stage_weights.get(s).copied().unwrap_or(0.0))
            .sum();
        if !self.contributing_stages().is_empty() && enabled_weight <= 0.0 {
            return Err(PipelineError::config("weights of the enabled stages sum to zero"));
        }

        if self.ai_enabled && self.ai_retry.timeout.is_zero() {
            return Err(PipelineError::config("ai timeout must be greater than zero"));
        }

        Ok(())
    }

    /// Enabled stages whose scores form the overall confidence
    pub fn contributing_stages(&self) -> Vec<StageName> {
        let mut stages = Vec::new();
        if self.ml_enabled {
            stages.push(StageName::MlEnsemble);
        }
        if self.price_action_enabled {
            stages.push(StageName::PriceAction);
        }
        if self.htf_enabled && self.htf.require_alignment {
            stages.push(StageName::HtfAlignment);
        }
        stages
    }
}
