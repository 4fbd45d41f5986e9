use std::collections::BTreeMap;
use std::sync::Arc;

use analysis_core::{
    Direction, MarketSnapshot, PipelineError, PipelineResult, StageContext, StageName, StageResult,
};
use serde::{Deserialize, Serialize};

use crate::error::{MLError, MLResult};

/// A fitted model that scores a snapshot.
///
/// Training happens elsewhere; implementations only evaluate.
pub trait SignalModel: Send + Sync {
    fn name(&self) -> &str;

    /// Probability of an upward move, in 0.0..=1.0
    fn predict(&self, snapshot: &MarketSnapshot) -> MLResult<f64>;
}

/// Model plus its ensemble weight (weights need not sum to 1)
#[derive(Clone)]
pub struct WeightedModel {
    pub model: Arc<dyn SignalModel>,
    pub weight: f64,
}

impl WeightedModel {
    pub fn new(model: Arc<dyn SignalModel>, weight: f64) -> Self {
        Self { model, weight }
    }

    pub fn has_valid_weight(&self) -> bool {
        self.weight.is_finite() && self.weight >= 0.0
    }
}

/// Snapshot-derived inputs for linear models
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// (fast - slow) / close
    TrendSpread,
    /// Last step of the fast average / close
    TrendSlope,
    /// (RSI - 50) / 50
    RsiCentered,
    /// Close position inside the volatility bands, -1 at lower, +1 at upper
    BandPosition,
    /// ATR / close
    AtrPercent,
    /// Last close-to-close return
    LastReturn,
}

impl Feature {
    pub fn extract(&self, snapshot: &MarketSnapshot) -> Option<f64> {
        let ind = &snapshot.indicators;
        let close = snapshot.last_close().filter(|c| *c > 0.0)?;

        match self {
            Feature::TrendSpread => Some((ind.last_trend_fast()? - ind.last_trend_slow()?) / close),
            Feature::TrendSlope => {
                let n = ind.trend_fast.len();
                if n < 2 {
                    return None;
                }
                Some((ind.trend_fast[n - 1] - ind.trend_fast[n - 2]) / close)
            }
            Feature::RsiCentered => Some((ind.last_rsi()? - 50.0) / 50.0),
            Feature::BandPosition => {
                let upper = *ind.band_upper.last()?;
                let middle = *ind.band_middle.last()?;
                let half_width = upper - middle;
                if half_width <= 0.0 {
                    return Some(0.0);
                }
                Some(((close - middle) / half_width).clamp(-1.0, 1.0))
            }
            Feature::AtrPercent => Some(snapshot.atr()? / close),
            Feature::LastReturn => {
                let n = snapshot.candles.len();
                if n < 2 || snapshot.candles[n - 2].close <= 0.0 {
                    return None;
                }
                Some(close / snapshot.candles[n - 2].close - 1.0)
            }
        }
    }
}

/// Logistic model over snapshot features with offline-fitted coefficients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearSignalModel {
    pub name: String,
    pub intercept: f64,
    pub coefficients: BTreeMap<Feature, f64>,
}

impl SignalModel for LinearSignalModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, snapshot: &MarketSnapshot) -> MLResult<f64> {
        let mut z = self.intercept;
        for (feature, coef) in &self.coefficients {
            let value = feature.extract(snapshot).ok_or_else(|| {
                MLError::Model(format!("{}: feature {:?} unavailable", self.name, feature))
            })?;
            z += coef * value;
        }
        Ok(1.0 / (1.0 + (-z).exp()))
    }
}

/// Reads a probability the snapshot producer attached under the model's name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotModel {
    pub name: String,
}

impl SignalModel for SnapshotModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, snapshot: &MarketSnapshot) -> MLResult<f64> {
        snapshot
            .model_probabilities
            .get(&self.name)
            .copied()
            .ok_or_else(|| {
                MLError::Model(format!(
                    "snapshot for {} carries no probability for {}",
                    snapshot.symbol, self.name
                ))
            })
    }
}

/// JSON model definition, e.g.
/// `{"kind": "linear", "name": "trend", "weight": 1.0, "intercept": 0.0, "coefficients": {"trend_spread": 40.0}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSpec {
    Linear {
        name: String,
        weight: f64,
        #[serde(default)]
        intercept: f64,
        coefficients: BTreeMap<Feature, f64>,
    },
    Snapshot {
        name: String,
        weight: f64,
    },
}

impl ModelSpec {
    pub fn build(self) -> WeightedModel {
        match self {
            ModelSpec::Linear {
                name,
                weight,
                intercept,
                coefficients,
            } => WeightedModel::new(
                Arc::new(LinearSignalModel {
                    name,
                    intercept,
                    coefficients,
                }),
                weight,
            ),
            ModelSpec::Snapshot { name, weight } => {
                WeightedModel::new(Arc::new(SnapshotModel { name }), weight)
            }
        }
    }
}

/// Parse a JSON array of model definitions. Weights must be finite and non-negative.
pub fn load_models(json: &str) -> MLResult<Vec<WeightedModel>> {
    let specs: Vec<ModelSpec> = serde_json::from_str(json)?;
    let models: Vec<WeightedModel> = specs.into_iter().map(ModelSpec::build).collect();
    if let Some(bad) = models.iter().find(|m| !m.has_valid_weight()) {
        return Err(MLError::Model(format!(
            "model {} has invalid weight {}",
            bad.model.name(),
            bad.weight
        )));
    }
    Ok(models)
}

/// Neutral-zone and confidence settings of the ML stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlParams {
    /// Half-width of the no-opinion band around 0.5
    pub neutral_zone: f64,
    /// Minimum probability of the predicted side
    pub confidence_threshold: f64,
}

impl Default for MlParams {
    fn default() -> Self {
        Self {
            neutral_zone: 0.05,
            confidence_threshold: 0.55,
        }
    }
}

/// Classification of one ensemble probability
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MlVerdict {
    pub direction: Direction,
    /// |p - 0.5| * 2
    pub confidence: f64,
    /// p for LONG, 1 - p for SHORT
    pub directional_probability: f64,
    pub passed: bool,
}

/// Pure function of (probability, neutral zone, threshold).
///
/// Inside `[0.5 - z, 0.5 + z]` there is no opinion and the verdict fails.
/// Outside it the predicted side's probability must reach the threshold.
pub fn classify(probability: f64, neutral_zone: f64, threshold: f64) -> MlVerdict {
    let confidence = (probability - 0.5).abs() * 2.0;

    if probability >= 0.5 - neutral_zone && probability <= 0.5 + neutral_zone {
        return MlVerdict {
            direction: Direction::Neutral,
            confidence,
            directional_probability: probability.max(1.0 - probability),
            passed: false,
        };
    }

    let (direction, directional_probability) = if probability > 0.5 + neutral_zone {
        (Direction::Long, probability)
    } else {
        (Direction::Short, 1.0 - probability)
    };

    MlVerdict {
        direction,
        confidence,
        directional_probability,
        passed: directional_probability >= threshold,
    }
}

/// ML-ensemble stage
#[derive(Clone)]
pub struct MlEnsembleStage {
    models: Vec<WeightedModel>,
    params: MlParams,
}

impl MlEnsembleStage {
    /// Fails on a negative or non-finite weight, or when configured
    /// models carry no weight at all
    pub fn new(models: Vec<WeightedModel>, params: MlParams) -> PipelineResult<Self> {
        if let Some(bad) = models.iter().find(|m| !m.has_valid_weight()) {
            return Err(PipelineError::config(format!(
                "ml model {} has invalid weight {}",
                bad.model.name(),
                bad.weight
            )));
        }
        if !models.is_empty() && models.iter().map(|m| m.weight).sum::<f64>() <= 0.0 {
            return Err(PipelineError::config("ml model weights sum to zero"));
        }
        Ok(Self { models, params })
    }

    /// Weighted mean of the model probabilities, weights normalized first
    pub fn ensemble_probability(
        &self,
        snapshot: &MarketSnapshot,
    ) -> PipelineResult<(f64, BTreeMap<String, f64>)> {
        let total_weight: f64 = self.models.iter().map(|m| m.weight).sum();
        if total_weight <= 0.0 {
            return Err(PipelineError::stage(
                StageName::MlEnsemble,
                "model weights sum to zero",
            ));
        }

        let mut outputs = BTreeMap::new();
        let mut probability = 0.0;
        for weighted in &self.models {
            let name = weighted.model.name();
            let p = weighted
                .model
                .predict(snapshot)
                .map_err(|e| PipelineError::stage(StageName::MlEnsemble, e.to_string()))?;
            if !(0.0..=1.0).contains(&p) {
                return Err(PipelineError::stage(
                    StageName::MlEnsemble,
                    format!("model {} returned probability {} outside [0, 1]", name, p),
                ));
            }
            probability += p * weighted.weight / total_weight;
            outputs.insert(name.to_string(), p);
        }

        Ok((probability.clamp(0.0, 1.0), outputs))
    }

    pub fn evaluate(&self, ctx: &StageContext<'_>) -> PipelineResult<StageResult> {
        if self.models.is_empty() {
            return Ok(StageResult::fail(
                StageName::MlEnsemble,
                Direction::Neutral,
                0.0,
                "no model configured",
            ));
        }

        let (probability, outputs) = self.ensemble_probability(ctx.snapshot)?;
        let verdict = classify(
            probability,
            self.params.neutral_zone,
            self.params.confidence_threshold,
        );

        let reason = if !verdict.direction.is_directional() {
            format!(
                "P(up)={:.3} inside neutral zone 0.5±{:.3}",
                probability, self.params.neutral_zone
            )
        } else if verdict.passed {
            format!(
                "P(up)={:.3} -> {} (p={:.3} >= {:.3})",
                probability,
                verdict.direction,
                verdict.directional_probability,
                self.params.confidence_threshold
            )
        } else {
            format!(
                "P(up)={:.3} -> {} but p={:.3} < {:.3}",
                probability,
                verdict.direction,
                verdict.directional_probability,
                self.params.confidence_threshold
            )
        };

        let result = if verdict.passed {
            StageResult::pass(StageName::MlEnsemble, verdict.direction, verdict.confidence, reason)
        } else {
            StageResult::fail(StageName::MlEnsemble, verdict.direction, verdict.confidence, reason)
        };

        let models: serde_json::Map<String, serde_json::Value> = outputs
            .into_iter()
            .map(|(name, p)| (name, serde_json::Value::from(p)))
            .collect();

        Ok(result
            .with_detail("probability", probability)
            .with_detail("directional_probability", verdict.directional_probability)
            .with_detail("models", serde_json::Value::Object(models)))
    }
}
