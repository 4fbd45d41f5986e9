use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::FilterViolation;

/// OHLCV bar data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Candle period of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "30m")]
    Minute30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "1d")]
    Day1,
}

impl Timeframe {
    pub fn to_minutes(&self) -> i64 {
        match self {
            Timeframe::Minute1 => 1,
            Timeframe::Minute5 => 5,
            Timeframe::Minute15 => 15,
            Timeframe::Minute30 => 30,
            Timeframe::Hour1 => 60,
            Timeframe::Hour4 => 240,
            Timeframe::Day1 => 1440,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Timeframe::Minute1 => "1m",
            Timeframe::Minute5 => "5m",
            Timeframe::Minute15 => "15m",
            Timeframe::Minute30 => "30m",
            Timeframe::Hour1 => "1h",
            Timeframe::Hour4 => "4h",
            Timeframe::Day1 => "1d",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "1m" => Some(Timeframe::Minute1),
            "5m" => Some(Timeframe::Minute5),
            "15m" => Some(Timeframe::Minute15),
            "30m" => Some(Timeframe::Minute30),
            "1h" => Some(Timeframe::Hour1),
            "4h" => Some(Timeframe::Hour4),
            "1d" => Some(Timeframe::Day1),
            _ => None,
        }
    }
}

/// Directional opinion of a stage or a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
    #[serde(rename = "NONE")]
    Neutral,
}

impl Direction {
    pub fn is_directional(&self) -> bool {
        !matches!(self, Direction::Neutral)
    }

    /// +1 for long, -1 for short, 0 for no opinion
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
            Direction::Neutral => 0.0,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
            Direction::Neutral => Direction::Neutral,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
            Direction::Neutral => "NONE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "LONG" | "BUY" => Some(Direction::Long),
            "SHORT" | "SELL" => Some(Direction::Short),
            "NONE" | "NEUTRAL" => Some(Direction::Neutral),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Precomputed indicator series for a snapshot.
///
/// Every series is aligned to the end of the candle list: the last element
/// belongs to the last candle. Series may be shorter than the candles
/// (warm-up) or empty when there was not enough history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Indicators {
    pub trend_fast: Vec<f64>,
    pub trend_slow: Vec<f64>,
    pub rsi: Vec<f64>,
    pub band_upper: Vec<f64>,
    pub band_middle: Vec<f64>,
    pub band_lower: Vec<f64>,
    pub atr: Vec<f64>,
}

impl Indicators {
    pub fn last_trend_fast(&self) -> Option<f64> {
        self.trend_fast.last().copied()
    }

    pub fn last_trend_slow(&self) -> Option<f64> {
        self.trend_slow.last().copied()
    }

    pub fn last_rsi(&self) -> Option<f64> {
        self.rsi.last().copied()
    }

    pub fn last_atr(&self) -> Option<f64> {
        self.atr.last().copied().filter(|v| *v > 0.0)
    }
}

/// Candles plus indicators for one symbol and timeframe.
/// Shared read-only with every stage of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candles: Vec<Bar>,
    pub indicators: Indicators,
    /// Model probabilities attached by the snapshot producer, keyed by model name
    #[serde(default)]
    pub model_probabilities: BTreeMap<String, f64>,
}

impl MarketSnapshot {
    pub fn new(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        candles: Vec<Bar>,
        indicators: Indicators,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            candles,
            indicators,
            model_probabilities: BTreeMap::new(),
        }
    }

    pub fn with_model_probability(mut self, model: impl Into<String>, probability: f64) -> Self {
        self.model_probabilities.insert(model.into(), probability);
        self
    }

    pub fn last_bar(&self) -> Option<&Bar> {
        self.candles.last()
    }

    pub fn last_close(&self) -> Option<f64> {
        self.candles.last().map(|b| b.close)
    }

    pub fn atr(&self) -> Option<f64> {
        self.indicators.last_atr()
    }
}

/// Identity of a pipeline stage, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    MlEnsemble,
    PriceAction,
    HtfAlignment,
    AiAdjudicator,
}

impl StageName {
    pub const ALL: [StageName; 4] = [
        StageName::MlEnsemble,
        StageName::PriceAction,
        StageName::HtfAlignment,
        StageName::AiAdjudicator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::MlEnsemble => "ml_ensemble",
            StageName::PriceAction => "price_action",
            StageName::HtfAlignment => "htf_alignment",
            StageName::AiAdjudicator => "ai_adjudicator",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        StageName::ALL
            .into_iter()
            .find(|s| s.as_str() == value.trim())
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict of one stage for one evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageName,
    pub passed: bool,
    pub opinion: Direction,
    /// Normalized to 0.0..=1.0
    pub score: f64,
    pub reason: String,
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl StageResult {
    pub fn pass(stage: StageName, opinion: Direction, score: f64, reason: impl Into<String>) -> Self {
        Self {
            stage,
            passed: true,
            opinion,
            score: score.clamp(0.0, 1.0),
            reason: reason.into(),
            details: serde_json::Map::new(),
        }
    }

    pub fn fail(stage: StageName, opinion: Direction, score: f64, reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            ..Self::pass(stage, opinion, score, reason)
        }
    }

    /// Failed result for a stage that returned an error instead of a verdict
    pub fn errored(stage: StageName, error: &crate::PipelineError) -> Self {
        Self::fail(stage, Direction::Neutral, 0.0, error.to_string()).with_detail("error", true)
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Read-only input handed to each stage
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub symbol: &'a str,
    pub snapshot: &'a MarketSnapshot,
    pub higher: Option<&'a MarketSnapshot>,
    /// Direction proposed by the stages that ran before this one
    pub candidate: Direction,
}

/// Outcome of one pipeline run for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: String,
    pub should_enter: bool,
    pub direction: Direction,
    pub confidence: f64, // 0.0 to 1.0
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub risk_reward: Option<f64>,
    pub reason: String,
    pub stage_results: Vec<StageResult>,
    pub passed_stages: Vec<StageName>,
    pub failed_stages: Vec<StageName>,
    /// Disabled stages and an AI stage that was not invoked
    pub skipped_stages: Vec<StageName>,
    /// Wall-clock evaluation time. Not serialized so that decisions built from
    /// identical inputs serialize identically.
    #[serde(skip)]
    pub latency: Duration,
}

/// Quantity rules an exchange publishes for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
}

impl SymbolFilters {
    pub fn new(step_size: Decimal, min_qty: Decimal, min_notional: Decimal) -> Self {
        Self {
            step_size,
            min_qty,
            min_notional,
        }
    }

    /// Largest multiple of the step size not above `quantity`.
    /// `None` when the step count overflows.
    pub fn round_down(&self, quantity: Decimal) -> Option<Decimal> {
        if self.step_size <= Decimal::ZERO {
            return Some(quantity);
        }
        let steps = quantity.checked_div(self.step_size)?.floor();
        Some(steps.checked_mul(self.step_size)?.normalize())
    }

    /// Check a step-rounded quantity against the minimums
    pub fn validate(&self, quantity: Decimal, price: Decimal) -> Result<(), FilterViolation> {
        if quantity <= Decimal::ZERO {
            return Err(FilterViolation::ZeroAfterRounding {
                step_size: self.step_size,
            });
        }
        if quantity < self.min_qty {
            return Err(FilterViolation::BelowMinQuantity {
                quantity,
                min_qty: self.min_qty,
            });
        }
        let notional = quantity * price;
        if notional < self.min_notional {
            return Err(FilterViolation::BelowMinNotional {
                notional,
                min_notional: self.min_notional,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn direction_serializes_as_upper_case() {
        let json = serde_json::to_string(&Direction::Neutral).unwrap();
        assert_eq!(json, "\"NONE\"");
        assert_eq!(Direction::parse("buy"), Some(Direction::Long));
        assert_eq!(Direction::Long.opposite(), Direction::Short);
    }

    #[test]
    fn stage_names_round_trip_through_parse() {
        for stage in StageName::ALL {
            assert_eq!(StageName::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(StageName::parse("unknown"), None);
    }

    #[test]
    fn round_down_lands_on_step_multiple() {
        let filters = SymbolFilters::new(dec!(0.001), dec!(0.001), dec!(5));
        assert_eq!(filters.round_down(dec!(0.0014286)), Some(dec!(0.001)));

        let fine = SymbolFilters::new(dec!(0.0001), dec!(0.0001), dec!(5));
        assert_eq!(fine.round_down(dec!(0.0014286)), Some(dec!(0.0014)));
    }

    #[test]
    fn validate_reports_the_violated_minimum() {
        let filters = SymbolFilters::new(dec!(0.001), dec!(0.002), dec!(100));
        assert!(matches!(
            filters.validate(dec!(0.001), dec!(70000)),
            Err(FilterViolation::BelowMinQuantity { .. })
        ));

        let filters = SymbolFilters::new(dec!(0.001), dec!(0.001), dec!(100));
        assert!(matches!(
            filters.validate(dec!(0.001), dec!(70000)),
            Err(FilterViolation::BelowMinNotional { .. })
        ));
        assert!(filters.validate(dec!(0.002), dec!(70000)).is_ok());
        assert!(matches!(
            filters.validate(Decimal::ZERO, dec!(70000)),
            Err(FilterViolation::ZeroAfterRounding { .. })
        ));
    }

    #[test]
    fn stage_result_clamps_score() {
        let result = StageResult::pass(StageName::PriceAction, Direction::Long, 1.7, "ok");
        assert_eq!(result.score, 1.0);
        let failed = StageResult::fail(StageName::PriceAction, Direction::Long, -0.2, "bad");
        assert!(!failed.passed);
        assert_eq!(failed.score, 0.0);
    }
}
