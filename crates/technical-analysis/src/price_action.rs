use analysis_core::{
    Direction, MarketSnapshot, PipelineError, PipelineResult, StageContext, StageName, StageResult,
};
use serde::{Deserialize, Serialize};

use crate::indicators::{average_volume, recent_range};

const MAX_SCORE: u32 = 8;

/// Tuning for the smart-entry heuristics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceActionParams {
    pub min_score: u32,
    /// Trend-average steps inspected for slope consistency
    pub slope_lookback: usize,
    /// Share of those steps that must move with the trend
    pub slope_consistency: f64,
    pub range_lookback: usize,
    /// "Near support/resistance" distance, in ATRs
    pub proximity_atr: f64,
    /// Minimum clear room to the opposing level, in ATRs
    pub room_atr: f64,
    pub volume_lookback: usize,
    pub volume_confirm_ratio: f64,
    pub volume_strong_ratio: f64,
}

impl Default for PriceActionParams {
    fn default() -> Self {
        Self {
            min_score: 5,
            slope_lookback: 5,
            slope_consistency: 0.8,
            range_lookback: 20,
            proximity_atr: 1.0,
            room_atr: 1.5,
            volume_lookback: 20,
            volume_confirm_ratio: 1.0,
            volume_strong_ratio: 1.5,
        }
    }
}

/// Points awarded by each heuristic
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub direction: Direction,
    pub trend: u32,    // 0-3
    pub levels: u32,   // 0-2
    pub volume: u32,   // 0-2
    pub momentum: u32, // 0-1
    pub volume_ratio: Option<f64>,
}

impl ScoreBreakdown {
    pub fn total(&self) -> u32 {
        self.trend + self.levels + self.volume + self.momentum
    }
}

/// Smart-entry stage: trend slope, support/resistance and volume heuristics
#[derive(Debug, Clone, Default)]
pub struct PriceActionStage {
    params: PriceActionParams,
}

impl PriceActionStage {
    pub fn new(params: PriceActionParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &PriceActionParams {
        &self.params
    }

    pub fn evaluate(&self, ctx: &StageContext<'_>) -> PipelineResult<StageResult> {
        let breakdown = self.score(ctx.snapshot)?;
        let total = breakdown.total();
        let normalized = total as f64 / MAX_SCORE as f64;

        let result = if !breakdown.direction.is_directional() {
            StageResult::fail(
                StageName::PriceAction,
                Direction::Neutral,
                0.0,
                "trend averages are flat, no entry direction",
            )
        } else if total >= self.params.min_score {
            StageResult::pass(
                StageName::PriceAction,
                breakdown.direction,
                normalized,
                format!(
                    "price action {}/{} >= {} ({})",
                    total, MAX_SCORE, self.params.min_score, breakdown.direction
                ),
            )
        } else {
            StageResult::fail(
                StageName::PriceAction,
                breakdown.direction,
                normalized,
                format!(
                    "price action {}/{} < {} ({})",
                    total, MAX_SCORE, self.params.min_score, breakdown.direction
                ),
            )
        };

        Ok(result
            .with_detail("raw_score", total)
            .with_detail("max_score", MAX_SCORE)
            .with_detail("trend_points", breakdown.trend)
            .with_detail("level_points", breakdown.levels)
            .with_detail("volume_points", breakdown.volume)
            .with_detail("momentum_points", breakdown.momentum)
            .with_detail(
                "volume_ratio",
                breakdown
                    .volume_ratio
                    .map(serde_json::Value::from)
                    .unwrap_or(serde_json::Value::Null),
            ))
    }

    /// Deterministic score from the snapshot alone
    pub fn score(&self, snapshot: &MarketSnapshot) -> PipelineResult<ScoreBreakdown> {
        let bar = snapshot
            .last_bar()
            .ok_or_else(|| PipelineError::stage(StageName::PriceAction, "snapshot has no candles"))?;

        let fast = &snapshot.indicators.trend_fast;
        let slow = snapshot.indicators.last_trend_slow();
        let lookback = self.params.slope_lookback.max(1);

        let (Some(fast_last), Some(slow_last)) = (fast.last().copied(), slow) else {
            return Err(PipelineError::stage(
                StageName::PriceAction,
                "trend averages unavailable",
            ));
        };
        if fast.len() < lookback + 1 {
            return Err(PipelineError::stage(
                StageName::PriceAction,
                format!("need {} trend values, have {}", lookback + 1, fast.len()),
            ));
        }

        let direction = if fast_last > slow_last {
            Direction::Long
        } else if fast_last < slow_last {
            Direction::Short
        } else {
            Direction::Neutral
        };

        if !direction.is_directional() {
            return Ok(ScoreBreakdown {
                direction,
                trend: 0,
                levels: 0,
                volume: 0,
                momentum: 0,
                volume_ratio: None,
            });
        }

        let sign = direction.sign();
        let window = &fast[fast.len() - lookback - 1..];

        let mut trend = 0;
        if (window[lookback] - window[0]) * sign > 0.0 {
            trend += 1;
        }
        let with_trend = window
            .windows(2)
            .filter(|w| (w[1] - w[0]) * sign > 0.0)
            .count();
        if with_trend as f64 / lookback as f64 >= self.params.slope_consistency {
            trend += 1;
        }
        if (bar.close - slow_last) * sign > 0.0 {
            trend += 1;
        }

        let levels = self.level_points(snapshot, direction);

        let volume_ratio =
            average_volume(&snapshot.candles, self.params.volume_lookback).map(|avg| bar.volume / avg);
        let volume = match volume_ratio {
            Some(r) if r >= self.params.volume_strong_ratio => 2,
            Some(r) if r >= self.params.volume_confirm_ratio => 1,
            _ => 0,
        };

        let momentum = match (snapshot.indicators.last_rsi(), direction) {
            (Some(rsi), Direction::Long) if (50.0..=70.0).contains(&rsi) => 1,
            (Some(rsi), Direction::Short) if (30.0..=50.0).contains(&rsi) => 1,
            _ => 0,
        };

        Ok(ScoreBreakdown {
            direction,
            trend,
            levels,
            volume,
            momentum,
            volume_ratio,
        })
    }

    // One point for entering near the level behind the trade, one for clear
    // room (or a breakout) toward the level in front of it.
    fn level_points(&self, snapshot: &MarketSnapshot, direction: Direction) -> u32 {
        let (Some(range), Some(atr), Some(close)) = (
            recent_range(&snapshot.candles, self.params.range_lookback),
            snapshot.atr(),
            snapshot.last_close(),
        ) else {
            return 0;
        };

        let (behind, ahead) = match direction {
            Direction::Long => (close - range.support, range.resistance - close),
            Direction::Short => (range.resistance - close, close - range.support),
            Direction::Neutral => return 0,
        };

        let mut points = 0;
        if behind >= 0.0 && behind <= self.params.proximity_atr * atr {
            points += 1;
        }
        if ahead <= 0.0 || ahead >= self.params.room_atr * atr {
            points += 1;
        }
        points
    }
}
