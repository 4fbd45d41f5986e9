use analysis_core::{
    Bar, Direction, MarketSnapshot, PipelineError, PipelineResult, StageContext, StageName,
    StageResult,
};
use log::debug;
use serde::{Deserialize, Serialize};

/// Higher-timeframe alignment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HtfParams {
    /// Gate on alignment (true) or report it only (false)
    pub require_alignment: bool,
    /// Trend-average steps used to confirm the slope
    pub slope_lookback: usize,
    /// SMA periods used when the snapshot carries no trend averages
    pub fast_period: usize,
    pub slow_period: usize,
}

impl Default for HtfParams {
    fn default() -> Self {
        Self {
            require_alignment: true,
            slope_lookback: 3,
            fast_period: 10,
            slow_period: 20,
        }
    }
}

/// Trend read from a higher-timeframe snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HigherTrend {
    pub direction: Direction,
    /// Fast average moving in the trend direction
    pub slope_agrees: bool,
    /// |fast - slow| relative to price
    pub separation: f64,
}

impl HigherTrend {
    /// Alignment score against a candidate direction (0.0 to 1.0)
    pub fn alignment_score(&self, candidate: Direction) -> f64 {
        if !candidate.is_directional() || self.direction != candidate {
            return 0.0;
        }
        if self.slope_agrees {
            1.0
        } else {
            0.6
        }
    }
}

/// Read the trend of a snapshot from its fast/slow trend averages.
///
/// Falls back to SMAs of the raw closes when the snapshot was built without
/// indicators. Returns `None` when neither source has enough history.
pub fn read_trend(snapshot: &MarketSnapshot, params: &HtfParams) -> Option<HigherTrend> {
    let ind = &snapshot.indicators;
    let (fast, slow, slope_agrees_sign) = match (ind.last_trend_fast(), ind.last_trend_slow()) {
        (Some(fast), Some(slow)) => {
            let slope = if ind.trend_fast.len() > params.slope_lookback {
                Some(fast - ind.trend_fast[ind.trend_fast.len() - 1 - params.slope_lookback])
            } else {
                None
            };
            (fast, slow, slope)
        }
        _ => {
            debug!(
                "No trend averages on {} {}, using close SMAs",
                snapshot.symbol,
                snapshot.timeframe.name()
            );
            let fast = calculate_sma(&snapshot.candles, params.fast_period)?;
            let slow = calculate_sma(&snapshot.candles, params.slow_period)?;
            let earlier = snapshot
                .candles
                .len()
                .checked_sub(params.slope_lookback)
                .and_then(|end| calculate_sma(&snapshot.candles[..end], params.fast_period));
            (fast, slow, earlier.map(|e| fast - e))
        }
    };

    // Uptrend if short-term MA > long-term MA
    let direction = if fast > slow {
        Direction::Long
    } else if fast < slow {
        Direction::Short
    } else {
        Direction::Neutral
    };

    let price = snapshot.last_close().unwrap_or(slow);
    let separation = if price > 0.0 {
        (fast - slow).abs() / price
    } else {
        0.0
    };

    Some(HigherTrend {
        direction,
        slope_agrees: slope_agrees_sign
            .map(|s| s * direction.sign() > 0.0)
            .unwrap_or(false),
        separation,
    })
}

/// SMA of the last `period` closes
fn calculate_sma(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period {
        return None;
    }

    let recent = &bars[bars.len() - period..];
    Some(recent.iter().map(|b| b.close).sum::<f64>() / period as f64)
}

/// HTF-alignment stage: candidate direction versus the higher-timeframe trend
#[derive(Debug, Clone, Default)]
pub struct HtfAlignmentStage {
    params: HtfParams,
}

impl HtfAlignmentStage {
    pub fn new(params: HtfParams) -> Self {
        Self { params }
    }

    /// Whether a mismatch blocks the entry
    pub fn is_gate(&self) -> bool {
        self.params.require_alignment
    }

    pub fn evaluate(&self, ctx: &StageContext<'_>) -> PipelineResult<StageResult> {
        let gate = self.params.require_alignment;
        let candidate = ctx.candidate;

        let Some(higher) = ctx.higher else {
            let reason = "no higher-timeframe snapshot";
            return Ok(if gate {
                StageResult::fail(StageName::HtfAlignment, Direction::Neutral, 0.0, reason)
            } else {
                StageResult::pass(StageName::HtfAlignment, Direction::Neutral, 0.0, reason)
                    .with_detail("informative", true)
            });
        };

        let Some(trend) = read_trend(higher, &self.params) else {
            if gate {
                return Err(PipelineError::stage(
                    StageName::HtfAlignment,
                    format!(
                        "not enough {} history on {} to read a trend",
                        higher.timeframe.name(),
                        higher.symbol
                    ),
                ));
            }
            return Ok(StageResult::pass(
                StageName::HtfAlignment,
                Direction::Neutral,
                0.0,
                "higher-timeframe trend unreadable",
            )
            .with_detail("informative", true));
        };

        let score = trend.alignment_score(candidate);
        let aligned = score > 0.0;
        let tf = higher.timeframe.name();

        let result = if !gate {
            StageResult::pass(
                StageName::HtfAlignment,
                trend.direction,
                score,
                format!(
                    "{} trend {} ({} candidate {})",
                    tf,
                    trend.direction,
                    if aligned { "agrees with" } else { "does not confirm" },
                    candidate
                ),
            )
            .with_detail("informative", true)
        } else if !candidate.is_directional() {
            StageResult::fail(
                StageName::HtfAlignment,
                trend.direction,
                0.0,
                "no candidate direction to align with",
            )
        } else if aligned {
            StageResult::pass(
                StageName::HtfAlignment,
                trend.direction,
                score,
                format!("{} trend {} agrees with candidate", tf, trend.direction),
            )
        } else {
            StageResult::fail(
                StageName::HtfAlignment,
                trend.direction,
                0.0,
                format!("{} trend {} opposes candidate {}", tf, trend.direction, candidate),
            )
        };

        Ok(result
            .with_detail("htf_timeframe", tf)
            .with_detail("aligned", aligned)
            .with_detail("slope_agrees", trend.slope_agrees)
            .with_detail("separation", trend.separation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_core::{Indicators, Timeframe};
    use chrono::{Duration, TimeZone, Utc};

    fn trending_bars(count: usize, step: f64) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        (0..count)
            .map(|i| {
                let close = 100.0 + step * i as f64;
                Bar {
                    timestamp: start + Duration::hours(4 * i as i64),
                    open: close,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 1000.0,
                }
            })
            .collect()
    }

    fn higher(step: f64) -> MarketSnapshot {
        MarketSnapshot::new(
            "BTCUSDT",
            Timeframe::Hour4,
            trending_bars(30, step),
            Indicators::default(),
        )
    }

    fn ctx<'a>(
        primary: &'a MarketSnapshot,
        higher: Option<&'a MarketSnapshot>,
        candidate: Direction,
    ) -> StageContext<'a> {
        StageContext {
            symbol: "BTCUSDT",
            snapshot: primary,
            higher,
            candidate,
        }
    }

    #[test]
    fn test_trend_detection_from_closes() {
        let params = HtfParams::default();
        let up = read_trend(&higher(1.0), &params).unwrap();
        assert_eq!(up.direction, Direction::Long);
        assert!(up.slope_agrees);

        let down = read_trend(&higher(-1.0), &params).unwrap();
        assert_eq!(down.direction, Direction::Short);
        assert!(down.slope_agrees);
    }

    #[test]
    fn test_trend_prefers_precomputed_averages() {
        let mut snap = higher(1.0);
        snap.indicators.trend_fast = vec![110.0, 109.0, 108.0, 107.0];
        snap.indicators.trend_slow = vec![112.0];

        let trend = read_trend(&snap, &HtfParams::default()).unwrap();
        assert_eq!(trend.direction, Direction::Short);
        assert!(trend.slope_agrees);
    }

    #[test]
    fn test_aligned_passes() {
        let primary = higher(1.0);
        let htf = higher(1.0);
        let result = HtfAlignmentStage::default()
            .evaluate(&ctx(&primary, Some(&htf), Direction::Long))
            .unwrap();

        assert!(result.passed);
        assert_eq!(result.opinion, Direction::Long);
        assert_eq!(result.score, 1.0);
    }

    #[test]
    fn test_mismatch_blocks_when_required() {
        let primary = higher(1.0);
        let htf = higher(-1.0);
        let result = HtfAlignmentStage::default()
            .evaluate(&ctx(&primary, Some(&htf), Direction::Long))
            .unwrap();

        assert!(!result.passed);
        assert_eq!(result.opinion, Direction::Short);
    }

    #[test]
    fn test_mismatch_is_informative_when_not_required() {
        let primary = higher(1.0);
        let htf = higher(-1.0);
        let stage = HtfAlignmentStage::new(HtfParams {
            require_alignment: false,
            ..Default::default()
        });
        assert!(!stage.is_gate());

        let result = stage
            .evaluate(&ctx(&primary, Some(&htf), Direction::Long))
            .unwrap();
        assert!(result.passed);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.details["informative"], true);
    }

    #[test]
    fn test_missing_higher_snapshot() {
        let primary = higher(1.0);
        let required = HtfAlignmentStage::default()
            .evaluate(&ctx(&primary, None, Direction::Long))
            .unwrap();
        assert!(!required.passed);

        let informative = HtfAlignmentStage::new(HtfParams {
            require_alignment: false,
            ..Default::default()
        })
        .evaluate(&ctx(&primary, None, Direction::Long))
        .unwrap();
        assert!(informative.passed);
    }

    #[test]
    fn test_short_history_errors_when_required() {
        let primary = higher(1.0);
        let mut htf = higher(1.0);
        htf.candles.truncate(5);

        let err = HtfAlignmentStage::default()
            .evaluate(&ctx(&primary, Some(&htf), Direction::Long))
            .unwrap_err();
        assert!(err.to_string().contains("not enough"));
    }
}
