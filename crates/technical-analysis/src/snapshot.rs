use analysis_core::{Bar, Indicators, MarketSnapshot, Timeframe};
use serde::{Deserialize, Serialize};

use crate::indicators::{atr, bollinger_bands, ema, rsi, sma};

/// Moving average behind the fast and slow trend series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendAverage {
    #[default]
    Sma,
    Ema,
}

impl TrendAverage {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sma" => Some(TrendAverage::Sma),
            "ema" => Some(TrendAverage::Ema),
            _ => None,
        }
    }

    fn series(&self, closes: &[f64], period: usize) -> Vec<f64> {
        match self {
            TrendAverage::Sma => sma(closes, period),
            TrendAverage::Ema => ema(closes, period),
        }
    }
}

/// Periods used when precomputing snapshot indicators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorParams {
    pub trend_average: TrendAverage,
    pub trend_fast: usize,
    pub trend_slow: usize,
    pub rsi_period: usize,
    pub band_period: usize,
    pub band_std_dev: f64,
    pub atr_period: usize,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            trend_average: TrendAverage::Sma,
            trend_fast: 10,
            trend_slow: 20,
            rsi_period: 14,
            band_period: 20,
            band_std_dev: 2.0,
            atr_period: 14,
        }
    }
}

/// Turns a raw candle series into a `MarketSnapshot`
#[derive(Debug, Clone, Default)]
pub struct SnapshotBuilder {
    params: IndicatorParams,
}

impl SnapshotBuilder {
    pub fn new(params: IndicatorParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &IndicatorParams {
        &self.params
    }

    pub fn indicators(&self, candles: &[Bar]) -> Indicators {
        let closes: Vec<f64> = candles.iter().map(|b| b.close).collect();
        let bands = bollinger_bands(&closes, self.params.band_period, self.params.band_std_dev);

        Indicators {
            trend_fast: self.params.trend_average.series(&closes, self.params.trend_fast),
            trend_slow: self.params.trend_average.series(&closes, self.params.trend_slow),
            rsi: rsi(&closes, self.params.rsi_period),
            band_upper: bands.upper,
            band_middle: bands.middle,
            band_lower: bands.lower,
            atr: atr(candles, self.params.atr_period),
        }
    }

    pub fn build(&self, symbol: &str, timeframe: Timeframe, candles: Vec<Bar>) -> MarketSnapshot {
        let indicators = self.indicators(&candles);
        MarketSnapshot::new(symbol, timeframe, candles, indicators)
    }
}
