use analysis_core::Bar;

/// Simple Moving Average
pub fn sma(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period {
        return vec![];
    }

    data.windows(period)
        .map(|w| w.iter().sum::<f64>() / period as f64)
        .collect()
}

/// Exponential Moving Average, seeded with the SMA of the first `period` values
pub fn ema(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period {
        return vec![];
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut current = data[..period].iter().sum::<f64>() / period as f64;
    let mut result = Vec::with_capacity(data.len() - period + 1);
    result.push(current);

    for value in &data[period..] {
        current = (value - current) * multiplier + current;
        result.push(current);
    }

    result
}

/// Relative Strength Index (Wilder smoothing)
pub fn rsi(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() <= period {
        return vec![];
    }

    let changes: Vec<f64> = data.windows(2).map(|w| w[1] - w[0]).collect();
    let p = period as f64;

    let mut avg_gain = changes[..period].iter().map(|c| c.max(0.0)).sum::<f64>() / p;
    let mut avg_loss = changes[..period].iter().map(|c| (-c).max(0.0)).sum::<f64>() / p;

    let mut result = Vec::with_capacity(changes.len() - period + 1);
    result.push(rsi_value(avg_gain, avg_loss));

    for change in &changes[period..] {
        avg_gain = (avg_gain * (p - 1.0) + change.max(0.0)) / p;
        avg_loss = (avg_loss * (p - 1.0) + (-change).max(0.0)) / p;
        result.push(rsi_value(avg_gain, avg_loss));
    }

    result
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        // Flat series reads as neutral, pure gains as maximum strength
        return if avg_gain == 0.0 { 50.0 } else { 100.0 };
    }
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}

/// Bollinger Bands
#[derive(Debug, Clone, Default)]
pub struct BollingerBands {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

pub fn bollinger_bands(data: &[f64], period: usize, std_dev: f64) -> BollingerBands {
    let middle = sma(data, period);
    if middle.is_empty() {
        return BollingerBands::default();
    }

    let mut upper = Vec::with_capacity(middle.len());
    let mut lower = Vec::with_capacity(middle.len());

    for (window, mean) in data.windows(period).zip(&middle) {
        let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
        let width = variance.sqrt() * std_dev;
        upper.push(mean + width);
        lower.push(mean - width);
    }

    BollingerBands {
        upper,
        middle,
        lower,
    }
}

/// Average True Range (Wilder smoothing)
pub fn atr(bars: &[Bar], period: usize) -> Vec<f64> {
    if period == 0 || bars.len() <= period {
        return vec![];
    }

    let true_ranges: Vec<f64> = bars
        .windows(2)
        .map(|w| {
            let (prev, bar) = (&w[0], &w[1]);
            (bar.high - bar.low)
                .max((bar.high - prev.close).abs())
                .max((bar.low - prev.close).abs())
        })
        .collect();

    let p = period as f64;
    let mut current = true_ranges[..period].iter().sum::<f64>() / p;
    let mut result = Vec::with_capacity(true_ranges.len() - period + 1);
    result.push(current);

    for tr in &true_ranges[period..] {
        current = (current * (p - 1.0) + tr) / p;
        result.push(current);
    }

    result
}

/// Trading range of the bars preceding the latest one
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceRange {
    pub support: f64,
    pub resistance: f64,
}

/// Lowest low and highest high over the `lookback` bars before the last bar.
/// The last bar is excluded so a breakout can be seen against the old range.
pub fn recent_range(bars: &[Bar], lookback: usize) -> Option<PriceRange> {
    if lookback == 0 || bars.len() < lookback + 1 {
        return None;
    }

    let end = bars.len() - 1;
    let window = &bars[end - lookback..end];
    let support = window.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
    let resistance = window.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);

    Some(PriceRange {
        support,
        resistance,
    })
}

/// Mean volume of up to `lookback` bars before the last bar
pub fn average_volume(bars: &[Bar], lookback: usize) -> Option<f64> {
    if lookback == 0 || bars.len() < 2 {
        return None;
    }

    let end = bars.len() - 1;
    let start = end.saturating_sub(lookback);
    let window = &bars[start..end];
    let avg = window.iter().map(|b| b.volume).sum::<f64>() / window.len() as f64;

    if avg > 0.0 {
        Some(avg)
    } else {
        None
    }
}
