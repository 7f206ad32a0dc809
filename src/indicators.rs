//! Derived series over a bar sequence
//!
//! Pure functions: the same bars always give the same rows. Values are
//! `None` until the look-back window is filled.

use crate::bars::{Bar, BarSeries};

/// Look-back lengths for every derived column
#[derive(Debug, Clone, Copy)]
pub struct IndicatorConfig {
    pub band_length: usize,
    pub band_deviations: f64,
    pub volume_length: usize,
    pub rsi_length: usize,
    pub atr_length: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            band_length: 20,
            band_deviations: 2.0,
            volume_length: 20,
            rsi_length: 14,
            atr_length: 20,
        }
    }
}

/// One bar with its derived columns, aligned by timestamp
#[derive(Debug, Clone, Copy)]
pub struct IndicatorRow {
    pub bar: Bar,
    pub bb_middle: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_lower: Option<f64>,
    /// Normalised band width: (upper - lower) / middle
    pub bb_width: Option<f64>,
    pub volume_ma: Option<f64>,
    pub rsi: Option<f64>,
    /// Volatility-based stop level
    pub atr_stop: Option<f64>,
}

/// Compute every column for `bars`
pub fn evaluate(bars: &[Bar], config: &IndicatorConfig) -> Vec<IndicatorRow> {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

    let middle = sma(&closes, config.band_length);
    let deviation = rolling_std(&closes, config.band_length);
    let volume_ma = sma(&volumes, config.volume_length);
    let rsi = rsi(&closes, config.rsi_length);
    let atr_stop = atr_stop(bars, config.atr_length);

    bars.iter()
        .enumerate()
        .map(|(i, bar)| {
            let bands = middle[i].zip(deviation[i]).map(|(m, sd)| {
                let spread = sd * config.band_deviations;
                (m, m + spread, m - spread, 2.0 * spread / m)
            });
            IndicatorRow {
                bar: *bar,
                bb_middle: bands.map(|b| b.0),
                bb_upper: bands.map(|b| b.1),
                bb_lower: bands.map(|b| b.2),
                bb_width: bands.map(|b| b.3),
                volume_ma: volume_ma[i],
                rsi: rsi[i],
                atr_stop: atr_stop[i],
            }
        })
        .collect()
}

/// Indicator row of the last fully closed `period_minutes` bar of `series`.
/// The newest bucket is still forming and is never evaluated on its own.
pub fn last_closed_row(series: &BarSeries, period_minutes: u32, config: &IndicatorConfig) -> Option<IndicatorRow> {
    let resampled = series.resample(period_minutes);
    let idx = resampled.len().checked_sub(2)?;
    evaluate(&resampled, config).get(idx).copied()
}

/// Simple moving average
pub fn sma(values: &[f64], length: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if length == 0 {
        return out;
    }
    for i in (length.saturating_sub(1))..values.len() {
        let window = &values[i + 1 - length..=i];
        out[i] = Some(window.iter().sum::<f64>() / length as f64);
    }
    out
}

/// Rolling sample standard deviation (n - 1)
pub fn rolling_std(values: &[f64], length: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if length < 2 {
        return out;
    }
    for i in (length - 1)..values.len() {
        let window = &values[i + 1 - length..=i];
        let mean = window.iter().sum::<f64>() / length as f64;
        let variance = window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (length - 1) as f64;
        out[i] = Some(variance.sqrt());
    }
    out
}

/// Wilder relative strength index
pub fn rsi(closes: &[f64], length: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if length == 0 || closes.len() <= length {
        return out;
    }

    let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let mut avg_gain = changes[..length].iter().map(|c| c.max(0.0)).sum::<f64>() / length as f64;
    let mut avg_loss = changes[..length].iter().map(|c| (-c).max(0.0)).sum::<f64>() / length as f64;
    out[length] = Some(rsi_value(avg_gain, avg_loss));

    for (offset, change) in changes[length..].iter().enumerate() {
        let n = length as f64;
        avg_gain = (avg_gain * (n - 1.0) + change.max(0.0)) / n;
        avg_loss = (avg_loss * (n - 1.0) + (-change).max(0.0)) / n;
        out[length + offset + 1] = Some(rsi_value(avg_gain, avg_loss));
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// True range per bar; the first bar has no previous close
pub fn true_range(bars: &[Bar]) -> Vec<f64> {
    bars.iter()
        .enumerate()
        .map(|(i, bar)| {
            let range = bar.high - bar.low;
            match i.checked_sub(1).map(|p| bars[p].close) {
                Some(prev) => range.max((bar.high - prev).abs()).max((bar.low - prev).abs()),
                None => range,
            }
        })
        .collect()
}

/// Average true range smoothed against the previous rolling mean
pub fn atr(bars: &[Bar], length: usize) -> Vec<Option<f64>> {
    let tr = true_range(bars);
    let mean = sma(&tr, length);
    let n = length as f64;
    (0..bars.len())
        .map(|i| {
            let prev = i.checked_sub(1).and_then(|p| mean[p])?;
            Some(((n - 1.0) * prev + tr[i]) / n)
        })
        .collect()
}

/// Lowest of the three previous lows minus a third of the ATR
pub fn atr_stop(bars: &[Bar], length: usize) -> Vec<Option<f64>> {
    let atr = atr(bars, length);
    (0..bars.len())
        .map(|i| {
            let lowest = (1..=3)
                .filter_map(|lag| i.checked_sub(lag).map(|p| bars[p].low))
                .reduce(f64::min)?;
            atr[i].map(|a| lowest - a / 3.0)
        })
        .collect()
}
