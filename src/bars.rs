//! Price bars and the append-only bar series

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// One OHLCV sample over a fixed period.
///
/// Serialized with the exchange's short keys so recorded tapes keep the
/// wire layout of the candle endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    #[serde(rename = "T")]
    pub timestamp: NaiveDateTime,
    #[serde(rename = "O")]
    pub open: f64,
    #[serde(rename = "H")]
    pub high: f64,
    #[serde(rename = "L")]
    pub low: f64,
    #[serde(rename = "C")]
    pub close: f64,
    #[serde(rename = "V")]
    pub volume: f64,
    #[serde(rename = "BV", default)]
    pub base_volume: f64,
}

impl Bar {
    pub fn new(timestamp: NaiveDateTime, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            base_volume: volume * close,
        }
    }

    /// Minutes since the Unix epoch
    pub fn epoch_minutes(&self) -> i64 {
        self.timestamp.and_utc().timestamp().div_euclid(60)
    }

    /// Fold a later bar of the same bucket into this one
    fn absorb(&mut self, other: &Bar) {
        self.high = self.high.max(other.high);
        self.low = self.low.min(other.low);
        self.close = other.close;
        self.volume += other.volume;
        self.base_volume += other.base_volume;
    }
}

/// Outcome of appending to a series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarPush {
    /// Strictly newer bar, appended
    Appended,
    /// Same timestamp as the last bar, replaced it
    Merged,
    /// Older than the last bar, dropped
    Rejected,
}

/// Ordered bar sequence for a single pair
#[derive(Debug, Clone, Default)]
pub struct BarSeries {
    bars: Vec<Bar>,
}

impl BarSeries {
    pub fn new() -> Self {
        Self { bars: Vec::new() }
    }

    /// Build a series, applying the same ordering rule as `push`
    pub fn from_bars(bars: impl IntoIterator<Item = Bar>) -> Self {
        let mut series = Self::new();
        for bar in bars {
            series.push(bar);
        }
        series
    }

    /// Append a bar. A bar with the last bar's timestamp is the updated
    /// in-progress bar and replaces it.
    pub fn push(&mut self, bar: Bar) -> BarPush {
        match self.bars.last_mut() {
            Some(last) if bar.timestamp < last.timestamp => BarPush::Rejected,
            Some(last) if bar.timestamp == last.timestamp => {
                *last = bar;
                BarPush::Merged
            }
            _ => {
                self.bars.push(bar);
                BarPush::Appended
            }
        }
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Last fully closed bar at `period_minutes`: the newest bucket is
    /// still forming, so this is the one before it
    pub fn last_closed(&self, period_minutes: u32) -> Option<Bar> {
        let resampled = self.resample(period_minutes);
        resampled.len().checked_sub(2).map(|idx| resampled[idx])
    }

    /// Resample into buckets of `period_minutes`, aligned on the epoch
    pub fn resample(&self, period_minutes: u32) -> Vec<Bar> {
        if period_minutes <= 1 {
            return self.bars.clone();
        }
        let period = i64::from(period_minutes);
        let mut out: Vec<Bar> = Vec::new();
        let mut current_bucket: Option<i64> = None;

        for bar in &self.bars {
            let bucket = bar.epoch_minutes().div_euclid(period);
            if current_bucket == Some(bucket) {
                if let Some(last) = out.last_mut() {
                    last.absorb(bar);
                    continue;
                }
            }
            let mut opened = *bar;
            if let Some(start) = chrono::DateTime::from_timestamp(bucket * period * 60, 0) {
                opened.timestamp = start.naive_utc();
            }
            out.push(opened);
            current_bucket = Some(bucket);
        }
        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::NaiveDate;

    pub(crate) fn ts(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2018, 1, 10)
            .and_then(|d| d.and_hms_opt(hour, minute, 0))
            .unwrap()
    }

    pub(crate) fn bar(minute: u32, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar::new(ts(minute / 60, minute % 60), open, high, low, close, 10.0)
    }

    #[test]
    fn test_push_ordering() {
        let mut series = BarSeries::new();
        assert_eq!(series.push(bar(0, 1.0, 2.0, 0.5, 1.5)), BarPush::Appended);
        assert_eq!(series.push(bar(1, 1.5, 2.5, 1.0, 2.0)), BarPush::Appended);
        assert_eq!(series.push(bar(1, 1.5, 3.0, 1.0, 2.8)), BarPush::Merged);
        assert_eq!(series.push(bar(0, 9.0, 9.0, 9.0, 9.0)), BarPush::Rejected);
        assert_eq!(series.len(), 2);
        assert_eq!(series.last().unwrap().high, 3.0);
    }

    #[test]
    fn test_resample_ohlcv() {
        let series = BarSeries::from_bars(vec![
            bar(0, 1.0, 2.0, 0.5, 1.5),
            bar(1, 1.5, 3.0, 1.0, 2.0),
            bar(2, 2.0, 2.2, 0.2, 1.0),
            bar(3, 1.0, 1.1, 0.9, 1.05),
        ]);
        let resampled = series.resample(3);
        assert_eq!(resampled.len(), 2);

        let first = &resampled[0];
        assert_eq!(first.timestamp, ts(0, 0));
        assert_eq!(first.open, 1.0);
        assert_eq!(first.high, 3.0);
        assert_eq!(first.low, 0.2);
        assert_eq!(first.close, 1.0);
        assert_eq!(first.volume, 30.0);

        let second = &resampled[1];
        assert_eq!(second.timestamp, ts(0, 3));
        assert_eq!(second.close, 1.05);

        assert_eq!(series.last_closed(3).unwrap().timestamp, ts(0, 0));
        assert!(series.last_closed(60).is_none());
    }

    #[test]
    fn test_resample_aligns_bucket_start() {
        let series = BarSeries::from_bars(vec![bar(7, 1.0, 1.0, 1.0, 1.0), bar(16, 2.0, 2.0, 2.0, 2.0)]);
        let resampled = series.resample(15);
        assert_eq!(resampled.len(), 2);
        assert_eq!(resampled[0].timestamp, ts(0, 0));
        assert_eq!(resampled[1].timestamp, ts(0, 15));
    }

    #[test]
    fn test_bar_serde_keys() {
        let json = r#"{"T":"2018-01-10T00:01:00","O":1.0,"H":2.0,"L":0.5,"C":1.5,"V":10.0,"BV":15.0}"#;
        let parsed: Bar = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.timestamp, ts(0, 1));
        assert_eq!(parsed.base_volume, 15.0);
        let back = serde_json::to_string(&parsed).unwrap();
        assert!(back.contains("\"BV\":15.0"));
    }
}
