//! Recorded bar tape
//!
//! A live run writes every distinct bar it processed, together with the
//! plan, pair, starting position and arguments, so the run can be replayed
//! offline. The file is a single gzip-compressed JSON line.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use serde::{Deserialize, Serialize};

use crate::bars::Bar;
use crate::errors::{Error, Result};
use crate::market::Position;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tape {
    pub candles: Vec<Bar>,
    /// Strategy identifier the tape was recorded with
    pub plan: String,
    pub pair: String,
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub available: f64,
    /// Strategy arguments, pair first
    #[serde(default)]
    pub args: Vec<String>,
}

impl Tape {
    /// Empty tape for a run starting with `position`
    pub fn new(plan: &str, pair: &str, position: Position, args: Vec<String>) -> Self {
        Self {
            candles: Vec::new(),
            plan: plan.to_string(),
            pair: pair.to_string(),
            balance: position.balance,
            available: position.available,
            args,
        }
    }

    /// Tape over existing candles with no starting position
    pub fn from_candles(candles: Vec<Bar>, plan: &str, pair: &str, args: Vec<String>) -> Self {
        Self {
            candles,
            ..Self::new(plan, pair, Position::default(), args)
        }
    }

    pub fn record(&mut self, bar: Bar) {
        self.candles.push(bar);
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn position(&self) -> Position {
        Position {
            balance: self.balance,
            available: self.available,
        }
    }

    /// `<pair>-<first bar timestamp>.trade`
    pub fn file_name(&self) -> Option<String> {
        self.candles
            .first()
            .map(|bar| format!("{}-{}.trade", self.pair, bar.timestamp.format("%Y-%m-%dT%H:%M:%S")))
    }

    /// First bar to feed: the first at or after `start`, else `warmup`.
    /// Earlier bars are history the strategy starts with.
    pub fn start_index(&self, start: Option<NaiveDateTime>, warmup: usize) -> usize {
        let idx = start
            .and_then(|start| self.candles.iter().position(|bar| bar.timestamp >= start))
            .unwrap_or(warmup);
        idx.min(self.candles.len())
    }

    /// Save under `dir` with the standard file name
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let name = self
            .file_name()
            .ok_or_else(|| Error::Tape("nothing recorded".to_string()))?;
        let path = dir.join(name);
        self.write_to(&path)?;
        Ok(path)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let mut encoder = GzEncoder::new(File::create(path)?, Compression::default());
        serde_json::to_writer(&mut encoder, self)?;
        encoder.write_all(b"\n")?;
        encoder.finish()?;
        info!("Trade saved in {} ({} bars)", path.display(), self.candles.len());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(GzDecoder::new(File::open(path)?));
        let line = reader
            .lines()
            .next()
            .ok_or_else(|| Error::Tape(format!("{} is empty", path.display())))??;
        Ok(serde_json::from_str(&line)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bars::tests::{bar, ts};

    fn tape() -> Tape {
        let mut tape = Tape::new(
            "cut",
            "BTC-ETH",
            Position { balance: 2.0, available: 1.5 },
            vec!["BTC-ETH".into(), "ALL".into(), "90".into(), "110".into()],
        );
        for i in 0..30 {
            tape.record(bar(i, 100.0, 101.0, 99.0, 100.5));
        }
        tape
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir();
        let tape = tape();
        let path = tape.save(&dir).unwrap();
        assert!(path.ends_with("BTC-ETH-2018-01-10T00:00:00.trade"));

        let loaded = Tape::load(&path).unwrap();
        assert_eq!(loaded, tape);
        assert_eq!(loaded.position(), Position { balance: 2.0, available: 1.5 });
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_reads_exchange_keys() {
        let json = r#"{"candles":[{"T":"2018-01-10T00:05:00","O":1.0,"H":2.0,"L":0.5,"C":1.5,"V":3.0,"BV":4.5}],
            "plan":"auto_bb","pair":"BTC-ETH","args":["BTC-ETH","1","5"]}"#;
        let tape: Tape = serde_json::from_str(json).unwrap();
        assert_eq!(tape.candles[0].timestamp, ts(0, 5));
        assert_eq!(tape.candles[0].base_volume, 4.5);
        assert_eq!(tape.balance, 0.0);
    }

    #[test]
    fn test_start_index() {
        let tape = tape();
        assert_eq!(tape.start_index(None, 20), 20);
        assert_eq!(tape.start_index(Some(ts(0, 7)), 20), 7);
        // past the end of the tape
        assert_eq!(tape.start_index(Some(ts(5, 0)), 20), 20);
        assert_eq!(tape.start_index(None, 50), 30);
        assert!(Tape::from_candles(Vec::new(), "cut", "BTC-ETH", Vec::new()).save(Path::new(".")).is_err());
    }
}
