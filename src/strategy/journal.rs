//! Decision journal

use log::info;

use crate::bars::Bar;

/// Every decision a strategy takes, in order.
///
/// Lines are logged at `info` and kept in memory so two runs over the same
/// bars can be compared line by line.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    pair: String,
    lines: Vec<String>,
}

impl Journal {
    pub fn new(pair: &str) -> Self {
        Self {
            pair: pair.to_string(),
            lines: Vec::new(),
        }
    }

    /// Record `msg`, prefixed with the bar time when a bar is in scope
    pub fn record(&mut self, bar: Option<&Bar>, msg: impl AsRef<str>) {
        let line = match bar {
            Some(bar) => format!("{} {} {}", bar.timestamp.format("%H:%M"), self.pair, msg.as_ref()),
            None => format!("{} {}", self.pair, msg.as_ref()),
        };
        info!("{}", line);
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
