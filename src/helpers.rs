//! Price parsing and formatting shared by plan arguments and logs

use std::fmt::Write;

use crate::errors::{Error, Result};

const SATOSHI: f64 = 0.000_000_01;
const MICRO: f64 = 0.000_001;

/// Parse a price argument.
///
/// Accepts a plain decimal (`"0.02"`), a satoshi count (`"13200s"`) or a
/// count of micro-units (`"146.61S"`).
pub fn parse_price(s: &str) -> Result<f64> {
    let s = s.trim();
    let (digits, scale) = if let Some(rest) = s.strip_suffix('s') {
        (rest, SATOSHI)
    } else if let Some(rest) = s.strip_suffix('S') {
        (rest, MICRO)
    } else {
        (s, 1.0)
    };
    let value: f64 = digits
        .parse()
        .map_err(|_| Error::InvalidArgs(format!("invalid price '{}'", s)))?;
    Ok(value * scale)
}

/// Format a price in micro-units, the way plan logs show them
pub fn format_price(value: f64) -> String {
    format!("{:.2}S", value * 1_000_000.0)
}

/// Same as `format_price` but renders a missing level as `None`
pub fn format_opt_price(value: Option<f64>) -> String {
    match value {
        Some(v) => format_price(v),
        None => "None".to_string(),
    }
}

/// Traded asset of a pair, its second half (`BTC-ETH` trades `ETH`)
pub fn asset_of(pair: &str) -> &str {
    pair.split('-').nth(1).unwrap_or(pair)
}

/// Lowercase hex of `bytes`
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}

/// Truncate (not round) to the given number of decimals
pub fn truncate_float(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).trunc() / factor
}
