//! Crate-wide error types

use thiserror::Error;

/// Errors that can occur while driving a trading plan
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Balance too low for the requested order. The only condition the
    /// order controller retries.
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Order placement failed after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("Tape error: {0}")]
    Tape(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),
}

impl Error {
    /// Whether a fresh balance read can resolve this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::InsufficientFunds(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::JsonParse(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Tape(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<clap::Error> for Error {
    fn from(err: clap::Error) -> Self {
        Error::InvalidArgs(err.to_string())
    }
}

/// Result type for crate operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_insufficient_funds_is_retryable() {
        assert!(Error::InsufficientFunds("low".into()).is_retryable());
        assert!(!Error::Exchange("MIN_TRADE_REQUIREMENT_NOT_MET".into()).is_retryable());
        assert!(!Error::Transport("timeout".into()).is_retryable());
        assert!(!Error::OrderNotFound("buy".into()).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = Error::RetriesExhausted {
            attempts: 10,
            reason: "Insufficient funds: 0.5".into(),
        };
        assert_eq!(
            err.to_string(),
            "Order placement failed after 10 attempts: Insufficient funds: 0.5"
        );
    }
}
