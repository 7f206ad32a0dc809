use std::path::PathBuf;
use std::time::Duration;

use config::{Config, File};
use serde::Deserialize;

use crate::consts::{DEFAULT_FEE_RATE, MAX_ORDER_ATTEMPTS, WARMUP_BARS};
use crate::controller::RetryPolicy;
use crate::errors::Result;

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Settings {
    /// Exchange connection (endpoint, credentials)
    #[serde(default)]
    pub exchange: ExchangeConfig,
    /// Polling loop and tape output
    #[serde(default)]
    pub driver: DriverConfig,
    /// Backtest matching parameters
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Order submission retry policy
    #[serde(default)]
    pub retry: RetryConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// In production, load this from ENV variables only
    /// e.g. APP_EXCHANGE__API_KEY=...
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            api_secret: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://bittrex.com".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

/// Where orders go in the live driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriverMode {
    /// Real orders on the exchange
    #[default]
    Live,
    /// Live prices, simulated matching
    Paper,
}

#[derive(Debug, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub mode: DriverMode,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_tape_dir")]
    pub tape_dir: PathBuf,
    #[serde(default = "default_paper_balance")]
    pub paper_balance: f64,
    #[serde(default = "default_paper_balance")]
    pub paper_available: f64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            mode: DriverMode::default(),
            poll_interval_secs: default_poll_interval_secs(),
            tape_dir: default_tape_dir(),
            paper_balance: default_paper_balance(),
            paper_available: default_paper_balance(),
        }
    }
}

impl DriverConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_tape_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_paper_balance() -> f64 {
    100.0
}

#[derive(Debug, Deserialize)]
pub struct SimulationConfig {
    /// Commission as a fraction of the filled notional
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,
    /// Bars kept as history before replay starts
    #[serde(default = "default_warmup_bars")]
    pub warmup_bars: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            fee_rate: default_fee_rate(),
            warmup_bars: default_warmup_bars(),
        }
    }
}

fn default_fee_rate() -> f64 {
    DEFAULT_FEE_RATE
}

fn default_warmup_bars() -> usize {
    WARMUP_BARS
}

#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub cancel_confirm_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: 0,
            cancel_confirm_attempts: default_max_attempts(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff: Duration::from_millis(self.backoff_ms),
            cancel_confirm_attempts: self.cancel_confirm_attempts.max(1),
        }
    }
}

fn default_max_attempts() -> u32 {
    MAX_ORDER_ATTEMPTS
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// `APP_` prefix, `__` between section and key, e.g. APP_EXCHANGE__API_SECRET=...
fn environment() -> config::Environment {
    config::Environment::with_prefix("APP")
        .prefix_separator("_")
        .separator("__")
}

impl Settings {
    /// Load settings from an optional configuration file
    pub fn new(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path));
        }
        let s = builder
            // Environment variables override the file
            .add_source(environment())
            .build()?;

        Ok(s.try_deserialize()?)
    }

    /// Initialise env_logger, letting RUST_LOG win over the configured level
    pub fn init_logging(&self) {
        env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(self.log.level.as_str()),
        )
        .try_init()
        .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.driver.mode, DriverMode::Live);
        assert_eq!(settings.driver.poll_interval(), Duration::from_secs(30));
        assert_eq!(settings.simulation.fee_rate, 0.0025);
        assert_eq!(settings.simulation.warmup_bars, 20);
        assert_eq!(settings.retry.policy().max_attempts, 10);
        assert_eq!(settings.log.level, "info");
    }

    #[test]
    fn test_environment_keys() {
        let mut vars = config::Map::new();
        vars.insert("APP_EXCHANGE__API_SECRET".to_string(), "s3cret".to_string());
        vars.insert("APP_DRIVER__MODE".to_string(), "paper".to_string());
        let settings: Settings = Config::builder()
            .add_source(environment().source(Some(vars)))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(settings.exchange.api_secret, "s3cret");
        assert_eq!(settings.driver.mode, DriverMode::Paper);
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join("tbot_settings_test.toml");
        std::fs::write(
            &path,
            "[driver]\nmode = \"paper\"\npoll_interval_secs = 5\n\n[retry]\nmax_attempts = 3\n",
        )
        .unwrap();

        let settings = Settings::new(path.to_str()).unwrap();
        assert_eq!(settings.driver.mode, DriverMode::Paper);
        assert_eq!(settings.driver.poll_interval_secs, 5);
        assert_eq!(settings.retry.policy().max_attempts, 3);
        assert_eq!(settings.simulation.fee_rate, 0.0025);

        std::fs::remove_file(&path).ok();
    }
}
