//! Strategy trait definition

use async_trait::async_trait;
use serde::Serialize;

use super::journal::Journal;
use crate::bars::Bar;
use crate::consts::STOP_SAFETY_MARGIN;
use crate::controller::RetryPolicy;
use crate::errors::Result;
use crate::indicators::IndicatorConfig;

/// A trading plan driven one bar at a time.
///
/// The driver owns the strategy and calls [`Strategy::on_bar`] once per
/// distinct bar, in timestamp order. Each call runs to completion; the
/// strategy talks to the exchange only through its order controller.
///
/// # Lifecycle
///
/// 1. A [`StrategyFactory`](super::StrategyFactory) parses the plan
///    arguments and decides the starting state (fresh search, buying, or
///    recovery of a position found on the exchange)
/// 2. The driver feeds bars until `on_bar` returns `Ok(false)` (plan
///    finished) or an error (fatal, the driver stops)
/// 3. [`Strategy::journal`] holds every decision taken
#[async_trait]
pub trait Strategy: Send {
    /// Plan identifier, as given on the command line
    fn name(&self) -> &str;

    fn pair(&self) -> &str;

    /// Process one bar. Returns `false` once the plan is finished.
    async fn on_bar(&mut self, bar: &Bar) -> Result<bool>;

    /// Snapshot of the state machine
    fn status(&self) -> StrategyStatus;

    fn journal(&self) -> &Journal;
}

/// Point-in-time view of a strategy, for reports and logs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyStatus {
    pub state: String,
    pub capital: f64,
    pub quantity: f64,
    pub entry: Option<f64>,
    pub virtual_stop: Option<f64>,
    pub physical_stop: Option<f64>,
    pub realized: Option<f64>,
}

/// Settings shared by every strategy, from the runtime configuration
#[derive(Debug, Clone, Copy)]
pub struct StrategyOptions {
    pub retry: RetryPolicy,
    /// Physical stops go this fraction below the breaching low
    pub stop_margin: f64,
    pub indicators: IndicatorConfig,
}

impl Default for StrategyOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            stop_margin: STOP_SAFETY_MARGIN,
            indicators: IndicatorConfig::default(),
        }
    }
}
