//! Pieces shared by the manual trading plans (targets, trailing, cut)

use std::str::FromStr;

use crate::bars::Bar;
use crate::consts::EPSILON;
use crate::controller::OrderController;
use crate::errors::{Error, Result};
use crate::helpers::format_price;
use crate::market::{OrderIntent, OrderStatus, Position};

use super::journal::Journal;

/// Quantity argument of a plan: a number or `ALL` of the current balance
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QuantitySpec {
    All,
    Fixed(f64),
}

impl FromStr for QuantitySpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "ALL" {
            return Ok(QuantitySpec::All);
        }
        s.parse::<f64>()
            .ok()
            .filter(|q| *q > 0.0)
            .map(QuantitySpec::Fixed)
            .ok_or_else(|| Error::InvalidArgs(format!("invalid quantity '{}'", s)))
    }
}

impl QuantitySpec {
    /// Resolve against the held position
    pub fn resolve(&self, position: Position) -> Result<f64> {
        match *self {
            QuantitySpec::Fixed(quantity) => Ok(quantity),
            QuantitySpec::All if position.balance <= 0.0 => Err(Error::InvalidPosition(
                "ALL specified and no existing position".to_string(),
            )),
            QuantitySpec::All => Ok(position.balance),
        }
    }
}

/// Result of one bar while waiting for the entry buy
#[derive(Debug, Clone, PartialEq)]
pub enum BuyStep {
    Waiting,
    /// Price went under the stop before the fill; the buy is cancelled
    Invalidated,
    /// Entry filled at this price
    Filled(f64),
}

/// Range buy opening a plan's position.
///
/// The order accepts any price from `entry` up to
/// `entry + (entry - stop) * range`.
#[derive(Debug, Clone)]
pub struct RangeEntry {
    pub stop: f64,
    pub entry: f64,
    pub range: f64,
    pub quantity: f64,
    order_id: Option<String>,
}

impl RangeEntry {
    pub fn new(stop: f64, entry: f64, range: f64, quantity: f64) -> Self {
        Self {
            stop,
            entry,
            range,
            quantity,
            order_id: None,
        }
    }

    pub fn high(&self) -> f64 {
        self.entry + (self.entry - self.stop) * self.range
    }

    /// Submit the buy. Refuses when an order or a position already exists.
    pub async fn place(&mut self, controller: &mut OrderController, journal: &mut Journal) -> Result<()> {
        if controller.has_order() {
            journal.record(None, "There is already an order. Aborting.");
            return Err(Error::InvalidPosition("an order is already open".to_string()));
        }
        let position = controller.position();
        if position.balance > 0.0 {
            journal.record(
                None,
                format!("There is already a position ({:.3}). Not buying.", position.balance),
            );
            return Err(Error::InvalidPosition(format!(
                "existing position of {:.3} {}",
                position.balance,
                controller.asset()
            )));
        }

        let order = controller
            .submit(OrderIntent::BuyLimitRange {
                quantity: self.quantity,
                low: self.entry,
                high: self.high(),
            })
            .await?;
        journal.record(
            None,
            format!(
                "Buying {:.3} @ {}-{}",
                self.quantity,
                format_price(self.entry),
                format_price(self.high())
            ),
        );
        self.order_id = Some(order.id);
        Ok(())
    }

    /// Wait for the buy to fill, or invalidate it when the low breaks the stop
    pub async fn step(&mut self, controller: &mut OrderController, journal: &mut Journal, bar: &Bar) -> Result<BuyStep> {
        controller.reconcile_if_pending().await?;
        let Some(order_id) = self.order_id.clone() else {
            return Err(Error::OrderNotFound("no buy order placed".to_string()));
        };

        if controller.monitor_completion("Buy order ").await? {
            let order = controller.find_closed(&order_id).await?;
            if order.status != OrderStatus::Filled {
                journal.record(Some(bar), "Buy order cancelled outside of the plan");
                return Ok(BuyStep::Invalidated);
            }
            let position = controller.refresh_position().await?;
            if position.balance + EPSILON < order.quantity {
                journal.record(
                    Some(bar),
                    format!(
                        "Not the correct balance: {:.3} instead of more than {:.3}",
                        position.balance, order.quantity
                    ),
                );
                return Ok(BuyStep::Waiting);
            }
            journal.record(
                Some(bar),
                format!("Bought {:.3} @ {} fees {:.8}", order.quantity, format_price(order.fill_price), order.commission),
            );
            return Ok(BuyStep::Filled(order.fill_price));
        }

        if bar.low < self.stop {
            journal.record(
                Some(bar),
                format!(
                    "Trade invalidated (low price {:.8} < {:.8}), cancelling order",
                    bar.low, self.stop
                ),
            );
            if let Some(order) = controller.cancel().await? {
                journal.record(
                    Some(bar),
                    format!(
                        "Buy filled before the cancel: {:.3} @ {}",
                        order.quantity,
                        format_price(order.fill_price)
                    ),
                );
                return Ok(BuyStep::Filled(order.fill_price));
            }
            return Ok(BuyStep::Invalidated);
        }
        Ok(BuyStep::Waiting)
    }
}

/// Journal the plan status line
pub fn record_status(journal: &mut Journal, bar: &Bar, state: &str) {
    journal.record(
        Some(bar),
        format!(
            "{} {} {}-{}",
            state,
            format_price(bar.close),
            format_price(bar.low),
            format_price(bar.high)
        ),
    );
}
