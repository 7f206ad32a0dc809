//! Time-of-day gap plan (`ripple`)
//!
//! Notes the open of the midnight bar. At 09:00, when the price sits more
//! than 5 % under it, buys at the close with the whole capital and rests a
//! target sell back at the midnight open. An entry still unfilled at 10:00
//! is cancelled and the plan waits for the next midnight.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Timelike;
use clap::Parser;

use super::journal::Journal;
use super::ledger::PositionLedger;
use super::plan::record_status;
use super::registry::StrategyFactory;
use super::traits::{Strategy, StrategyOptions, StrategyStatus};
use crate::bars::Bar;
use crate::controller::OrderController;
use crate::errors::{Error, Result};
use crate::helpers::{format_opt_price, format_price};
use crate::market::{Gateway, Order, OrderIntent, OrderStatus};

/// Midnight open must exceed the 09:00 close by this factor
const GAP_RATIO: f64 = 1.05;
const BUY_HOUR: u32 = 9;
const CANCEL_HOUR: u32 = 10;

#[derive(Parser, Debug)]
struct RippleArgs {
    /// Pair like BTC-ETH
    pair: String,
    /// Amount of the base currency to trade with
    amount: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RippleState {
    /// Waiting for the midnight bar
    Midnight,
    /// Waiting for 09:00
    Nine,
    Buying,
    /// Target sell resting
    Selling,
}

impl RippleState {
    fn label(&self) -> &'static str {
        match self {
            RippleState::Midnight => "midnight",
            RippleState::Nine => "nine",
            RippleState::Buying => "buying",
            RippleState::Selling => "selling",
        }
    }
}

/// Open of today's midnight bar, or `None` once today's window has passed.
/// The last bar is still forming and is left out.
fn midnight_open(candles: &[Bar]) -> Option<f64> {
    let (last, earlier) = candles.split_last()?;
    if last.timestamp.hour() > CANCEL_HOUR {
        return None;
    }
    earlier
        .iter()
        .rev()
        .find(|b| b.timestamp.hour() == 0 && b.timestamp.minute() == 0)
        .map(|b| b.open)
}

pub struct RippleStrategy {
    name: String,
    controller: OrderController,
    journal: Journal,
    state: RippleState,
    ledger: PositionLedger,
    midnight: Option<f64>,
    target: f64,
    buy_order: Option<String>,
    exit_order: Option<String>,
}

impl RippleStrategy {
    pub async fn new(
        name: &str,
        gateway: Arc<dyn Gateway>,
        args: &[String],
        buy: bool,
        options: &StrategyOptions,
    ) -> Result<Self> {
        let args = RippleArgs::try_parse_from(std::iter::once(name).chain(args.iter().map(String::as_str)))?;
        if args.amount <= 0.0 {
            return Err(Error::InvalidArgs(format!("invalid amount {}", args.amount)));
        }

        let controller = OrderController::new(gateway, &args.pair, options.retry).await?;
        let mut strategy = Self {
            name: name.to_string(),
            controller,
            journal: Journal::new(&args.pair),
            state: RippleState::Midnight,
            ledger: PositionLedger::new(args.amount),
            midnight: None,
            target: 0.0,
            buy_order: None,
            exit_order: None,
        };

        if buy {
            let candles = strategy.controller.candles("oneMin").await?;
            if let Some(price) = midnight_open(&candles) {
                strategy.midnight = Some(price);
                strategy.journal.record(None, format!("Midnight price {}", format_price(price)));
                strategy.state = RippleState::Nine;
            }
        } else {
            strategy.resume()?;
        }

        strategy.journal.record(
            None,
            format!(
                "{} amount={} {}",
                name,
                format_price(args.amount),
                strategy.state.label()
            ),
        );
        Ok(strategy)
    }

    pub fn state(&self) -> RippleState {
        self.state
    }

    /// Pick up the target sell left by a previous run
    fn resume(&mut self) -> Result<()> {
        let Some(order) = self.controller.order().filter(|o| o.is_sell()).cloned() else {
            return Err(Error::InvalidPosition("no target sell to resume".to_string()));
        };
        self.journal.record(None, format!("Resuming target sell {}", order));
        self.ledger.quantity = order.quantity;
        self.target = order.limit;
        self.exit_order = Some(order.id);
        self.state = RippleState::Selling;
        Ok(())
    }

    fn midnight(&mut self, bar: &Bar) {
        if bar.timestamp.hour() == 0 {
            self.midnight = Some(bar.open);
            self.journal
                .record(Some(bar), format!("Midnight price {}", format_price(bar.open)));
            self.state = RippleState::Nine;
        }
    }

    async fn nine(&mut self, bar: &Bar) -> Result<()> {
        if bar.timestamp.hour() != BUY_HOUR {
            return Ok(());
        }
        let Some(midnight) = self.midnight else {
            self.state = RippleState::Midnight;
            return Ok(());
        };
        if midnight <= bar.close * GAP_RATIO {
            self.journal.record(
                Some(bar),
                format!(
                    "no up trend: {} < {}. retrying tomorrow. {}",
                    format_price(midnight),
                    format_price(bar.close * GAP_RATIO),
                    format_price(self.ledger.capital)
                ),
            );
            self.state = RippleState::Midnight;
            return Ok(());
        }

        let quantity = self.ledger.capital / bar.close;
        let order = self
            .controller
            .submit(OrderIntent::BuyLimit {
                quantity,
                price: bar.close,
            })
            .await?;
        self.journal
            .record(Some(bar), format!("buying {:.6} @ {}", quantity, format_price(bar.close)));
        self.buy_order = Some(order.id);
        self.state = RippleState::Buying;
        Ok(())
    }

    async fn buying(&mut self, bar: &Bar) -> Result<()> {
        let id = self
            .buy_order
            .clone()
            .ok_or_else(|| Error::OrderNotFound("no buy order tracked".to_string()))?;
        if self.controller.monitor_completion("Buy order ").await? {
            let order = self.controller.find_closed(&id).await?;
            return self.bought(bar, order).await;
        }

        if bar.timestamp.hour() == CANCEL_HOUR {
            self.journal.record(Some(bar), "no fill by 10:00, cancelling the buy");
            match self.controller.cancel().await? {
                Some(order) => return self.bought(bar, order).await,
                None => {
                    self.buy_order = None;
                    self.state = RippleState::Midnight;
                }
            }
        }
        Ok(())
    }

    async fn bought(&mut self, bar: &Bar, order: Order) -> Result<()> {
        self.buy_order = None;
        if order.status != OrderStatus::Filled {
            self.journal.record(Some(bar), "Buy order cancelled outside of the plan");
            self.state = RippleState::Midnight;
            return Ok(());
        }

        self.ledger.open(&order);
        self.journal.record(
            Some(bar),
            format!(
                "bought {:.6} @ {} fees {}",
                order.quantity,
                format_price(order.fill_price),
                format_price(order.commission)
            ),
        );
        // The gap below midnight, mirrored above the entry
        let gap = self.midnight.map_or(0.0, |m| m - order.fill_price);
        self.target = order.fill_price + gap;
        self.journal
            .record(Some(bar), format!("setting target to {}", format_price(self.target)));
        self.place_target(bar).await
    }

    async fn place_target(&mut self, bar: &Bar) -> Result<()> {
        let order = self
            .controller
            .submit(OrderIntent::SellLimit {
                quantity: self.ledger.quantity,
                price: self.target,
            })
            .await?;
        self.journal.record(Some(bar), format!("{}", order));
        self.exit_order = Some(order.id);
        self.state = RippleState::Selling;
        Ok(())
    }

    async fn selling(&mut self, bar: &Bar) -> Result<()> {
        if !self.controller.monitor_completion("Sell order ").await? {
            return Ok(());
        }
        let id = self
            .exit_order
            .take()
            .ok_or_else(|| Error::OrderNotFound("no target sell tracked".to_string()))?;
        let closed = self.controller.find_closed(&id).await?;
        if closed.status != OrderStatus::Filled {
            self.journal
                .record(Some(bar), "Target sell cancelled outside of the plan, placing it again");
            return self.place_target(bar).await;
        }

        let invested = self.ledger.capital;
        let amount = self.ledger.realize(&self.controller, &closed).await?;
        self.journal.record(
            Some(bar),
            format!(
                "sold {:.6} @ {} => {} {} {:.2}%",
                closed.quantity,
                format_price(closed.fill_price),
                format_price(amount),
                format_price(invested),
                (amount / invested - 1.0) * 100.0
            ),
        );
        self.state = RippleState::Midnight;
        Ok(())
    }
}

#[async_trait]
impl Strategy for RippleStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn pair(&self) -> &str {
        self.controller.pair()
    }

    async fn on_bar(&mut self, bar: &Bar) -> Result<bool> {
        self.controller.reconcile_if_pending().await?;
        match self.state {
            RippleState::Midnight => self.midnight(bar),
            RippleState::Nine => self.nine(bar).await?,
            RippleState::Buying => self.buying(bar).await?,
            RippleState::Selling => self.selling(bar).await?,
        }

        if matches!(self.state, RippleState::Buying | RippleState::Selling) {
            let label = format!(
                "{} {} ({:.6} x {})",
                self.state.label(),
                format_price(self.ledger.capital),
                self.ledger.quantity,
                format_opt_price(self.ledger.entry)
            );
            record_status(&mut self.journal, bar, &label);
        }
        Ok(self.ledger.capital > 0.0)
    }

    fn status(&self) -> StrategyStatus {
        StrategyStatus {
            state: self.state.label().to_string(),
            capital: self.ledger.capital,
            quantity: self.ledger.quantity,
            entry: self.ledger.entry,
            virtual_stop: None,
            physical_stop: None,
            realized: self.ledger.realized,
        }
    }

    fn journal(&self) -> &Journal {
        &self.journal
    }
}

pub struct RippleFactory;

#[async_trait]
impl StrategyFactory for RippleFactory {
    async fn create(
        &self,
        name: &str,
        gateway: Arc<dyn Gateway>,
        args: &[String],
        buy: bool,
        options: &StrategyOptions,
    ) -> Result<Box<dyn Strategy>> {
        Ok(Box::new(RippleStrategy::new(name, gateway, args, buy, options).await?))
    }
}
