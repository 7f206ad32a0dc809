//! Bracket exit (`cut`)
//!
//! Sells an existing position either at the limit or at the stop,
//! whichever comes first. The resting order follows the price: the stop
//! below the middle of the bracket, the limit above it.

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;

use super::journal::Journal;
use super::plan::{record_status, QuantitySpec};
use super::registry::StrategyFactory;
use super::traits::{Strategy, StrategyOptions, StrategyStatus};
use crate::bars::Bar;
use crate::controller::OrderController;
use crate::errors::{Error, Result};
use crate::helpers::{format_price, parse_price};
use crate::market::{Gateway, OrderIntent, OrderStatus};

#[derive(Parser, Debug)]
struct BracketArgs {
    /// Pair like BTC-ETH
    pair: String,
    /// Quantity to sell, or ALL of the current balance
    quantity: String,
    stop: String,
    limit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BracketState {
    Unknown,
    Up,
    Down,
    Done,
}

impl BracketState {
    fn label(&self) -> &'static str {
        match self {
            BracketState::Unknown => "unknown",
            BracketState::Up => "up",
            BracketState::Down => "down",
            BracketState::Done => "done",
        }
    }
}

pub struct BracketStrategy {
    name: String,
    controller: OrderController,
    journal: Journal,
    state: BracketState,
    quantity: f64,
    stop: f64,
    limit: f64,
    exit_order: Option<String>,
}

impl BracketStrategy {
    pub async fn new(
        name: &str,
        gateway: Arc<dyn Gateway>,
        args: &[String],
        buy: bool,
        options: &StrategyOptions,
    ) -> Result<Self> {
        let args = BracketArgs::try_parse_from(std::iter::once(name).chain(args.iter().map(String::as_str)))?;
        if buy {
            return Err(Error::InvalidArgs(format!("{} only manages an existing position", name)));
        }
        let quantity: QuantitySpec = args.quantity.parse()?;
        let stop = parse_price(&args.stop)?;
        let limit = parse_price(&args.limit)?;
        if stop >= limit {
            return Err(Error::InvalidArgs(format!(
                "stop {} must be below limit {}",
                format_price(stop),
                format_price(limit)
            )));
        }

        let mut controller = OrderController::new(gateway, &args.pair, options.retry).await?;
        let quantity = quantity.resolve(controller.position())?;
        controller.cancel_all_open().await?;

        let mut journal = Journal::new(&args.pair);
        journal.record(
            None,
            format!(
                "{} {:.3} stop={} limit={}",
                name,
                quantity,
                format_price(stop),
                format_price(limit)
            ),
        );
        Ok(Self {
            name: name.to_string(),
            controller,
            journal,
            state: BracketState::Unknown,
            quantity,
            stop,
            limit,
            exit_order: None,
        })
    }

    pub fn state(&self) -> BracketState {
        self.state
    }

    fn middle(&self) -> f64 {
        (self.stop + self.limit) / 2.0
    }
}

#[async_trait]
impl Strategy for BracketStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn pair(&self) -> &str {
        self.controller.pair()
    }

    async fn on_bar(&mut self, bar: &Bar) -> Result<bool> {
        if self.state == BracketState::Done {
            return Ok(false);
        }
        self.controller.reconcile_if_pending().await?;

        if let Some(order_id) = self.exit_order.clone() {
            if self.controller.monitor_completion("Exit order ").await? {
                let closed = self.controller.find_closed(&order_id).await?;
                self.exit_order = None;
                if closed.status == OrderStatus::Filled {
                    self.journal.record(
                        Some(bar),
                        format!("Sold {:.3} @ {}", closed.quantity, format_price(closed.fill_price)),
                    );
                    self.state = BracketState::Done;
                    record_status(&mut self.journal, bar, self.state.label());
                    return Ok(false);
                }
                self.journal.record(Some(bar), "Exit order cancelled outside of the plan");
                self.state = BracketState::Unknown;
            }
        }

        let intent = if bar.close < self.middle() {
            (self.state != BracketState::Down).then_some((
                BracketState::Down,
                OrderIntent::SellStop {
                    quantity: self.quantity,
                    trigger: self.stop,
                },
            ))
        } else {
            (self.state != BracketState::Up).then_some((
                BracketState::Up,
                OrderIntent::SellLimit {
                    quantity: self.quantity,
                    price: self.limit,
                },
            ))
        };
        if let Some((state, intent)) = intent {
            let order = self.controller.submit(intent).await?;
            self.journal.record(Some(bar), format!("{}", intent));
            self.exit_order = Some(order.id);
            self.state = state;
        }

        record_status(&mut self.journal, bar, self.state.label());
        Ok(true)
    }

    fn status(&self) -> StrategyStatus {
        StrategyStatus {
            state: self.state.label().to_string(),
            capital: 0.0,
            quantity: self.quantity,
            entry: None,
            virtual_stop: None,
            physical_stop: (self.state == BracketState::Down).then_some(self.stop),
            realized: None,
        }
    }

    fn journal(&self) -> &Journal {
        &self.journal
    }
}

pub struct BracketFactory;

#[async_trait]
impl StrategyFactory for BracketFactory {
    async fn create(
        &self,
        name: &str,
        gateway: Arc<dyn Gateway>,
        args: &[String],
        buy: bool,
        options: &StrategyOptions,
    ) -> Result<Box<dyn Strategy>> {
        Ok(Box::new(BracketStrategy::new(name, gateway, args, buy, options).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bars::tests::bar;
    use crate::market::mock::MockGateway;
    use crate::market::OrderKind;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_follows_middle_of_bracket() {
        let mock = Arc::new(MockGateway::new());
        mock.set_position(4.0, 4.0).await;
        let mut strategy = BracketStrategy::new(
            "cut",
            mock.clone(),
            &args(&["BTC-ETH", "ALL", "90", "110"]),
            false,
            &StrategyOptions::default(),
        )
        .await
        .unwrap();

        strategy.on_bar(&bar(0, 101.0, 102.0, 100.0, 101.0)).await.unwrap();
        assert_eq!(strategy.state(), BracketState::Up);
        strategy.on_bar(&bar(1, 101.0, 102.0, 100.0, 101.5)).await.unwrap();
        assert_eq!(mock.placed.lock().await.len(), 1);

        strategy.on_bar(&bar(2, 99.0, 99.0, 97.0, 98.0)).await.unwrap();
        assert_eq!(strategy.state(), BracketState::Down);
        let stop = mock.placed.lock().await.last().cloned().unwrap();
        assert_eq!(stop.kind, OrderKind::ConditionalStop);
        assert_eq!((stop.quantity, stop.trigger), (4.0, Some(90.0)));
        assert_eq!(mock.cancelled.lock().await.len(), 1);

        mock.fill_open_orders().await;
        assert!(!strategy.on_bar(&bar(3, 91.0, 91.0, 88.0, 89.0)).await.unwrap());
        assert_eq!(strategy.state(), BracketState::Done);
    }

    #[tokio::test]
    async fn test_buy_is_rejected() {
        let mock = Arc::new(MockGateway::new());
        let result = BracketStrategy::new(
            "cut",
            mock,
            &args(&["BTC-ETH", "1", "90", "110"]),
            true,
            &StrategyOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(Error::InvalidArgs(_))));
    }
}
