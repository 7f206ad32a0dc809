//! Target ladder plan
//!
//! The position is split into one slice per target. While the close is at
//! or above the entry level a limit sell for the next slice rests at the
//! next target; below it a stop protects everything still held. Each
//! reached target moves the stop up to the previous entry level and the
//! entry up to the target.
//!
//! Only one order rests at a time: switching between the target sell and
//! the stop cancels the other one.

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;

use super::journal::Journal;
use super::ledger::split_quantity;
use super::plan::{record_status, BuyStep, QuantitySpec, RangeEntry};
use super::registry::StrategyFactory;
use super::traits::{Strategy, StrategyOptions, StrategyStatus};
use crate::bars::Bar;
use crate::consts::DEFAULT_BUY_RANGE;
use crate::controller::OrderController;
use crate::errors::{Error, Result};
use crate::helpers::{format_price, parse_price};
use crate::market::{Gateway, OrderIntent, OrderStatus};

#[derive(Parser, Debug)]
struct TargetsArgs {
    /// Buy range as a fraction of the entry-to-stop distance
    #[arg(short, long, default_value_t = DEFAULT_BUY_RANGE)]
    range: f64,
    /// Pair like BTC-ETH
    pair: String,
    /// Quantity to sell, or ALL of the current balance
    quantity: String,
    stop: String,
    entry: String,
    /// Sell targets in ascending order; a negative target is already reached
    #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
    targets: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetsState {
    Buying,
    /// No exit order decided yet
    Unknown,
    /// Target sell resting
    Up,
    /// Stop resting
    Down,
    Done,
}

impl TargetsState {
    fn label(&self) -> &'static str {
        match self {
            TargetsState::Buying => "buying",
            TargetsState::Unknown => "unknown",
            TargetsState::Up => "up",
            TargetsState::Down => "down",
            TargetsState::Done => "done",
        }
    }
}

pub struct TargetsStrategy {
    name: String,
    controller: OrderController,
    journal: Journal,
    state: TargetsState,
    buy: Option<RangeEntry>,
    /// `[stop, entry, target 1, target 2, ...]`
    levels: Vec<f64>,
    /// One quantity per target
    slices: Vec<f64>,
    /// Number of targets already reached
    reached: usize,
    exit_order: Option<String>,
}

impl TargetsStrategy {
    pub async fn new(
        name: &str,
        gateway: Arc<dyn Gateway>,
        args: &[String],
        buy: bool,
        options: &StrategyOptions,
    ) -> Result<Self> {
        let args = TargetsArgs::try_parse_from(std::iter::once(name).chain(args.iter().map(String::as_str)))?;
        let quantity: QuantitySpec = args.quantity.parse()?;
        let stop = parse_price(&args.stop)?;
        let entry = parse_price(&args.entry)?;
        let targets = args
            .targets
            .iter()
            .map(|t| parse_price(t))
            .collect::<Result<Vec<f64>>>()?;
        if stop >= entry {
            return Err(Error::InvalidArgs(format!(
                "stop {} must be below entry {}",
                format_price(stop),
                format_price(entry)
            )));
        }
        let reached = targets.iter().rposition(|t| *t < 0.0).map_or(0, |i| i + 1);
        if reached == targets.len() {
            return Err(Error::InvalidArgs("every target is already reached".to_string()));
        }

        let controller = OrderController::new(gateway, &args.pair, options.retry).await?;
        let mut journal = Journal::new(&args.pair);
        let position = controller.position();
        journal.record(
            None,
            format!("Balance = {:.3} Available = {:.3}", position.balance, position.available),
        );

        let total = match (buy, quantity) {
            (true, QuantitySpec::All) => {
                return Err(Error::InvalidArgs("a buy needs an explicit quantity".to_string()));
            }
            _ => quantity.resolve(position)?,
        };

        let mut levels = vec![stop, entry];
        levels.extend(targets.iter().map(|t| t.abs()));
        let mut strategy = Self {
            name: name.to_string(),
            controller,
            journal,
            state: TargetsState::Unknown,
            buy: None,
            levels,
            slices: split_quantity(total, targets.len()),
            reached: 0,
            exit_order: None,
        };
        for _ in 0..reached {
            strategy.advance();
        }
        strategy.journal.record(
            None,
            format!(
                "{} {:.3} stop={} entry={} targets={}",
                name,
                total,
                format_price(strategy.stop()),
                format_price(strategy.entry()),
                strategy.levels[2..].iter().map(|t| format_price(*t)).collect::<Vec<_>>().join(",")
            ),
        );

        if buy {
            let mut range_buy = RangeEntry::new(stop, entry, args.range, total);
            range_buy.place(&mut strategy.controller, &mut strategy.journal).await?;
            strategy.buy = Some(range_buy);
            strategy.state = TargetsState::Buying;
        } else {
            strategy.controller.cancel_all_open().await?;
            strategy.journal.record(None, "Managing existing position");
        }
        Ok(strategy)
    }

    pub fn state(&self) -> TargetsState {
        self.state
    }

    pub fn stop(&self) -> f64 {
        self.levels[self.reached]
    }

    pub fn entry(&self) -> f64 {
        self.levels[self.reached + 1]
    }

    fn next_target(&self) -> f64 {
        self.levels[self.reached + 2]
    }

    fn remaining(&self) -> f64 {
        self.slices[self.reached..].iter().sum()
    }

    fn advance(&mut self) {
        self.reached += 1;
    }

    fn all_reached(&self) -> bool {
        self.reached >= self.slices.len()
    }

    /// Follow the resting exit order, then make sure the right one is in place.
    /// Returns `false` once the plan is over.
    async fn manage(&mut self, bar: &Bar) -> Result<bool> {
        if let Some(order_id) = self.exit_order.clone() {
            let label = if self.state == TargetsState::Down { "Stop order " } else { "Target order " };
            if self.controller.monitor_completion(label).await? {
                let closed = self.controller.find_closed(&order_id).await?;
                self.exit_order = None;
                match (closed.status, self.state) {
                    (OrderStatus::Filled, TargetsState::Down) => {
                        self.journal.record(Some(bar), "Stop reached");
                        self.state = TargetsState::Done;
                        return Ok(false);
                    }
                    (OrderStatus::Filled, TargetsState::Up) => {
                        self.journal.record(
                            Some(bar),
                            format!(
                                "Target {} reached: sold {:.3} @ {}",
                                self.reached + 1,
                                closed.quantity,
                                format_price(closed.fill_price)
                            ),
                        );
                        self.advance();
                        if self.all_reached() {
                            self.journal.record(Some(bar), "Last target reached");
                            self.state = TargetsState::Done;
                            return Ok(false);
                        }
                        self.journal.record(
                            Some(bar),
                            format!(
                                "Moving stop to {} and entry to {}",
                                format_price(self.stop()),
                                format_price(self.entry())
                            ),
                        );
                    }
                    _ => {
                        self.journal.record(Some(bar), "Exit order cancelled outside of the plan");
                    }
                }
                self.state = TargetsState::Unknown;
            }
        }

        if bar.close < self.entry() {
            if self.state != TargetsState::Down {
                let quantity = self.remaining();
                let order = self
                    .controller
                    .submit(OrderIntent::SellStop {
                        quantity,
                        trigger: self.stop(),
                    })
                    .await?;
                self.journal.record(
                    Some(bar),
                    format!("Putting a stop @ {} for {:.3}", format_price(self.stop()), quantity),
                );
                self.exit_order = Some(order.id);
                self.state = TargetsState::Down;
            }
        } else if self.state != TargetsState::Up {
            let quantity = self.slices[self.reached];
            let target = self.next_target();
            let order = self
                .controller
                .submit(OrderIntent::SellLimit { quantity, price: target })
                .await?;
            self.journal.record(
                Some(bar),
                format!("Selling {:.3} @ target {}", quantity, format_price(target)),
            );
            self.exit_order = Some(order.id);
            self.state = TargetsState::Up;
        }
        Ok(true)
    }
}

#[async_trait]
impl Strategy for TargetsStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn pair(&self) -> &str {
        self.controller.pair()
    }

    async fn on_bar(&mut self, bar: &Bar) -> Result<bool> {
        self.controller.reconcile_if_pending().await?;
        let running = match self.state {
            TargetsState::Done => false,
            TargetsState::Buying => {
                let Some(range_buy) = self.buy.as_mut() else {
                    return Err(Error::OrderNotFound("no entry buy tracked".to_string()));
                };
                match range_buy.step(&mut self.controller, &mut self.journal, bar).await? {
                    BuyStep::Waiting => true,
                    BuyStep::Invalidated => {
                        self.state = TargetsState::Done;
                        false
                    }
                    BuyStep::Filled(_) => {
                        self.buy = None;
                        self.state = TargetsState::Unknown;
                        self.manage(bar).await?
                    }
                }
            }
            _ => self.manage(bar).await?,
        };

        let label = format!(
            "{} stop={} entry={} {}/{}",
            self.state.label(),
            format_price(self.stop()),
            format_price(self.entry()),
            self.reached,
            self.slices.len()
        );
        record_status(&mut self.journal, bar, &label);
        Ok(running)
    }

    fn status(&self) -> StrategyStatus {
        StrategyStatus {
            state: self.state.label().to_string(),
            capital: 0.0,
            quantity: if self.all_reached() { 0.0 } else { self.remaining() },
            entry: Some(self.entry()),
            virtual_stop: None,
            physical_stop: (self.state == TargetsState::Down).then(|| self.stop()),
            realized: None,
        }
    }

    fn journal(&self) -> &Journal {
        &self.journal
    }
}

pub struct TargetsFactory;

#[async_trait]
impl StrategyFactory for TargetsFactory {
    async fn create(
        &self,
        name: &str,
        gateway: Arc<dyn Gateway>,
        args: &[String],
        buy: bool,
        options: &StrategyOptions,
    ) -> Result<Box<dyn Strategy>> {
        Ok(Box::new(TargetsStrategy::new(name, gateway, args, buy, options).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bars::tests::bar;
    use crate::market::mock::MockGateway;
    use crate::market::{OrderKind, OrderSide};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn targets(mock: &Arc<MockGateway>, list: &[&str], buy: bool) -> Result<TargetsStrategy> {
        TargetsStrategy::new("targets", mock.clone(), &args(list), buy, &StrategyOptions::default()).await
    }

    #[tokio::test]
    async fn test_negative_targets_already_reached() {
        let mock = Arc::new(MockGateway::new());
        mock.set_position(3.0, 3.0).await;
        let strategy = targets(&mock, &["BTC-ETH", "3", "90", "100", "-110", "120", "130"], false)
            .await
            .unwrap();
        assert_eq!(strategy.stop(), 100.0);
        assert_eq!(strategy.entry(), 110.0);
        assert_eq!(strategy.remaining(), 2.0);
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let mock = Arc::new(MockGateway::new());
        let err = targets(&mock, &["BTC-ETH", "ALL", "90", "100", "110"], false).await;
        assert!(matches!(err, Err(Error::InvalidPosition(_))));

        let err = targets(&mock, &["BTC-ETH", "1", "100", "90", "110"], false).await;
        assert!(matches!(err, Err(Error::InvalidArgs(_))));

        let err = targets(&mock, &["BTC-ETH", "1", "90", "100"], false).await;
        assert!(matches!(err, Err(Error::InvalidArgs(_))));
    }

    #[tokio::test]
    async fn test_ladder_up_then_stop() {
        let mock = Arc::new(MockGateway::new());
        mock.set_position(2.0, 2.0).await;
        let mut strategy = targets(&mock, &["BTC-ETH", "2", "90", "100", "110", "120"], false)
            .await
            .unwrap();

        assert!(strategy.on_bar(&bar(0, 104.0, 106.0, 103.0, 105.0)).await.unwrap());
        assert_eq!(strategy.state(), TargetsState::Up);
        let sell = mock.placed.lock().await.last().cloned().unwrap();
        assert_eq!((sell.side, sell.quantity, sell.limit), (OrderSide::Sell, 1.0, 110.0));

        mock.fill_open_orders().await;
        mock.set_position(1.0, 1.0).await;
        assert!(strategy.on_bar(&bar(1, 110.0, 112.0, 109.0, 111.0)).await.unwrap());
        assert_eq!(strategy.stop(), 100.0);
        assert_eq!(strategy.entry(), 110.0);
        let sell = mock.placed.lock().await.last().cloned().unwrap();
        assert_eq!((sell.quantity, sell.limit), (1.0, 120.0));

        assert!(strategy.on_bar(&bar(2, 108.0, 109.0, 104.0, 105.0)).await.unwrap());
        assert_eq!(strategy.state(), TargetsState::Down);
        let stop = mock.placed.lock().await.last().cloned().unwrap();
        assert_eq!(stop.kind, OrderKind::ConditionalStop);
        assert_eq!((stop.quantity, stop.trigger), (1.0, Some(100.0)));
        assert_eq!(mock.open_orders.lock().await.len(), 1);

        mock.fill_open_orders().await;
        assert!(!strategy.on_bar(&bar(3, 101.0, 101.0, 98.0, 99.0)).await.unwrap());
        assert_eq!(strategy.state(), TargetsState::Done);
    }

    #[tokio::test]
    async fn test_last_target_finishes() {
        let mock = Arc::new(MockGateway::new());
        mock.set_position(1.0, 1.0).await;
        let mut strategy = targets(&mock, &["BTC-ETH", "1", "90", "100", "110"], false)
            .await
            .unwrap();
        strategy.on_bar(&bar(0, 104.0, 106.0, 103.0, 105.0)).await.unwrap();
        mock.fill_open_orders().await;
        assert!(!strategy.on_bar(&bar(1, 110.0, 112.0, 109.0, 111.0)).await.unwrap());
        assert!(strategy.journal().lines().iter().any(|l| l.ends_with("Last target reached")));
    }

    #[tokio::test]
    async fn test_buy_invalidated_below_stop() {
        let mock = Arc::new(MockGateway::new());
        let mut strategy = targets(&mock, &["BTC-ETH", "2", "90", "100", "110"], true)
            .await
            .unwrap();
        assert_eq!(strategy.state(), TargetsState::Buying);
        let buy = mock.placed.lock().await[0].clone();
        assert_eq!(buy.side, OrderSide::Buy);

        assert!(!strategy.on_bar(&bar(0, 95.0, 96.0, 89.0, 92.0)).await.unwrap());
        assert_eq!(strategy.state(), TargetsState::Done);
        assert!(mock.open_orders.lock().await.is_empty());
    }
}
