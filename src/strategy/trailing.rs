//! Trailing plan
//!
//! Half of the position is sold at the target; the rest is protected by a
//! stop that follows the volatility stop of the decision period, never
//! under the entry. With `--trailing` the whole position trails right
//! away. Below the entry before the target, a stop at the initial level
//! protects everything.

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;

use super::journal::Journal;
use super::ledger::split_quantity;
use super::plan::{record_status, BuyStep, QuantitySpec, RangeEntry};
use super::registry::StrategyFactory;
use super::stops::{StopPolicy, StopTracker};
use super::traits::{Strategy, StrategyOptions, StrategyStatus};
use crate::bars::{Bar, BarSeries};
use crate::consts::DEFAULT_BUY_RANGE;
use crate::controller::OrderController;
use crate::errors::{Error, Result};
use crate::helpers::{format_price, parse_price, truncate_float};
use crate::indicators::{last_closed_row, IndicatorConfig};
use crate::market::{Gateway, OrderIntent, OrderStatus};

/// The trail period is halved while the recent bars span this many risks
const RANGE_IN_RISKS: f64 = 3.5;
const MIN_PERIOD: u32 = 15;
const RECENT_BARS: usize = 4;

#[derive(Parser, Debug)]
struct TrailingArgs {
    /// Buy range as a fraction of the entry-to-stop distance
    #[arg(short, long, default_value_t = DEFAULT_BUY_RANGE)]
    range: f64,
    /// Trail the whole position immediately
    #[arg(short, long)]
    trailing: bool,
    /// Trail period in minutes
    #[arg(short, long, default_value_t = 60)]
    period: u32,
    /// Let the trailing stop move down when the volatility stop does
    #[arg(long)]
    allow_widening: bool,
    /// Pair like BTC-ETH
    pair: String,
    /// Quantity to manage, or ALL of the current balance
    quantity: String,
    stop: String,
    entry: String,
    target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailingState {
    Buying,
    Unknown,
    /// Half sold at the target once filled
    Up,
    /// Initial stop resting
    Down,
    Trailing,
    Done,
}

impl TrailingState {
    fn label(&self) -> &'static str {
        match self {
            TrailingState::Buying => "buying",
            TrailingState::Unknown => "unknown",
            TrailingState::Up => "up",
            TrailingState::Down => "down",
            TrailingState::Trailing => "trailing",
            TrailingState::Done => "done",
        }
    }
}

pub struct TrailingStrategy {
    name: String,
    controller: OrderController,
    journal: Journal,
    series: BarSeries,
    indicators: IndicatorConfig,
    state: TrailingState,
    /// `--trailing`: skip the target once the position is held
    force_trailing: bool,
    buy: Option<RangeEntry>,
    stop: f64,
    entry: f64,
    target: f64,
    /// Sold at the target, then trailed
    halves: Vec<f64>,
    quantity: f64,
    period: u32,
    trail_period: u32,
    stops: StopTracker,
    exit_order: Option<String>,
}

impl TrailingStrategy {
    pub async fn new(
        name: &str,
        gateway: Arc<dyn Gateway>,
        args: &[String],
        buy: bool,
        options: &StrategyOptions,
    ) -> Result<Self> {
        let args = TrailingArgs::try_parse_from(std::iter::once(name).chain(args.iter().map(String::as_str)))?;
        let quantity: QuantitySpec = args.quantity.parse()?;
        let stop = parse_price(&args.stop)?;
        let entry = parse_price(&args.entry)?;
        let target = parse_price(&args.target)?;
        if !(stop < entry && entry < target) {
            return Err(Error::InvalidArgs(format!(
                "expected stop < entry < target, got {} {} {}",
                format_price(stop),
                format_price(entry),
                format_price(target)
            )));
        }
        if args.period < MIN_PERIOD {
            return Err(Error::InvalidArgs(format!("period must be at least {} mn", MIN_PERIOD)));
        }

        let controller = OrderController::new(gateway, &args.pair, options.retry).await?;
        let series = BarSeries::from_bars(controller.candles("oneMin").await?);
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
        journal.record(
            None,
            format!(
                "{} {:.3} stop={} entry={} target={} period={} mn",
                name,
                total,
                format_price(stop),
                format_price(entry),
                format_price(target),
                args.period
            ),
        );

        let mut strategy = Self {
            name: name.to_string(),
            controller,
            journal,
            series,
            indicators: options.indicators,
            state: if args.trailing { TrailingState::Trailing } else { TrailingState::Unknown },
            force_trailing: args.trailing,
            buy: None,
            stop,
            entry,
            target,
            halves: split_quantity(total, 2),
            quantity: total,
            period: args.period,
            trail_period: args.period,
            stops: StopTracker::with_margin(
                StopPolicy {
                    allow_widening: args.allow_widening,
                },
                options.stop_margin,
            ),
            exit_order: None,
        };

        if buy {
            let mut range_buy = RangeEntry::new(stop, entry, args.range, total);
            range_buy.place(&mut strategy.controller, &mut strategy.journal).await?;
            strategy.buy = Some(range_buy);
            strategy.state = TrailingState::Buying;
        } else {
            strategy.controller.cancel_all_open().await?;
        }
        Ok(strategy)
    }

    pub fn state(&self) -> TrailingState {
        self.state
    }

    /// Trailing stop level for the current bars.
    ///
    /// Starts from the configured period and halves it while the last few
    /// bars span more than a few times the initial risk, so fast moves get
    /// a tighter trail.
    fn compute_trail(&mut self, bar: &Bar) -> f64 {
        let risk = self.entry - self.stop;
        let mut period = self.period;
        loop {
            let resampled = self.series.resample(period);
            let Some(recent) = resampled.len().checked_sub(RECENT_BARS).map(|i| &resampled[i..]) else {
                break;
            };
            let high = recent.iter().map(|b| b.high).fold(f64::MIN, f64::max);
            let low = recent.iter().map(|b| b.low).fold(f64::MAX, f64::min);
            let size = high - low;
            if size < RANGE_IN_RISKS * risk || period / 2 < MIN_PERIOD {
                break;
            }
            period /= 2;
            if period != self.trail_period {
                self.journal.record(
                    Some(bar),
                    format!(
                        "Downsampling to {} mn risk={} size={}",
                        period,
                        format_price(risk),
                        format_price(size)
                    ),
                );
            }
        }
        self.trail_period = period;

        let level = last_closed_row(&self.series, period, &self.indicators)
            .and_then(|row| row.atr_stop)
            .map_or(self.entry, |stop| stop.max(self.entry));
        truncate_float(level, 8)
    }

    async fn trail(&mut self, bar: &Bar) -> Result<bool> {
        if let Some(order_id) = self.stops.physical_order().map(str::to_string) {
            if self.controller.monitor_completion("Trailing stop ").await? {
                let closed = self.controller.find_closed(&order_id).await?;
                if closed.status == OrderStatus::Filled {
                    self.journal.record(
                        Some(bar),
                        format!(
                            "Trailing stop reached: sold {:.3} @ {}",
                            closed.quantity,
                            format_price(closed.fill_price)
                        ),
                    );
                    self.stops.clear_physical();
                    self.state = TrailingState::Done;
                    return Ok(false);
                }
                self.journal.record(Some(bar), "Trailing stop cancelled outside of the plan");
                self.stops.clear_physical();
            }
        }

        let level = self.compute_trail(bar);
        if self.stops.accepts_physical(level) {
            let order = self
                .controller
                .submit(OrderIntent::SellStop {
                    quantity: self.quantity,
                    trigger: level,
                })
                .await?;
            self.journal.record(
                Some(bar),
                format!("Trailing stop @ {} for {:.3}", format_price(level), self.quantity),
            );
            self.stops.promote(level, &order.id);
        }
        Ok(true)
    }

    /// Before the target: stop below the entry, target sell above
    async fn manage(&mut self, bar: &Bar) -> Result<bool> {
        if let Some(order_id) = self.exit_order.clone() {
            if self.controller.monitor_completion("Exit order ").await? {
                let closed = self.controller.find_closed(&order_id).await?;
                self.exit_order = None;
                match (closed.status, self.state) {
                    (OrderStatus::Filled, TrailingState::Down) => {
                        self.journal.record(Some(bar), "Stop reached");
                        self.state = TrailingState::Done;
                        return Ok(false);
                    }
                    (OrderStatus::Filled, TrailingState::Up) => {
                        self.quantity = self.halves[1];
                        self.journal.record(
                            Some(bar),
                            format!("Target reached, trailing the last {:.3}", self.quantity),
                        );
                        self.state = TrailingState::Trailing;
                        return self.trail(bar).await;
                    }
                    _ => {
                        self.journal.record(Some(bar), "Exit order cancelled outside of the plan");
                        self.state = TrailingState::Unknown;
                    }
                }
            }
        }

        if bar.close < self.entry {
            if self.state != TrailingState::Down {
                let order = self
                    .controller
                    .submit(OrderIntent::SellStop {
                        quantity: self.quantity,
                        trigger: self.stop,
                    })
                    .await?;
                self.journal.record(
                    Some(bar),
                    format!("Putting a stop @ {} for {:.3}", format_price(self.stop), self.quantity),
                );
                self.exit_order = Some(order.id);
                self.state = TrailingState::Down;
            }
        } else if self.state != TrailingState::Up {
            let quantity = self.halves[0];
            let order = self
                .controller
                .submit(OrderIntent::SellLimit {
                    quantity,
                    price: self.target,
                })
                .await?;
            self.journal.record(
                Some(bar),
                format!("Selling {:.3} @ target {}", quantity, format_price(self.target)),
            );
            self.exit_order = Some(order.id);
            self.state = TrailingState::Up;
        }
        Ok(true)
    }
}

#[async_trait]
impl Strategy for TrailingStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn pair(&self) -> &str {
        self.controller.pair()
    }

    async fn on_bar(&mut self, bar: &Bar) -> Result<bool> {
        self.series.push(*bar);
        self.controller.reconcile_if_pending().await?;

        let running = match self.state {
            TrailingState::Done => false,
            TrailingState::Buying => {
                let Some(range_buy) = self.buy.as_mut() else {
                    return Err(Error::OrderNotFound("no entry buy tracked".to_string()));
                };
                match range_buy.step(&mut self.controller, &mut self.journal, bar).await? {
                    BuyStep::Waiting => true,
                    BuyStep::Invalidated => {
                        self.state = TrailingState::Done;
                        false
                    }
                    BuyStep::Filled(_) if self.force_trailing => {
                        self.buy = None;
                        self.state = TrailingState::Trailing;
                        self.trail(bar).await?
                    }
                    BuyStep::Filled(_) => {
                        self.buy = None;
                        self.state = TrailingState::Unknown;
                        self.manage(bar).await?
                    }
                }
            }
            TrailingState::Trailing => self.trail(bar).await?,
            _ => self.manage(bar).await?,
        };

        let label = format!(
            "{} stop={} period={} mn",
            self.state.label(),
            match self.state {
                TrailingState::Trailing => format_price(self.stops.physical_stop().unwrap_or(self.entry)),
                _ => format_price(self.stop),
            },
            self.trail_period
        );
        record_status(&mut self.journal, bar, &label);
        Ok(running)
    }

    fn status(&self) -> StrategyStatus {
        StrategyStatus {
            state: self.state.label().to_string(),
            capital: 0.0,
            quantity: self.quantity,
            entry: Some(self.entry),
            virtual_stop: None,
            physical_stop: self.stops.physical_stop(),
            realized: None,
        }
    }

    fn journal(&self) -> &Journal {
        &self.journal
    }
}

pub struct TrailingFactory;

#[async_trait]
impl StrategyFactory for TrailingFactory {
    async fn create(
        &self,
        name: &str,
        gateway: Arc<dyn Gateway>,
        args: &[String],
        buy: bool,
        options: &StrategyOptions,
    ) -> Result<Box<dyn Strategy>> {
        Ok(Box::new(TrailingStrategy::new(name, gateway, args, buy, options).await?))
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

    async fn trailing(mock: &Arc<MockGateway>, list: &[&str]) -> TrailingStrategy {
        TrailingStrategy::new("trailing", mock.clone(), &args(list), false, &StrategyOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_forced_trailing_from_entry() {
        let mock = Arc::new(MockGateway::new());
        mock.set_position(2.0, 2.0).await;
        let mut strategy = trailing(&mock, &["-t", "BTC-ETH", "2", "90", "100", "120"]).await;
        assert_eq!(strategy.state(), TrailingState::Trailing);

        // not enough history: the trail sits at the entry
        assert!(strategy.on_bar(&bar(0, 104.0, 106.0, 103.0, 105.0)).await.unwrap());
        let stop = mock.placed.lock().await.last().cloned().unwrap();
        assert_eq!(stop.kind, OrderKind::ConditionalStop);
        assert_eq!((stop.quantity, stop.trigger), (2.0, Some(100.0)));

        assert!(strategy.on_bar(&bar(1, 105.0, 107.0, 104.0, 106.0)).await.unwrap());
        assert_eq!(mock.placed.lock().await.len(), 1);

        mock.fill_open_orders().await;
        assert!(!strategy.on_bar(&bar(2, 100.0, 101.0, 98.0, 99.0)).await.unwrap());
        assert_eq!(strategy.state(), TrailingState::Done);
    }

    #[tokio::test]
    async fn test_forced_trailing_survives_the_buy() {
        let mock = Arc::new(MockGateway::new());
        let mut strategy = TrailingStrategy::new(
            "trailing",
            mock.clone(),
            &args(&["-t", "BTC-ETH", "2", "90", "100", "120"]),
            true,
            &StrategyOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(strategy.state(), TrailingState::Buying);

        mock.fill_open_orders().await;
        mock.set_position(2.0, 2.0).await;
        assert!(strategy.on_bar(&bar(0, 104.0, 106.0, 103.0, 105.0)).await.unwrap());
        assert_eq!(strategy.state(), TrailingState::Trailing);
        let stop = mock.placed.lock().await.last().cloned().unwrap();
        assert_eq!(stop.kind, OrderKind::ConditionalStop);
        assert_eq!((stop.quantity, stop.trigger), (2.0, Some(100.0)));
    }

    #[tokio::test]
    async fn test_half_at_target_then_trail() {
        let mock = Arc::new(MockGateway::new());
        mock.set_position(2.0, 2.0).await;
        let mut strategy = trailing(&mock, &["BTC-ETH", "2", "90", "100", "120"]).await;

        strategy.on_bar(&bar(0, 104.0, 106.0, 103.0, 105.0)).await.unwrap();
        assert_eq!(strategy.state(), TrailingState::Up);
        let sell = mock.placed.lock().await.last().cloned().unwrap();
        assert_eq!((sell.quantity, sell.limit), (1.0, 120.0));

        mock.fill_open_orders().await;
        mock.set_position(1.0, 1.0).await;
        assert!(strategy.on_bar(&bar(1, 119.0, 121.0, 118.0, 120.0)).await.unwrap());
        assert_eq!(strategy.state(), TrailingState::Trailing);
        let stop = mock.placed.lock().await.last().cloned().unwrap();
        assert_eq!((stop.quantity, stop.trigger), (1.0, Some(100.0)));
    }

    #[tokio::test]
    async fn test_trail_period_downsamples_on_fast_moves() {
        let mock = Arc::new(MockGateway::new());
        mock.set_position(1.0, 1.0).await;
        // four hours climbing one point a minute, risk of 10
        let candles: Vec<Bar> = (0..240)
            .map(|i| {
                let base = 100.0 + i as f64;
                bar(i, base, base + 1.0, base - 1.0, base + 0.5)
            })
            .collect();
        *mock.candles.lock().await = candles;
        let mut strategy = trailing(&mock, &["-t", "BTC-ETH", "1", "90", "100", "400"]).await;

        strategy.on_bar(&bar(240, 340.0, 341.0, 339.0, 340.5)).await.unwrap();
        assert_eq!(strategy.trail_period, 15);
        assert!(strategy
            .journal()
            .lines()
            .iter()
            .any(|l| l.contains("Downsampling to 15 mn")));
    }

    #[tokio::test]
    async fn test_rejects_unordered_levels() {
        let mock = Arc::new(MockGateway::new());
        let result = TrailingStrategy::new(
            "trailing",
            mock.clone(),
            &args(&["BTC-ETH", "1", "100", "90", "120"]),
            false,
            &StrategyOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(Error::InvalidArgs(_))));
    }
}
