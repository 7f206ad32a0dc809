//! Band strategies
//!
//! Both variants wait for the low to pierce the lower Bollinger band while
//! the bands are wide, buy at the low of the last closed bar and protect
//! the position with a virtual stop. They differ in the entry filter and
//! in how the position is managed:
//!
//! - `auto_bb` filters on low volume and rides the band middle and upper
//!   levels (`Middle` then `Top`)
//! - `auto_bbrsi` filters on an oversold RSI and trails the volatility
//!   stop until the RSI is overbought
//!
//! After a close the realized amount becomes the capital of the next
//! search, so a plan keeps trading until its capital is gone.

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;

use super::journal::Journal;
use super::ledger::PositionLedger;
use super::registry::StrategyFactory;
use super::stops::{Breach, StopPolicy, StopTracker};
use super::traits::{Strategy, StrategyOptions, StrategyStatus};
use crate::bars::{Bar, BarSeries};
use crate::consts::{DEFAULT_BAND_WIDTH, EPSILON};
use crate::controller::OrderController;
use crate::errors::{Error, Result};
use crate::helpers::{format_opt_price, format_price};
use crate::indicators::{last_closed_row, IndicatorConfig, IndicatorRow};
use crate::market::{Gateway, Order, OrderIntent, OrderStatus};

const RSI_OVERSOLD: f64 = 30.0;
const RSI_OVERBOUGHT: f64 = 70.0;
/// Fallback stop under the entry when the lower band is higher
const ENTRY_STOP_RATIO: f64 = 0.95;

#[derive(Parser, Debug)]
struct BandArgs {
    /// Minimum Bollinger band width to look for
    #[arg(short, long, default_value_t = DEFAULT_BAND_WIDTH)]
    percent: f64,
    /// Let the virtual stop move down when the position changes regime
    #[arg(long)]
    allow_widening: bool,
    /// Pair like BTC-ETH
    pair: String,
    /// Capital to use for the first trade
    amount: f64,
    /// Decision period in minutes
    period: u32,
}

/// Entry filter and management style
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandVariant {
    /// Low-volume entry, exits on the band levels
    Breakout,
    /// Oversold entry, exit when overbought
    Oscillator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandState {
    /// Started without buying: find the position on the exchange
    Recovering,
    Searching,
    Buying,
    /// Holding, price below the band middle
    Middle,
    /// Holding, price above the band middle
    Top,
    /// Holding, waiting for the RSI to turn overbought
    Oscillating,
    Selling,
}

impl BandState {
    pub fn label(&self) -> &'static str {
        match self {
            BandState::Recovering => "recovering",
            BandState::Searching => "searching",
            BandState::Buying => "buying",
            BandState::Middle => "middle",
            BandState::Top => "top",
            BandState::Oscillating => "rsi",
            BandState::Selling => "selling",
        }
    }

    fn is_holding(&self) -> bool {
        matches!(self, BandState::Middle | BandState::Top | BandState::Oscillating)
    }
}

fn below(value: f64, level: Option<f64>) -> bool {
    level.is_some_and(|l| value < l)
}

fn above(value: f64, level: Option<f64>) -> bool {
    level.is_some_and(|l| value > l)
}

fn fmt_opt(value: Option<f64>, decimals: usize) -> String {
    match value {
        Some(v) => format!("{:.*}", decimals, v),
        None => "None".to_string(),
    }
}

fn flag(ok: bool, name: &str) -> String {
    format!("{}{}", name, if ok { "ok" } else { "ko" })
}

pub struct BandStrategy {
    name: String,
    variant: BandVariant,
    controller: OrderController,
    journal: Journal,
    series: BarSeries,
    indicators: IndicatorConfig,
    period: u32,
    percent: f64,
    state: BandState,
    ledger: PositionLedger,
    stops: StopTracker,
    /// Limit price of the resting entry buy
    pending_entry: Option<f64>,
    buy_order: Option<String>,
    sell_order: Option<String>,
}

impl BandStrategy {
    pub async fn new(
        name: &str,
        variant: BandVariant,
        gateway: Arc<dyn Gateway>,
        args: &[String],
        buy: bool,
        options: &StrategyOptions,
    ) -> Result<Self> {
        let args = BandArgs::try_parse_from(std::iter::once(name).chain(args.iter().map(String::as_str)))?;
        if args.amount <= 0.0 || args.period == 0 {
            return Err(Error::InvalidArgs("amount and period must be positive".to_string()));
        }

        let controller = OrderController::new(gateway, &args.pair, options.retry).await?;
        let series = BarSeries::from_bars(controller.candles("oneMin").await?);
        let mut journal = Journal::new(&args.pair);
        let position = controller.position();
        journal.record(
            None,
            format!("Balance = {:.3} Available = {:.3}", position.balance, position.available),
        );
        journal.record(
            None,
            format!(
                "{} amount={} period={} mn percent={:.2}%",
                name,
                format_price(args.amount),
                args.period,
                args.percent * 100.0
            ),
        );

        let policy = StopPolicy {
            allow_widening: args.allow_widening,
        };
        Ok(Self {
            name: name.to_string(),
            variant,
            controller,
            journal,
            series,
            indicators: options.indicators,
            period: args.period,
            percent: args.percent,
            state: if buy { BandState::Searching } else { BandState::Recovering },
            ledger: PositionLedger::new(args.amount),
            stops: StopTracker::with_margin(policy, options.stop_margin),
            pending_entry: None,
            buy_order: None,
            sell_order: None,
        })
    }

    pub fn state(&self) -> BandState {
        self.state
    }

    /// Promote a breached virtual stop and watch the physical one
    async fn check_stop(&mut self, bar: &Bar) -> Result<()> {
        if !self.state.is_holding() {
            return Ok(());
        }

        match self.stops.breach(bar.low) {
            Breach::Place(level) => {
                self.journal.record(
                    Some(bar),
                    format!("Virtual stop reached. Putting a physical stop @ {}", format_price(level)),
                );
                let order = self
                    .controller
                    .submit(OrderIntent::SellStop {
                        quantity: self.ledger.quantity,
                        trigger: level,
                    })
                    .await?;
                self.stops.promote(level, &order.id);
            }
            Breach::Kept { candidate, physical } => {
                self.journal.record(
                    Some(bar),
                    format!(
                        "Virtual stop reached. Not lowering physical stop {} < {}",
                        format_price(candidate),
                        format_price(physical)
                    ),
                );
            }
            Breach::None => {}
        }

        let Some(stop_id) = self.stops.physical_order().map(str::to_string) else {
            return Ok(());
        };
        if self.controller.monitor_completion("Stop order ").await? {
            let exit = self.controller.find_closed(&stop_id).await?;
            if exit.status == OrderStatus::Filled {
                self.close_position(bar, &exit).await?;
            } else {
                self.journal.record(Some(bar), "Physical stop cancelled outside of the plan");
                self.stops.clear_physical();
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, bar: &Bar, row: Option<&IndicatorRow>) -> Result<()> {
        match self.state {
            BandState::Recovering => self.recover(bar).await,
            BandState::Buying => self.buying(bar, row).await,
            BandState::Selling => self.selling(bar).await,
            state => {
                let Some(row) = row else {
                    return Ok(());
                };
                match state {
                    BandState::Searching => self.search(bar, row).await,
                    BandState::Middle => self.middle(bar, row).await,
                    BandState::Top => self.top(bar, row).await,
                    BandState::Oscillating => self.oscillate(bar, row).await,
                    _ => Ok(()),
                }
            }
        }
    }

    async fn recover(&mut self, bar: &Bar) -> Result<()> {
        let buy = match self.controller.last_buy_order().await {
            Ok(order) => order,
            Err(e) => {
                self.journal.record(Some(bar), "No buy order. Aborting.");
                return Err(e);
            }
        };
        self.journal.record(Some(bar), format!("Recovered order {}", buy));

        let position = self.controller.refresh_position().await?;
        if position.balance + EPSILON < buy.quantity {
            self.journal.record(
                Some(bar),
                format!("Invalid balance {:.3} < {:.3}. Aborting", position.balance, buy.quantity),
            );
            return Err(Error::InvalidPosition(format!(
                "balance {:.8} below recovered buy of {:.8}",
                position.balance, buy.quantity
            )));
        }
        self.buy_order = Some(buy.id);
        self.state = BandState::Buying;
        Ok(())
    }

    async fn search(&mut self, bar: &Bar, row: &IndicatorRow) -> Result<()> {
        let price_ok = below(bar.low, row.bb_lower);
        let width_ok = row.bb_width.is_some_and(|w| w > self.percent);
        let (filter_ok, filter_msg) = match self.variant {
            BandVariant::Breakout => {
                let ok = below(row.bar.volume, row.volume_ma);
                (
                    ok,
                    format!("{}({:.2} < {})", flag(ok, "vol"), row.bar.volume, fmt_opt(row.volume_ma, 2)),
                )
            }
            BandVariant::Oscillator => {
                let ok = row.rsi.is_some_and(|r| r < RSI_OVERSOLD);
                (
                    ok,
                    format!("{}({} < {:.0})", flag(ok, "rsi"), fmt_opt(row.rsi, 1), RSI_OVERSOLD),
                )
            }
        };
        self.journal.record(
            Some(bar),
            format!(
                "{} {}({} < {}) {}({} > {:.2})",
                filter_msg,
                flag(price_ok, "price"),
                format_price(bar.low),
                format_opt_price(row.bb_lower),
                flag(width_ok, "bb"),
                fmt_opt(row.bb_width, 2),
                self.percent
            ),
        );

        if filter_ok && price_ok && width_ok {
            let entry = row.bar.low;
            let quantity = self.ledger.capital / entry;
            let order = self
                .controller
                .submit(OrderIntent::BuyLimit { quantity, price: entry })
                .await?;
            self.journal.record(Some(bar), format!("buying {:.6} @ {}", quantity, format_price(entry)));
            self.buy_order = Some(order.id);
            self.pending_entry = Some(entry);
            self.state = BandState::Buying;
        }
        Ok(())
    }

    async fn buying(&mut self, bar: &Bar, row: Option<&IndicatorRow>) -> Result<()> {
        if self.controller.monitor_completion("Buy order ").await? {
            let id = self
                .buy_order
                .clone()
                .ok_or_else(|| Error::OrderNotFound("no buy order tracked".to_string()))?;
            let order = self.controller.find_closed(&id).await?;
            self.pending_entry = None;
            if order.status != OrderStatus::Filled {
                self.journal.record(Some(bar), "Buy order cancelled outside of the plan");
                self.buy_order = None;
                self.state = BandState::Searching;
                return Ok(());
            }

            self.entered(bar, row, &order);
            return Ok(());
        }

        if let (Some(entry), Some(row)) = (self.pending_entry, row) {
            if entry < row.bar.low {
                self.journal.record(
                    Some(bar),
                    format!(
                        "entry {} < low {} -> canceling order",
                        format_price(entry),
                        format_price(row.bar.low)
                    ),
                );
                self.pending_entry = None;
                if let Some(order) = self.controller.cancel().await? {
                    self.journal.record(Some(bar), "buy order filled before the cancel");
                    self.entered(bar, Some(row), &order);
                    return Ok(());
                }
                self.buy_order = None;
                self.state = BandState::Searching;
            }
        }
        Ok(())
    }

    /// Open the ledger on a filled buy and place the first stop
    fn entered(&mut self, bar: &Bar, row: Option<&IndicatorRow>, order: &Order) {
        self.ledger.open(order);
        let entry = order.fill_price;
        self.journal.record(
            Some(bar),
            format!(
                "bought {:.6} @ {} fees {}",
                order.quantity,
                format_price(entry),
                format_price(order.commission)
            ),
        );

        let fallback = entry * ENTRY_STOP_RATIO;
        match self.variant {
            BandVariant::Breakout => {
                // A recovered position may already be above the middle
                self.state = if above(bar.close, row.and_then(|r| r.bb_middle)) {
                    BandState::Top
                } else {
                    BandState::Middle
                };
                let stop = row.and_then(|r| r.bb_lower).map_or(fallback, |l| l.min(fallback));
                self.set_stop(bar, stop);
            }
            BandVariant::Oscillator => {
                self.state = BandState::Oscillating;
                let stop = row.and_then(|r| r.atr_stop).unwrap_or(fallback);
                self.set_stop(bar, stop);
            }
        }
    }

    async fn middle(&mut self, bar: &Bar, row: &IndicatorRow) -> Result<()> {
        let vol_ok = above(row.bar.volume, row.volume_ma);
        let price_ok = above(bar.high, row.bb_middle);
        self.journal.record(
            Some(bar),
            format!(
                "{}({:.2} > {}) {}({} > {})",
                flag(vol_ok, "vol"),
                row.bar.volume,
                fmt_opt(row.volume_ma, 2),
                flag(price_ok, "price"),
                format_price(bar.high),
                format_opt_price(row.bb_middle)
            ),
        );
        if price_ok {
            if vol_ok {
                self.state = BandState::Top;
                if let Some(entry) = self.ledger.entry {
                    self.set_stop(bar, entry);
                }
            } else {
                self.sell(bar).await?;
            }
        }
        Ok(())
    }

    async fn top(&mut self, bar: &Bar, row: &IndicatorRow) -> Result<()> {
        let vol_ok = below(row.bar.volume, row.volume_ma);
        let price_ok = above(row.bar.high, row.bb_upper);
        self.journal.record(
            Some(bar),
            format!(
                "{}({:.2} < {}) {}({} > {})",
                flag(vol_ok, "vol"),
                row.bar.volume,
                fmt_opt(row.volume_ma, 2),
                flag(price_ok, "price"),
                format_price(row.bar.high),
                format_opt_price(row.bb_upper)
            ),
        );
        if price_ok {
            if vol_ok {
                self.sell(bar).await?;
            } else if let Some(middle) = row.bb_middle {
                // Back to the middle band: a widening unless the policy clamps it
                self.set_stop(bar, middle);
            }
        }
        Ok(())
    }

    async fn oscillate(&mut self, bar: &Bar, row: &IndicatorRow) -> Result<()> {
        let rsi_ok = row.rsi.is_some_and(|r| r > RSI_OVERBOUGHT);
        self.journal.record(
            Some(bar),
            format!("{}({} > {:.0})", flag(rsi_ok, "rsi"), fmt_opt(row.rsi, 1), RSI_OVERBOUGHT),
        );
        if rsi_ok {
            self.sell(bar).await?;
        } else if let Some(stop) = row.atr_stop {
            self.set_stop(bar, stop);
        }
        Ok(())
    }

    /// Sell everything with a limit far under the market
    async fn sell(&mut self, bar: &Bar) -> Result<()> {
        let order = self
            .controller
            .submit(OrderIntent::SellLimit {
                quantity: self.ledger.quantity,
                price: bar.low / 2.0,
            })
            .await?;
        // The submit replaced any physical stop
        self.stops.clear_physical();
        self.sell_order = Some(order.id);
        self.state = BandState::Selling;
        Ok(())
    }

    async fn selling(&mut self, bar: &Bar) -> Result<()> {
        if !self.controller.monitor_completion("Sell order ").await? {
            return Ok(());
        }
        let id = self
            .sell_order
            .clone()
            .ok_or_else(|| Error::OrderNotFound("no sell order tracked".to_string()))?;
        let exit = self.controller.find_closed(&id).await?;
        if exit.status == OrderStatus::Filled {
            self.close_position(bar, &exit).await
        } else {
            self.journal.record(Some(bar), "Sell order cancelled outside of the plan, selling again");
            self.sell(bar).await
        }
    }

    async fn close_position(&mut self, bar: &Bar, exit: &Order) -> Result<()> {
        let previous = self.ledger.capital;
        let amount = self.ledger.realize(&self.controller, exit).await?;
        self.journal.record(
            Some(bar),
            format!(
                "sold {:.6} @ {} => {:.8} {:.8} {:.2}%",
                exit.quantity,
                format_price(exit.fill_price),
                amount,
                previous,
                (amount / previous - 1.0) * 100.0
            ),
        );
        self.stops.reset();
        self.pending_entry = None;
        self.buy_order = None;
        self.sell_order = None;
        self.state = BandState::Searching;
        Ok(())
    }

    fn set_stop(&mut self, bar: &Bar, level: f64) {
        let previous = self.stops.virtual_stop();
        let applied = self.stops.set_virtual(level);
        if applied != level {
            self.journal.record(
                Some(bar),
                format!(
                    "Keeping virtual stop at {} (not widening to {})",
                    format_price(applied),
                    format_price(level)
                ),
            );
        } else if previous != Some(applied) {
            self.journal.record(Some(bar), format!("Setting virtual stop to {}", format_price(applied)));
        }
    }

    fn record_status(&mut self, bar: &Bar) {
        let line = match self.variant {
            BandVariant::Breakout => format!(
                "{} {} {}-{} {:.8} ({:.6} x {})",
                self.state.label(),
                format_price(bar.close),
                format_price(bar.low),
                format_price(bar.high),
                self.ledger.capital,
                self.ledger.quantity,
                format_opt_price(self.ledger.entry)
            ),
            BandVariant::Oscillator => {
                let percent = self.ledger.entry.map_or(0.0, |e| (bar.close / e - 1.0) * 100.0);
                format!(
                    "{} {} {}-{} {:.8} ({:.6} x {}) vstop={} pstop={} {:.2}%",
                    self.state.label(),
                    format_price(bar.close),
                    format_price(bar.low),
                    format_price(bar.high),
                    self.ledger.capital,
                    self.ledger.quantity,
                    format_opt_price(self.ledger.entry),
                    format_opt_price(self.stops.virtual_stop()),
                    format_opt_price(self.stops.physical_stop()),
                    percent
                )
            }
        };
        self.journal.record(Some(bar), line);
    }
}

#[async_trait]
impl Strategy for BandStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn pair(&self) -> &str {
        self.controller.pair()
    }

    async fn on_bar(&mut self, bar: &Bar) -> Result<bool> {
        self.series.push(*bar);
        let row = last_closed_row(&self.series, self.period, &self.indicators);
        self.controller.reconcile_if_pending().await?;

        // The stop runs first; the state logic still sees this bar
        self.check_stop(bar).await?;
        self.dispatch(bar, row.as_ref()).await?;

        self.record_status(bar);
        Ok(self.ledger.capital > 0.0)
    }

    fn status(&self) -> StrategyStatus {
        StrategyStatus {
            state: self.state.label().to_string(),
            capital: self.ledger.capital,
            quantity: self.ledger.quantity,
            entry: self.ledger.entry,
            virtual_stop: self.stops.virtual_stop(),
            physical_stop: self.stops.physical_stop(),
            realized: self.ledger.realized,
        }
    }

    fn journal(&self) -> &Journal {
        &self.journal
    }
}

/// `auto_bb`
pub struct BandBreakoutFactory;

#[async_trait]
impl StrategyFactory for BandBreakoutFactory {
    async fn create(
        &self,
        name: &str,
        gateway: Arc<dyn Gateway>,
        args: &[String],
        buy: bool,
        options: &StrategyOptions,
    ) -> Result<Box<dyn Strategy>> {
        let strategy = BandStrategy::new(name, BandVariant::Breakout, gateway, args, buy, options).await?;
        Ok(Box::new(strategy))
    }
}

/// `auto_bbrsi`
pub struct BandOscillatorFactory;

#[async_trait]
impl StrategyFactory for BandOscillatorFactory {
    async fn create(
        &self,
        name: &str,
        gateway: Arc<dyn Gateway>,
        args: &[String],
        buy: bool,
        options: &StrategyOptions,
    ) -> Result<Box<dyn Strategy>> {
        let strategy = BandStrategy::new(name, BandVariant::Oscillator, gateway, args, buy, options).await?;
        Ok(Box::new(strategy))
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

    fn row(closed: Bar) -> IndicatorRow {
        IndicatorRow {
            bar: closed,
            bb_middle: Some(110.0),
            bb_upper: Some(120.0),
            bb_lower: Some(100.0),
            bb_width: Some(0.06),
            volume_ma: Some(20.0),
            rsi: Some(25.0),
            atr_stop: Some(92.0),
        }
    }

    async fn strategy(mock: &Arc<MockGateway>, variant: BandVariant, extra: &[&str]) -> BandStrategy {
        let mut list = extra.to_vec();
        list.extend_from_slice(&["BTC-ETH", "1.0", "1"]);
        BandStrategy::new("auto_bb", variant, mock.clone(), &args(&list), true, &StrategyOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_breakout_entry() {
        let mock = Arc::new(MockGateway::new());
        let mut strategy = strategy(&mock, BandVariant::Breakout, &[]).await;

        // closed bar: low 95, volume 10 under its average of 20
        let closed = bar(0, 98.0, 99.0, 95.0, 96.0);
        let tick = bar(1, 96.0, 97.0, 95.0, 96.0);
        strategy.search(&tick, &row(closed)).await.unwrap();

        let placed = mock.placed.lock().await.clone();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, OrderSide::Buy);
        assert_eq!(placed[0].limit, 95.0);
        assert_eq!(placed[0].quantity, 1.0 / 95.0);
        assert_eq!(strategy.state(), BandState::Buying);
    }

    #[tokio::test]
    async fn test_no_entry_when_band_narrow() {
        let mock = Arc::new(MockGateway::new());
        let mut strategy = strategy(&mock, BandVariant::Breakout, &["-p", "0.08"]).await;

        let closed = bar(0, 98.0, 99.0, 95.0, 96.0);
        strategy.search(&bar(1, 96.0, 97.0, 95.0, 96.0), &row(closed)).await.unwrap();
        assert!(mock.placed.lock().await.is_empty());
        assert_eq!(strategy.state(), BandState::Searching);
    }

    #[tokio::test]
    async fn test_buy_cancelled_when_price_moves_away() {
        let mock = Arc::new(MockGateway::new());
        let mut strategy = strategy(&mock, BandVariant::Breakout, &[]).await;
        let closed = bar(0, 98.0, 99.0, 95.0, 96.0);
        strategy.search(&bar(1, 96.0, 97.0, 95.0, 96.0), &row(closed)).await.unwrap();

        let higher = bar(2, 97.0, 98.0, 96.0, 97.5);
        strategy.buying(&bar(3, 97.0, 98.0, 96.5, 97.0), Some(&row(higher))).await.unwrap();
        assert_eq!(strategy.state(), BandState::Searching);
        assert_eq!(mock.cancelled.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_buy_filled_before_cancel_is_managed() {
        let mock = Arc::new(MockGateway::new());
        let mut strategy = strategy(&mock, BandVariant::Breakout, &[]).await;
        let closed = bar(0, 98.0, 99.0, 95.0, 96.0);
        strategy.search(&bar(1, 96.0, 97.0, 95.0, 96.0), &row(closed)).await.unwrap();

        *mock.fill_on_cancel.lock().await = true;
        let higher = bar(2, 97.0, 98.0, 96.0, 97.5);
        strategy.buying(&bar(3, 97.0, 98.0, 96.5, 97.0), Some(&row(higher))).await.unwrap();
        assert_eq!(strategy.state(), BandState::Middle);
        assert_eq!(strategy.ledger.entry, Some(95.0));
        assert_eq!(strategy.stops.virtual_stop(), Some(95.0 * 0.95));
        assert!(mock.cancelled.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_round_trip_realizes_amount() {
        let mock = Arc::new(MockGateway::new());
        let mut strategy = strategy(&mock, BandVariant::Breakout, &[]).await;
        let closed = bar(0, 98.0, 99.0, 95.0, 96.0);
        let indicators = row(closed);
        strategy.search(&bar(1, 96.0, 97.0, 95.0, 96.0), &indicators).await.unwrap();

        mock.fill_open_orders().await;
        mock.set_position(1.0 / 95.0, 1.0 / 95.0).await;
        strategy.buying(&bar(2, 96.0, 97.0, 95.0, 96.0), Some(&indicators)).await.unwrap();
        assert_eq!(strategy.state(), BandState::Middle);
        // min(lower band 100, 95 * 0.95)
        assert_eq!(strategy.stops.virtual_stop(), Some(95.0 * 0.95));

        let crash = bar(3, 91.0, 91.0, 89.0, 90.0);
        strategy.check_stop(&crash).await.unwrap();
        let stop = mock.placed.lock().await.last().cloned().unwrap();
        assert_eq!(stop.kind, OrderKind::ConditionalStop);
        assert_eq!(stop.trigger, Some(89.0 * 0.99));

        mock.fill_open_orders().await;
        strategy.check_stop(&bar(4, 88.0, 89.0, 87.0, 88.0)).await.unwrap();
        assert_eq!(strategy.state(), BandState::Searching);
        let expected = 89.0 * 0.99 * (1.0 / 95.0);
        assert_eq!(strategy.ledger.realized, Some(expected));
        assert_eq!(strategy.ledger.capital, expected);
        assert_eq!(strategy.stops.physical_stop(), None);
    }

    #[tokio::test]
    async fn test_top_stop_clamped_without_widening() {
        let mock = Arc::new(MockGateway::new());
        let mut strategy = strategy(&mock, BandVariant::Breakout, &[]).await;
        strategy.state = BandState::Top;
        strategy.ledger.entry = Some(112.0);
        strategy.ledger.quantity = 1.0;
        strategy.stops.set_virtual(112.0);

        // closed high above the upper band on rising volume
        let mut closed = bar(0, 118.0, 125.0, 117.0, 121.0);
        closed.volume = 30.0;
        strategy.top(&bar(1, 121.0, 122.0, 120.0, 121.0), &row(closed)).await.unwrap();
        assert_eq!(strategy.stops.virtual_stop(), Some(112.0));

        let mut widening = self::strategy(&mock, BandVariant::Breakout, &["--allow-widening"]).await;
        widening.state = BandState::Top;
        widening.stops.set_virtual(112.0);
        widening.top(&bar(1, 121.0, 122.0, 120.0, 121.0), &row(closed)).await.unwrap();
        assert_eq!(widening.stops.virtual_stop(), Some(110.0));
    }

    #[tokio::test]
    async fn test_oscillator_sells_when_overbought() {
        let mock = Arc::new(MockGateway::new());
        mock.set_position(2.0, 2.0).await;
        let mut strategy = strategy(&mock, BandVariant::Oscillator, &[]).await;
        strategy.state = BandState::Oscillating;
        strategy.ledger.entry = Some(100.0);
        strategy.ledger.quantity = 2.0;

        let mut indicators = row(bar(0, 100.0, 101.0, 99.0, 100.0));
        strategy.oscillate(&bar(1, 100.0, 101.0, 99.0, 100.0), &indicators).await.unwrap();
        assert_eq!(strategy.stops.virtual_stop(), Some(92.0));

        indicators.rsi = Some(75.0);
        strategy.oscillate(&bar(2, 104.0, 105.0, 103.0, 104.0), &indicators).await.unwrap();
        assert_eq!(strategy.state(), BandState::Selling);
        let sell = mock.placed.lock().await.last().cloned().unwrap();
        assert_eq!(sell.limit, 103.0 / 2.0);
        assert_eq!(sell.quantity, 2.0);
    }

    #[tokio::test]
    async fn test_recovery_requires_buy_in_history() {
        let mock = Arc::new(MockGateway::new());
        let mut strategy = BandStrategy::new(
            "auto_bb",
            BandVariant::Breakout,
            mock.clone(),
            &args(&["BTC-ETH", "1.0", "1"]),
            false,
            &StrategyOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(strategy.state(), BandState::Recovering);
        let err = strategy.on_bar(&bar(0, 1.0, 1.0, 1.0, 1.0)).await.unwrap_err();
        assert!(matches!(err, Error::OrderNotFound(_)));
    }
}
