//! Simulated Gateway Implementation
//!
//! Matches the single resting order against each bar fed in, so a strategy
//! can run unmodified against recorded history or, with a live market data
//! source attached, as paper trading.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use super::gateway::Gateway;
use super::types::{Order, OrderKind, OrderSide, OrderStatus, Position};
use crate::bars::Bar;
use crate::consts::{DEFAULT_FEE_RATE, EPSILON};
use crate::errors::{Error, Result};

/// Input configuration for creating a SimulatedGateway
#[derive(Debug, Clone)]
pub struct SimulatedGatewayInput {
    /// Commission as a fraction of the filled notional
    pub fee_rate: f64,
    /// Starting holdings of the traded asset
    pub balance: f64,
    pub available: f64,
    /// Bars known before the first `feed`
    pub candles: Vec<Bar>,
}

impl Default for SimulatedGatewayInput {
    fn default() -> Self {
        Self {
            fee_rate: DEFAULT_FEE_RATE,
            balance: 0.0,
            available: 0.0,
            candles: Vec::new(),
        }
    }
}

/// Resting order plus the bottom of its buy range, if any
#[derive(Debug, Clone)]
struct RestingOrder {
    order: Order,
    range_low: Option<f64>,
}

impl RestingOrder {
    /// Fill price if `bar` crosses this order
    fn match_price(&self, bar: &Bar) -> Option<f64> {
        let order = &self.order;
        match (order.side, order.kind) {
            (OrderSide::Buy, _) => {
                if bar.low > order.limit {
                    return None;
                }
                Some(match self.range_low {
                    Some(low) => bar.open.clamp(low, order.limit),
                    None => order.limit,
                })
            }
            (OrderSide::Sell, OrderKind::ConditionalStop) => {
                let trigger = order.trigger.unwrap_or(order.limit);
                (bar.low <= trigger).then_some(trigger)
            }
            (OrderSide::Sell, _) => (bar.high >= order.limit).then(|| (bar.high + bar.low) / 2.0),
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    candles: Vec<Bar>,
    resting: Option<RestingOrder>,
    /// Terminal orders, most recent first
    history: Vec<Order>,
    position: Position,
    next_id: u64,
}

impl SimState {
    fn now(&self) -> Option<NaiveDateTime> {
        self.candles.last().map(|b| b.timestamp)
    }
}

/// Backtest matching engine implementing [`Gateway`]
///
/// Matching happens in [`SimulatedGateway::feed`], once per bar, against
/// the one resting order. Order ids are sequential (`sim-1`, `sim-2`, ...)
/// so two runs over the same tape produce the same history.
pub struct SimulatedGateway {
    fee_rate: f64,
    state: Mutex<SimState>,
    /// Price source for paper trading
    market_data: Option<Arc<dyn Gateway>>,
}

impl SimulatedGateway {
    pub fn new(input: SimulatedGatewayInput) -> Self {
        let state = SimState {
            candles: input.candles,
            position: Position {
                balance: input.balance,
                available: input.available,
            },
            next_id: 1,
            ..Default::default()
        };
        Self {
            fee_rate: input.fee_rate,
            state: Mutex::new(state),
            market_data: None,
        }
    }

    /// Serve ticks and candles from `source` while still matching locally
    pub fn with_market_data(input: SimulatedGatewayInput, source: Arc<dyn Gateway>) -> Self {
        let mut gateway = Self::new(input);
        gateway.market_data = Some(source);
        gateway
    }

    /// Append `bar` to the known history and match the resting order
    /// against it. Returns the order filled by this bar, if any. A bar
    /// older than the history is ignored.
    pub async fn feed(&self, bar: &Bar) -> Option<Order> {
        let mut state = self.state.lock().await;
        match state.candles.last_mut() {
            Some(last) if bar.timestamp < last.timestamp => {
                warn!("[SIM] ignoring bar at {} older than {}", bar.timestamp, last.timestamp);
                return None;
            }
            Some(last) if last.timestamp == bar.timestamp => *last = *bar,
            _ => state.candles.push(*bar),
        }

        let price = state.resting.as_ref()?.match_price(bar)?;
        let resting = state.resting.take()?;
        let mut order = resting.order;
        order.fill_price = price;
        order.commission = price * order.quantity * self.fee_rate;
        order.status = OrderStatus::Filled;
        order.closed = Some(bar.timestamp);

        match order.side {
            OrderSide::Buy => {
                state.position.balance += order.quantity;
                state.position.available += order.quantity;
            }
            // Quantity was already taken out of `available` when placed
            OrderSide::Sell => state.position.balance -= order.quantity,
        }

        info!(
            "[SIM] filled {} at {:.8} (commission {:.8})",
            order, order.fill_price, order.commission
        );
        state.history.insert(0, order.clone());
        Some(order)
    }

    pub async fn position(&self) -> Position {
        self.state.lock().await.position
    }

    /// Terminal orders, most recent first
    pub async fn history(&self) -> Vec<Order> {
        self.state.lock().await.history.clone()
    }

    async fn place(
        &self,
        pair: &str,
        side: OrderSide,
        kind: OrderKind,
        quantity: f64,
        limit: f64,
        trigger: Option<f64>,
        range_low: Option<f64>,
    ) -> Result<Order> {
        if quantity <= 0.0 || !quantity.is_finite() {
            return Err(Error::Exchange(format!("INVALID_QUANTITY {}", quantity)));
        }

        let mut state = self.state.lock().await;
        if state.resting.is_some() {
            return Err(Error::Exchange("ORDER_ALREADY_RESTING".to_string()));
        }
        if side == OrderSide::Sell {
            if quantity > state.position.available + EPSILON {
                return Err(Error::InsufficientFunds(format!(
                    "sell {:.8} with {:.8} available",
                    quantity, state.position.available
                )));
            }
            state.position.available = (state.position.available - quantity).max(0.0);
        }

        let order = Order {
            id: format!("sim-{}", state.next_id),
            pair: pair.to_string(),
            side,
            kind,
            quantity,
            limit,
            trigger,
            fill_price: 0.0,
            commission: 0.0,
            status: OrderStatus::Open,
            opened: state.now(),
            closed: None,
        };
        state.next_id += 1;
        debug!("[SIM] accepted {}", order);
        state.resting = Some(RestingOrder {
            order: order.clone(),
            range_low,
        });
        Ok(order)
    }
}

#[async_trait]
impl Gateway for SimulatedGateway {
    async fn get_tick(&self, pair: &str) -> Result<Option<Bar>> {
        if let Some(source) = &self.market_data {
            return source.get_tick(pair).await;
        }
        Ok(self.state.lock().await.candles.last().copied())
    }

    async fn get_candles(&self, pair: &str, granularity: &str) -> Result<Vec<Bar>> {
        if let Some(source) = &self.market_data {
            return source.get_candles(pair, granularity).await;
        }
        Ok(self.state.lock().await.candles.clone())
    }

    async fn get_open_orders(&self, _pair: &str) -> Result<Vec<Order>> {
        let state = self.state.lock().await;
        Ok(state.resting.iter().map(|r| r.order.clone()).collect())
    }

    async fn get_order_history(&self, _pair: &str) -> Result<Vec<Order>> {
        Ok(self.state.lock().await.history.clone())
    }

    async fn get_position(&self, _asset: &str) -> Result<Position> {
        Ok(self.state.lock().await.position)
    }

    async fn buy_limit(&self, pair: &str, quantity: f64, price: f64) -> Result<Order> {
        self.place(pair, OrderSide::Buy, OrderKind::Limit, quantity, price, None, None)
            .await
    }

    async fn buy_limit_range(&self, pair: &str, quantity: f64, low: f64, high: f64) -> Result<Order> {
        let (low, high) = if low <= high { (low, high) } else { (high, low) };
        self.place(pair, OrderSide::Buy, OrderKind::Limit, quantity, high, None, Some(low))
            .await
    }

    async fn sell_limit(&self, pair: &str, quantity: f64, price: f64) -> Result<Order> {
        self.place(pair, OrderSide::Sell, OrderKind::Limit, quantity, price, None, None)
            .await
    }

    async fn sell_stop(&self, pair: &str, quantity: f64, trigger: f64) -> Result<Order> {
        // Once triggered the order may sell down to half the trigger
        self.place(
            pair,
            OrderSide::Sell,
            OrderKind::ConditionalStop,
            quantity,
            trigger / 2.0,
            Some(trigger),
            None,
        )
        .await
    }

    async fn cancel_order(&self, order: &Order) -> Result<bool> {
        let mut state = self.state.lock().await;
        let matches = state
            .resting
            .as_ref()
            .map(|r| r.order.id == order.id)
            .unwrap_or(false);
        if !matches {
            return Ok(false);
        }
        let Some(resting) = state.resting.take() else {
            return Ok(false);
        };

        let mut cancelled = resting.order;
        if cancelled.is_sell() {
            state.position.available += cancelled.quantity;
        }
        cancelled.status = OrderStatus::Cancelled;
        cancelled.closed = state.now();
        debug!("[SIM] cancelled {}", cancelled);
        state.history.insert(0, cancelled);
        Ok(true)
    }
}
