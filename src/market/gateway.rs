//! Exchange gateway abstraction - one trait for live, paper and backtest

use async_trait::async_trait;

use super::types::{Order, Position};
use crate::bars::Bar;
use crate::errors::Result;

/// Exchange capabilities a trading plan relies on.
///
/// Failures with `Error::InsufficientFunds` are retryable by the order
/// controller; every other error is fatal for the plan.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Latest (possibly still forming) bar
    async fn get_tick(&self, pair: &str) -> Result<Option<Bar>>;

    /// Bar history at the given granularity, oldest first
    async fn get_candles(&self, pair: &str, granularity: &str) -> Result<Vec<Bar>>;

    /// Orders still resting for the pair
    async fn get_open_orders(&self, pair: &str) -> Result<Vec<Order>>;

    /// Closed orders for the pair, most recent first
    async fn get_order_history(&self, pair: &str) -> Result<Vec<Order>>;

    /// Holdings of a single asset
    async fn get_position(&self, asset: &str) -> Result<Position>;

    async fn buy_limit(&self, pair: &str, quantity: f64, price: f64) -> Result<Order>;

    /// Buy filled anywhere between `low` and `high`
    async fn buy_limit_range(&self, pair: &str, quantity: f64, low: f64, high: f64) -> Result<Order>;

    async fn sell_limit(&self, pair: &str, quantity: f64, price: f64) -> Result<Order>;

    /// Conditional sell activated when the price falls to `trigger`
    async fn sell_stop(&self, pair: &str, quantity: f64, trigger: f64) -> Result<Order>;

    /// Returns `false` when there was nothing to cancel
    async fn cancel_order(&self, order: &Order) -> Result<bool>;
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// Scriptable gateway for testing strategies and the order controller
/// without an exchange connection.
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    use crate::errors::Error;
    use crate::market::types::{OrderKind, OrderSide, OrderStatus};

    /// Mock exchange for testing
    pub struct MockGateway {
        pub open_orders: Arc<Mutex<Vec<Order>>>,
        pub history: Arc<Mutex<Vec<Order>>>,
        pub placed: Arc<Mutex<Vec<Order>>>,
        pub cancelled: Arc<Mutex<Vec<String>>>,
        pub position: Arc<Mutex<Position>>,
        pub ticks: Arc<Mutex<VecDeque<Bar>>>,
        pub candles: Arc<Mutex<Vec<Bar>>>,
        /// Placements rejected with insufficient funds before one succeeds
        pub reject_insufficient: Arc<Mutex<u32>>,
        /// Placements rejected with a non-retryable business error
        pub reject_other: Arc<Mutex<Option<String>>>,
        /// The exchange fills the order just before a cancel arrives
        pub fill_on_cancel: Arc<Mutex<bool>>,
        /// `get_tick` never answers once the scripted ticks run out
        pub stall_when_drained: Arc<Mutex<bool>>,
        pub position_reads: AtomicU64,
        next_id: AtomicU64,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self {
                open_orders: Arc::new(Mutex::new(Vec::new())),
                history: Arc::new(Mutex::new(Vec::new())),
                placed: Arc::new(Mutex::new(Vec::new())),
                cancelled: Arc::new(Mutex::new(Vec::new())),
                position: Arc::new(Mutex::new(Position::default())),
                ticks: Arc::new(Mutex::new(VecDeque::new())),
                candles: Arc::new(Mutex::new(Vec::new())),
                reject_insufficient: Arc::new(Mutex::new(0)),
                reject_other: Arc::new(Mutex::new(None)),
                fill_on_cancel: Arc::new(Mutex::new(false)),
                stall_when_drained: Arc::new(Mutex::new(false)),
                position_reads: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
            }
        }

        pub async fn set_position(&self, balance: f64, available: f64) {
            *self.position.lock().await = Position { balance, available };
        }

        pub async fn set_reject_insufficient(&self, count: u32) {
            *self.reject_insufficient.lock().await = count;
        }

        pub async fn push_tick(&self, bar: Bar) {
            self.ticks.lock().await.push_back(bar);
        }

        pub fn position_reads(&self) -> u64 {
            self.position_reads.load(Ordering::SeqCst)
        }

        /// Fill every resting order at its limit price
        pub async fn fill_open_orders(&self) {
            let mut open = self.open_orders.lock().await;
            let mut history = self.history.lock().await;
            for mut order in open.drain(..) {
                order.status = OrderStatus::Filled;
                order.fill_price = order.trigger.unwrap_or(order.limit);
                history.insert(0, order);
            }
        }

        async fn place(&self, pair: &str, side: OrderSide, kind: OrderKind, quantity: f64, limit: f64, trigger: Option<f64>) -> Result<Order> {
            {
                let mut remaining = self.reject_insufficient.lock().await;
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::InsufficientFunds(format!("need {}", quantity)));
                }
            }
            if let Some(reason) = self.reject_other.lock().await.clone() {
                return Err(Error::Exchange(reason));
            }

            let order = Order {
                id: self.next_id.fetch_add(1, Ordering::SeqCst).to_string(),
                pair: pair.to_string(),
                side,
                kind,
                quantity,
                limit,
                trigger,
                fill_price: 0.0,
                commission: 0.0,
                status: OrderStatus::Open,
                opened: None,
                closed: None,
            };
            self.placed.lock().await.push(order.clone());
            self.open_orders.lock().await.push(order.clone());
            Ok(order)
        }
    }

    impl Default for MockGateway {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Gateway for MockGateway {
        async fn get_tick(&self, _pair: &str) -> Result<Option<Bar>> {
            let last = {
                let mut ticks = self.ticks.lock().await;
                if ticks.len() > 1 {
                    return Ok(ticks.pop_front());
                }
                // The last scripted tick keeps being served once the script ends
                ticks.front().copied()
            };
            if *self.stall_when_drained.lock().await {
                std::future::pending::<()>().await;
            }
            Ok(last)
        }

        async fn get_candles(&self, _pair: &str, _granularity: &str) -> Result<Vec<Bar>> {
            Ok(self.candles.lock().await.clone())
        }

        async fn get_open_orders(&self, _pair: &str) -> Result<Vec<Order>> {
            Ok(self.open_orders.lock().await.clone())
        }

        async fn get_order_history(&self, _pair: &str) -> Result<Vec<Order>> {
            Ok(self.history.lock().await.clone())
        }

        async fn get_position(&self, _asset: &str) -> Result<Position> {
            self.position_reads.fetch_add(1, Ordering::SeqCst);
            Ok(*self.position.lock().await)
        }

        async fn buy_limit(&self, pair: &str, quantity: f64, price: f64) -> Result<Order> {
            self.place(pair, OrderSide::Buy, OrderKind::Limit, quantity, price, None).await
        }

        async fn buy_limit_range(&self, pair: &str, quantity: f64, _low: f64, high: f64) -> Result<Order> {
            self.place(pair, OrderSide::Buy, OrderKind::Limit, quantity, high, None).await
        }

        async fn sell_limit(&self, pair: &str, quantity: f64, price: f64) -> Result<Order> {
            self.place(pair, OrderSide::Sell, OrderKind::Limit, quantity, price, None).await
        }

        async fn sell_stop(&self, pair: &str, quantity: f64, trigger: f64) -> Result<Order> {
            self.place(pair, OrderSide::Sell, OrderKind::ConditionalStop, quantity, trigger / 2.0, Some(trigger))
                .await
        }

        async fn cancel_order(&self, order: &Order) -> Result<bool> {
            if *self.fill_on_cancel.lock().await {
                self.fill_open_orders().await;
            }
            let mut open = self.open_orders.lock().await;
            let before = open.len();
            open.retain(|o| o.id != order.id);
            let removed = open.len() < before;
            if removed {
                self.cancelled.lock().await.push(order.id.clone());
            }
            Ok(removed)
        }
    }
}
