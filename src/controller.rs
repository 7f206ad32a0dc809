//! Order lifecycle controller
//!
//! Sole owner of the "current outstanding order" of a strategy. Every
//! placement and cancellation goes through here so that a strategy never
//! has two live orders and never acts on an order listing fetched before
//! its own submission became visible.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::bars::Bar;
use crate::consts::MAX_ORDER_ATTEMPTS;
use crate::errors::{Error, Result};
use crate::helpers::asset_of;
use crate::market::{Gateway, Order, OrderIntent, OrderStatus, Position};

/// Bounded retry for placements rejected with insufficient funds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Pause between attempts; zero retries immediately
    pub backoff: Duration,
    /// Open-order listings checked before a cancel is considered failed
    pub cancel_confirm_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ORDER_ATTEMPTS,
            backoff: Duration::ZERO,
            cancel_confirm_attempts: MAX_ORDER_ATTEMPTS,
        }
    }
}

pub struct OrderController {
    gateway: Arc<dyn Gateway>,
    pair: String,
    asset: String,
    policy: RetryPolicy,
    order: Option<Order>,
    /// Set by `submit` until the new order is seen in a listing
    pending: bool,
    open_orders: Vec<Order>,
    position: Position,
}

impl OrderController {
    /// Build a controller and load the pair's open orders and position.
    /// An order already resting on the exchange becomes the tracked order.
    pub async fn new(gateway: Arc<dyn Gateway>, pair: &str, policy: RetryPolicy) -> Result<Self> {
        let asset = asset_of(pair).to_string();
        let mut controller = Self {
            gateway,
            pair: pair.to_string(),
            asset,
            policy,
            order: None,
            pending: false,
            open_orders: Vec::new(),
            position: Position::default(),
        };
        controller.refresh_open_orders().await?;
        for order in &controller.open_orders {
            info!("{} open order: {}", controller.pair, order);
        }
        controller.refresh_position().await?;
        Ok(controller)
    }

    pub fn pair(&self) -> &str {
        &self.pair
    }

    /// Traded asset, the second half of the pair
    pub fn asset(&self) -> &str {
        &self.asset
    }

    pub fn order(&self) -> Option<&Order> {
        self.order.as_ref()
    }

    pub fn has_order(&self) -> bool {
        self.order.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn open_orders(&self) -> &[Order] {
        &self.open_orders
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn tick(&self) -> Result<Option<Bar>> {
        self.gateway.get_tick(&self.pair).await
    }

    pub async fn candles(&self, granularity: &str) -> Result<Vec<Bar>> {
        self.gateway.get_candles(&self.pair, granularity).await
    }

    pub async fn refresh_position(&mut self) -> Result<Position> {
        self.position = self.gateway.get_position(&self.asset).await?;
        Ok(self.position)
    }

    /// Re-fetch open orders and update the tracked order.
    ///
    /// While a submission is pending and not yet listed, the tracked order
    /// is kept unless the order history already shows it closed.
    pub async fn refresh_open_orders(&mut self) -> Result<()> {
        self.open_orders = self.gateway.get_open_orders(&self.pair).await?;
        if let Some(first) = self.open_orders.first() {
            self.order = Some(first.clone());
            self.pending = false;
            return Ok(());
        }

        if self.pending {
            if let Some(tracked) = &self.order {
                let history = self.gateway.get_order_history(&self.pair).await?;
                if history.iter().any(|o| o.id == tracked.id) {
                    debug!("{} order {} closed before being listed", self.pair, tracked.id);
                    self.pending = false;
                    self.order = None;
                }
                return Ok(());
            }
            self.pending = false;
        }
        self.order = None;
        Ok(())
    }

    /// Re-fetch once if an order was just submitted; no-op otherwise
    pub async fn reconcile_if_pending(&mut self) -> Result<()> {
        if self.pending {
            self.refresh_open_orders().await?;
        }
        Ok(())
    }

    /// True when no order for the pair remains open
    pub async fn monitor_completion(&mut self, label: &str) -> Result<bool> {
        self.refresh_open_orders().await?;
        if self.order.is_none() {
            info!("{} {}completed", self.pair, label);
            Ok(true)
        } else {
            info!("{} {}still in place", self.pair, label);
            Ok(false)
        }
    }

    /// Cancel the tracked order, waiting until it leaves the open listing.
    ///
    /// Returns the history record when the order filled before the cancel
    /// reached the exchange.
    pub async fn cancel(&mut self) -> Result<Option<Order>> {
        let Some(order) = self.order.take() else {
            return Ok(None);
        };
        self.pending = false;

        if self.gateway.cancel_order(&order).await? {
            info!("{} cancelled order: {}", self.pair, order);
        } else {
            warn!("{} nothing to cancel for order {}", self.pair, order.id);
            let closed = self.order_history().await?.into_iter().find(|o| o.id == order.id);
            if let Some(closed) = closed {
                self.open_orders.retain(|o| o.id != order.id);
                if closed.status == OrderStatus::Filled {
                    warn!("{} order {} filled before the cancel", self.pair, order.id);
                    return Ok(Some(closed));
                }
                return Ok(None);
            }
        }

        for attempt in 1..=self.policy.cancel_confirm_attempts {
            self.open_orders = self.gateway.get_open_orders(&self.pair).await?;
            if !self.open_orders.iter().any(|o| o.id == order.id) {
                return Ok(None);
            }
            debug!(
                "{} order {} still listed after cancel ({}/{})",
                self.pair, order.id, attempt, self.policy.cancel_confirm_attempts
            );
            if !self.policy.backoff.is_zero() {
                tokio::time::sleep(self.policy.backoff).await;
            }
        }

        error!("{} cancel of {} never confirmed", self.pair, order.id);
        Err(Error::Exchange(format!("cancel of order {} not confirmed", order.id)))
    }

    /// Cancel every order resting for the pair, tracked or not
    pub async fn cancel_all_open(&mut self) -> Result<()> {
        self.refresh_open_orders().await?;
        while self.order.is_some() {
            self.cancel().await?;
            self.refresh_open_orders().await?;
        }
        Ok(())
    }

    /// Place `intent`, cancelling the tracked order first.
    ///
    /// Insufficient-funds rejections refresh the position and retry up to
    /// the policy bound; running out of attempts is fatal. Any other
    /// rejection is returned as is.
    pub async fn submit(&mut self, intent: OrderIntent) -> Result<Order> {
        if self.order.is_some() {
            self.cancel().await?;
        }

        let mut attempt = 0;
        let placed = loop {
            attempt += 1;
            match self.place(intent).await {
                Ok(order) => break order,
                Err(e) if e.is_retryable() => {
                    self.refresh_position().await?;
                    warn!(
                        "{} {} rejected: {} (available {:.8}, attempt {}/{})",
                        self.pair, intent, e, self.position.available, attempt, self.policy.max_attempts
                    );
                    if attempt >= self.policy.max_attempts {
                        error!("{} giving up on {} after {} attempts", self.pair, intent, attempt);
                        return Err(Error::RetriesExhausted {
                            attempts: attempt,
                            reason: e.to_string(),
                        });
                    }
                    if !self.policy.backoff.is_zero() {
                        tokio::time::sleep(self.policy.backoff).await;
                    }
                }
                Err(e) => {
                    error!("{} {} rejected: {}", self.pair, intent, e);
                    return Err(e);
                }
            }
        };

        info!("{} new order: {}", self.pair, placed);
        self.order = Some(placed.clone());
        self.pending = true;
        self.refresh_open_orders().await?;
        Ok(placed)
    }

    async fn place(&self, intent: OrderIntent) -> Result<Order> {
        let pair = self.pair.as_str();
        match intent {
            OrderIntent::BuyLimit { quantity, price } => self.gateway.buy_limit(pair, quantity, price).await,
            OrderIntent::BuyLimitRange { quantity, low, high } => {
                self.gateway.buy_limit_range(pair, quantity, low, high).await
            }
            OrderIntent::SellLimit { quantity, price } => self.gateway.sell_limit(pair, quantity, price).await,
            OrderIntent::SellStop { quantity, trigger } => self.gateway.sell_stop(pair, quantity, trigger).await,
        }
    }

    pub async fn order_history(&self) -> Result<Vec<Order>> {
        self.gateway.get_order_history(&self.pair).await
    }

    /// Most recent closed order; its absence is fatal
    pub async fn last_closed_order(&self) -> Result<Order> {
        self.order_history()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::OrderNotFound(format!("no closed order for {}", self.pair)))
    }

    /// Most recent filled buy, used when resuming a position
    pub async fn last_buy_order(&self) -> Result<Order> {
        self.order_history()
            .await?
            .into_iter()
            .find(|o| o.is_buy() && o.status == OrderStatus::Filled)
            .ok_or_else(|| Error::OrderNotFound(format!("no filled buy order for {}", self.pair)))
    }

    /// History record of an order this strategy placed; fatal when absent
    pub async fn find_closed(&self, order_id: &str) -> Result<Order> {
        self.order_history()
            .await?
            .into_iter()
            .find(|o| o.id == order_id)
            .ok_or_else(|| Error::OrderNotFound(format!("order {} not in history", order_id)))
    }

    /// Orders closed after `order_id`, most recent first
    pub async fn history_since(&self, order_id: &str) -> Result<Vec<Order>> {
        let history = self.order_history().await?;
        let idx = history
            .iter()
            .position(|o| o.id == order_id)
            .ok_or_else(|| Error::OrderNotFound(format!("order {} not in history", order_id)))?;
        Ok(history[..idx].to_vec())
    }
}
