//! REST Gateway Implementation
//!
//! Talks to the exchange's v1.1 JSON API for trading and account calls and
//! to the v2.0 public endpoints for candles. Private calls carry the API key
//! and a nonce in the query string and are signed with HMAC-SHA512 over the
//! full URL (`apisign` header).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha512;

use super::gateway::Gateway;
use super::types::{Order, OrderKind, OrderSide, OrderStatus, Position};
use crate::bars::Bar;
use crate::config::ExchangeConfig;
use crate::consts::EPSILON;
use crate::errors::{Error, Result};
use crate::helpers::to_hex;

type HmacSha512 = Hmac<Sha512>;

const INSUFFICIENT_FUNDS: &str = "INSUFFICIENT_FUNDS";

/// Every response is wrapped in this envelope
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    message: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct PlacedOrder {
    #[serde(alias = "OrderId")]
    uuid: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawBalance {
    #[serde(default)]
    balance: Option<f64>,
    #[serde(default)]
    available: Option<f64>,
}

/// Order record as listed by the open-orders and history endpoints
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawOrder {
    order_uuid: String,
    exchange: String,
    order_type: String,
    quantity: f64,
    #[serde(default)]
    quantity_remaining: f64,
    #[serde(default)]
    limit: f64,
    #[serde(default, alias = "CommissionPaid")]
    commission: f64,
    #[serde(default)]
    price_per_unit: Option<f64>,
    #[serde(default)]
    is_conditional: bool,
    #[serde(default)]
    condition_target: Option<f64>,
    #[serde(default, alias = "TimeStamp")]
    opened: Option<NaiveDateTime>,
    #[serde(default)]
    closed: Option<NaiveDateTime>,
}

impl RawOrder {
    fn into_order(self, open: bool) -> Order {
        let side = if self.order_type.ends_with("BUY") {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };
        let status = if open {
            OrderStatus::Open
        } else if self.quantity_remaining < EPSILON {
            OrderStatus::Filled
        } else {
            OrderStatus::Cancelled
        };
        Order {
            id: self.order_uuid,
            pair: self.exchange,
            side,
            kind: if self.is_conditional {
                OrderKind::ConditionalStop
            } else {
                OrderKind::Limit
            },
            quantity: self.quantity,
            limit: self.limit,
            trigger: self.condition_target.filter(|_| self.is_conditional),
            fill_price: self.price_per_unit.unwrap_or(0.0),
            commission: self.commission,
            status,
            opened: self.opened,
            closed: self.closed,
        }
    }
}

/// Live exchange implementing [`Gateway`] over HTTPS
pub struct RestGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl RestGateway {
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
        })
    }

    fn public_url(&self, path: &str, query: &str) -> String {
        format!("{}/{}?{}", self.base_url, path, query)
    }

    fn private_url(&self, path: &str, query: &str) -> String {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let sep = if query.is_empty() { "" } else { "&" };
        format!(
            "{}/{}?{}{}apikey={}&nonce={}",
            self.base_url, path, query, sep, self.api_key, nonce
        )
    }

    /// Hex encoded HMAC-SHA512 of `url`
    fn sign(&self, url: &str) -> Result<String> {
        let mut mac = HmacSha512::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| Error::Config(format!("invalid api secret: {}", e)))?;
        mac.update(url.as_bytes());
        Ok(to_hex(&mac.finalize().into_bytes()))
    }

    async fn call<T: DeserializeOwned>(&self, url: String, signed: bool) -> Result<Option<T>> {
        debug!("GET {}", url);
        let mut request = self.client.get(&url);
        if signed {
            request = request.header("apisign", self.sign(&url)?);
        }

        let response = request.send().await?.error_for_status()?;
        let envelope: Envelope<T> = response.json().await?;
        if !envelope.success {
            return Err(if envelope.message == INSUFFICIENT_FUNDS {
                Error::InsufficientFunds(envelope.message)
            } else {
                Error::Exchange(envelope.message)
            });
        }
        Ok(envelope.result)
    }

    async fn place(&self, path: &str, query: String, order: Order) -> Result<Order> {
        let url = self.private_url(path, &query);
        let placed: PlacedOrder = self
            .call(url, true)
            .await?
            .ok_or_else(|| Error::Exchange(format!("no order id returned for {}", order)))?;
        let order = Order { id: placed.uuid, ..order };
        info!("Placed {}", order);
        Ok(order)
    }

    fn new_order(pair: &str, side: OrderSide, kind: OrderKind, quantity: f64, limit: f64, trigger: Option<f64>) -> Order {
        Order {
            id: String::new(),
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
        }
    }
}

#[async_trait]
impl Gateway for RestGateway {
    async fn get_tick(&self, pair: &str) -> Result<Option<Bar>> {
        let url = self.public_url(
            "Api/v2.0/pub/market/GetLatestTick",
            &format!("marketName={}&tickInterval=oneMin", pair),
        );
        let bars: Option<Vec<Bar>> = self.call(url, false).await?;
        Ok(bars.and_then(|b| b.last().copied()))
    }

    async fn get_candles(&self, pair: &str, granularity: &str) -> Result<Vec<Bar>> {
        let url = self.public_url(
            "Api/v2.0/pub/market/GetTicks",
            &format!("marketName={}&tickInterval={}", pair, granularity),
        );
        Ok(self.call(url, false).await?.unwrap_or_default())
    }

    async fn get_open_orders(&self, pair: &str) -> Result<Vec<Order>> {
        let url = self.private_url("api/v1.1/market/getopenorders", &format!("market={}", pair));
        let raw: Vec<RawOrder> = self.call(url, true).await?.unwrap_or_default();
        Ok(raw.into_iter().map(|o| o.into_order(true)).collect())
    }

    async fn get_order_history(&self, pair: &str) -> Result<Vec<Order>> {
        let url = self.private_url("api/v1.1/account/getorderhistory", &format!("market={}", pair));
        let raw: Vec<RawOrder> = self.call(url, true).await?.unwrap_or_default();
        Ok(raw.into_iter().map(|o| o.into_order(false)).collect())
    }

    async fn get_position(&self, asset: &str) -> Result<Position> {
        let url = self.private_url("api/v1.1/account/getbalance", &format!("currency={}", asset));
        let raw: RawBalance = self.call(url, true).await?.unwrap_or_default();
        Ok(Position {
            balance: raw.balance.unwrap_or(0.0),
            available: raw.available.unwrap_or(0.0),
        })
    }

    async fn buy_limit(&self, pair: &str, quantity: f64, price: f64) -> Result<Order> {
        let order = Self::new_order(pair, OrderSide::Buy, OrderKind::Limit, quantity, price, None);
        let query = format!("market={}&quantity={:.8}&rate={:.8}", pair, quantity, price);
        self.place("api/v1.1/market/buylimit", query, order).await
    }

    async fn buy_limit_range(&self, pair: &str, quantity: f64, low: f64, high: f64) -> Result<Order> {
        // The book fills at the best ask up to the top of the range
        debug!("range buy {} {:.8}-{:.8}", pair, low, high);
        self.buy_limit(pair, quantity, low.max(high)).await
    }

    async fn sell_limit(&self, pair: &str, quantity: f64, price: f64) -> Result<Order> {
        let order = Self::new_order(pair, OrderSide::Sell, OrderKind::Limit, quantity, price, None);
        let query = format!("market={}&quantity={:.8}&rate={:.8}", pair, quantity, price);
        self.place("api/v1.1/market/selllimit", query, order).await
    }

    async fn sell_stop(&self, pair: &str, quantity: f64, trigger: f64) -> Result<Order> {
        let rate = trigger / 2.0;
        let order = Self::new_order(pair, OrderSide::Sell, OrderKind::ConditionalStop, quantity, rate, Some(trigger));
        let query = format!(
            "marketName={}&orderType=LIMIT&quantity={:.8}&rate={:.8}&timeInEffect=GOOD_TIL_CANCELLED&conditionType=LESS_THAN&target={:.8}",
            pair, quantity, rate, trigger
        );
        self.place("api/v2.0/key/market/TradeSell", query, order).await
    }

    async fn cancel_order(&self, order: &Order) -> Result<bool> {
        let url = self.private_url("api/v1.1/market/cancel", &format!("uuid={}", order.id));
        match self.call::<serde_json::Value>(url, true).await {
            Ok(_) => Ok(true),
            Err(Error::Exchange(message)) if message == "ORDER_NOT_OPEN" || message == "INVALID_ORDER" => {
                warn!("Nothing to cancel for {}: {}", order.id, message);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> RestGateway {
        RestGateway::new(&ExchangeConfig {
            api_key: "key".into(),
            api_secret: "secret".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_sign_is_hex_sha512() {
        let signature = gateway().sign("https://bittrex.com/api/v1.1/market/getopenorders?apikey=key&nonce=1").unwrap();
        assert_eq!(signature.len(), 128);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sign_known_vector() {
        let gateway = RestGateway::new(&ExchangeConfig {
            api_secret: "key".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            gateway.sign("The quick brown fox jumps over the lazy dog").unwrap(),
            "b42af09057bac1e2d41708e48a902e09b5ff7f12ab428a4fe86653c73dd248fb\
             82f948a549f7b791a5b41915ee4d1ec3935357e4e2317250d0372afa2ebeeb3a"
        );
    }

    #[test]
    fn test_private_url_carries_key_and_nonce() {
        let url = gateway().private_url("api/v1.1/account/getbalance", "currency=ETH");
        assert!(url.starts_with("https://bittrex.com/api/v1.1/account/getbalance?currency=ETH&apikey=key&nonce="));
    }

    #[test]
    fn test_history_order_status() {
        let json = r#"[
            {"OrderUuid":"a","Exchange":"BTC-ETH","OrderType":"LIMIT_SELL","Quantity":2.0,
             "QuantityRemaining":0.0,"Limit":0.05,"Commission":0.0001,"PricePerUnit":0.051,
             "IsConditional":true,"ConditionTarget":0.1,"TimeStamp":"2018-01-10T10:01:00.667"},
            {"OrderUuid":"b","Exchange":"BTC-ETH","OrderType":"LIMIT_BUY","Quantity":2.0,
             "QuantityRemaining":2.0,"Limit":0.04,"Commission":0.0,"PricePerUnit":null,
             "IsConditional":false,"ConditionTarget":null}
        ]"#;
        let raw: Vec<RawOrder> = serde_json::from_str(json).unwrap();
        let orders: Vec<Order> = raw.into_iter().map(|o| o.into_order(false)).collect();

        assert_eq!(orders[0].status, OrderStatus::Filled);
        assert!(orders[0].is_sell());
        assert!(orders[0].is_conditional());
        assert_eq!(orders[0].trigger, Some(0.1));
        assert_eq!(orders[0].fill_price, 0.051);
        assert!(orders[0].opened.is_some());

        assert_eq!(orders[1].status, OrderStatus::Cancelled);
        assert!(orders[1].is_buy());
        assert_eq!(orders[1].trigger, None);
    }

    #[test]
    fn test_envelope_failure_message() {
        let json = r#"{"success":false,"message":"INSUFFICIENT_FUNDS","result":null}"#;
        let envelope: Envelope<PlacedOrder> = serde_json::from_str(json).unwrap();
        assert!(!envelope.success);
        assert_eq!(envelope.message, INSUFFICIENT_FUNDS);
        assert!(envelope.result.is_none());
    }
}
