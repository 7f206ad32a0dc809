//! Core data types for the exchange gateway

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// How an order reaches the book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Limit,
    /// Only becomes a limit order once the trigger price is crossed
    ConditionalStop,
}

/// Order status variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
}

/// An exchange order as reported by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub pair: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: f64,
    /// Limit price; for a range buy, the top of the range
    pub limit: f64,
    /// Trigger price of conditional orders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<f64>,
    /// Average execution price, zero until filled
    #[serde(default)]
    pub fill_price: f64,
    #[serde(default)]
    pub commission: f64,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed: Option<NaiveDateTime>,
}

impl Order {
    pub fn is_buy(&self) -> bool {
        self.side == OrderSide::Buy
    }

    pub fn is_sell(&self) -> bool {
        self.side == OrderSide::Sell
    }

    pub fn is_conditional(&self) -> bool {
        self.kind == OrderKind::ConditionalStop
    }

    /// Fill value before commission
    pub fn proceeds(&self) -> f64 {
        self.fill_price * self.quantity
    }
}

impl std::fmt::Display for Order {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {:.3} {} @ {:.8}", self.id, self.side.as_str(), self.quantity, self.pair, self.limit)?;
        if let Some(trigger) = self.trigger {
            write!(f, " trigger {:.8}", trigger)?;
        }
        write!(f, " {:?}", self.status)
    }
}

/// Holdings of the traded asset
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Total quantity held
    pub balance: f64,
    /// Quantity not reserved by resting orders
    pub available: f64,
}

/// An order placement request.
///
/// The order controller turns each variant into the matching gateway call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderIntent {
    BuyLimit { quantity: f64, price: f64 },
    /// Market-like buy accepted anywhere in `[low, high]`
    BuyLimitRange { quantity: f64, low: f64, high: f64 },
    SellLimit { quantity: f64, price: f64 },
    SellStop { quantity: f64, trigger: f64 },
}

impl std::fmt::Display for OrderIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderIntent::BuyLimit { quantity, price } => write!(f, "BUY LMT {:.3} @ {:.8}", quantity, price),
            OrderIntent::BuyLimitRange { quantity, low, high } => {
                write!(f, "BUY RNG {:.3} @ {:.8}-{:.8}", quantity, low, high)
            }
            OrderIntent::SellLimit { quantity, price } => write!(f, "SELL LMT {:.3} @ {:.8}", quantity, price),
            OrderIntent::SellStop { quantity, trigger } => write!(f, "SELL STP {:.3} @ {:.8}", quantity, trigger),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(side: OrderSide, kind: OrderKind) -> Order {
        Order {
            id: "1".into(),
            pair: "BTC-ETH".into(),
            side,
            kind,
            quantity: 2.0,
            limit: 0.05,
            trigger: None,
            fill_price: 0.04,
            commission: 0.0002,
            status: OrderStatus::Filled,
            opened: None,
            closed: None,
        }
    }

    #[test]
    fn test_order_helpers() {
        let buy = order(OrderSide::Buy, OrderKind::Limit);
        assert!(buy.is_buy());
        assert!(!buy.is_conditional());
        assert_eq!(buy.proceeds(), 0.08);

        let stop = order(OrderSide::Sell, OrderKind::ConditionalStop);
        assert!(stop.is_sell());
        assert!(stop.is_conditional());
    }

    #[test]
    fn test_intent_display() {
        let intent = OrderIntent::SellStop { quantity: 3.0, trigger: 1.0 };
        assert_eq!(intent.to_string(), "SELL STP 3.000 @ 1.00000000");
        let intent = OrderIntent::BuyLimitRange { quantity: 1.5, low: 1.0, high: 1.1 };
        assert_eq!(intent.to_string(), "BUY RNG 1.500 @ 1.00000000-1.10000000");
    }
}
