//! Position accounting shared by the strategies

use crate::controller::OrderController;
use crate::errors::Result;
use crate::market::Order;

/// Entry, size and fees of the current position, plus the capital that
/// funds the next one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionLedger {
    /// Amount available for the next entry
    pub capital: f64,
    pub entry: Option<f64>,
    pub quantity: f64,
    /// Commission paid on the entry fill
    pub cost: f64,
    /// Result of the last closed position
    pub realized: Option<f64>,
    entry_order: Option<String>,
}

impl PositionLedger {
    pub fn new(capital: f64) -> Self {
        Self {
            capital,
            ..Default::default()
        }
    }

    pub fn is_open(&self) -> bool {
        self.entry.is_some() && self.quantity > 0.0
    }

    pub fn entry_order(&self) -> Option<&str> {
        self.entry_order.as_deref()
    }

    /// Record the entry from the exchange's own fill record
    pub fn open(&mut self, buy: &Order) {
        self.entry = Some(buy.fill_price);
        self.quantity = buy.quantity;
        self.cost = buy.commission;
        self.entry_order = Some(buy.id.clone());
    }

    /// Close against `exit`. `later_commission` covers every order closed
    /// after the entry, the exit included. Returns the realized amount,
    /// which becomes the new capital.
    pub fn close(&mut self, exit: &Order, later_commission: f64) -> f64 {
        let amount = exit.proceeds() - (self.cost + later_commission);
        self.capital = amount;
        self.realized = Some(amount);
        self.entry = None;
        self.quantity = 0.0;
        self.cost = 0.0;
        self.entry_order = None;
        amount
    }

    /// Close against `exit`, summing the commission of every order the
    /// exchange closed since the entry buy
    pub async fn realize(&mut self, controller: &OrderController, exit: &Order) -> Result<f64> {
        let later: f64 = match self.entry_order() {
            Some(id) => controller.history_since(id).await?.iter().map(|o| o.commission).sum(),
            None => exit.commission,
        };
        Ok(self.close(exit, later))
    }
}

/// Split `total` into `n` slices. All but the last are `total / n`; the
/// last takes what is left so the slices add up to `total` exactly.
pub fn split_quantity(total: f64, n: usize) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    let slice = total / n as f64;
    let mut slices = vec![slice; n - 1];
    let assigned: f64 = slices.iter().sum();
    slices.push(total - assigned);
    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{OrderKind, OrderSide, OrderStatus};

    fn filled(id: &str, side: OrderSide, quantity: f64, price: f64, commission: f64) -> Order {
        Order {
            id: id.into(),
            pair: "BTC-ETH".into(),
            side,
            kind: OrderKind::Limit,
            quantity,
            limit: price,
            trigger: None,
            fill_price: price,
            commission,
            status: OrderStatus::Filled,
            opened: None,
            closed: None,
        }
    }

    #[test]
    fn test_split_quantity_sums_exactly() {
        let slices = split_quantity(10.0, 3);
        assert_eq!(slices.len(), 3);
        assert!((slices[0] - 10.0 / 3.0).abs() < 1e-12);
        assert!((slices[2] - 10.0 / 3.0).abs() < 1e-12);
        assert_eq!(slices.iter().sum::<f64>(), 10.0);
        assert!(split_quantity(1.0, 0).is_empty());
        assert_eq!(split_quantity(2.5, 1), vec![2.5]);
    }

    #[test]
    fn test_realized_amount_becomes_capital() {
        let mut ledger = PositionLedger::new(1.0);
        ledger.open(&filled("1", OrderSide::Buy, 10.0, 0.1, 0.0025));
        assert!(ledger.is_open());
        assert_eq!(ledger.entry_order(), Some("1"));

        let exit = filled("2", OrderSide::Sell, 10.0, 0.12, 0.003);
        let later = 0.003 + 0.001;
        let amount = ledger.close(&exit, later);
        let expected = 0.12 * 10.0 - (0.0025 + later);
        assert_eq!(amount, expected);
        assert_eq!(ledger.capital, expected);
        assert_eq!(ledger.realized, Some(expected));
        assert!(!ledger.is_open());
    }
}
