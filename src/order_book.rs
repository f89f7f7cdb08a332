//! Single-instrument order book with price-time priority views.
//!
//! The book keeps every order ever submitted for its instrument (closed
//! orders stay queryable as audit records) in arrival order, and exposes
//! sorted views over the open side: buys by price descending, sells by price
//! ascending, earliest arrival first within a price. Sorting is stable over
//! the arrival sequence, which is the time-priority tie-break.

use crate::error::CoreError;
use crate::types::{Isin, Order, OrderId, OrderStatus, Side};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// One side's book level as returned by the depth query.
#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookLevel {
    pub order_id: OrderId,
    pub quantity: Decimal,
    pub price: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Single-instrument order book.
#[derive(Debug)]
pub struct OrderBook {
    isin: Isin,
    /// All orders in arrival order. Never shrinks.
    orders: Vec<Order>,
    index: HashMap<OrderId, usize>,
}

impl OrderBook {
    pub fn new(isin: Isin) -> Self {
        Self {
            isin,
            orders: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn isin(&self) -> &Isin {
        &self.isin
    }

    /// Insert a new order. Rejects a duplicate id or a foreign instrument.
    pub fn insert(&mut self, order: Order) -> Result<(), CoreError> {
        if order.isin != self.isin {
            return Err(CoreError::validation(format!(
                "order instrument {} does not match book {}",
                order.isin, self.isin
            )));
        }
        if self.index.contains_key(&order.id) {
            return Err(CoreError::state_conflict(format!(
                "order {} already exists",
                order.id.0
            )));
        }
        self.index.insert(order.id, self.orders.len());
        self.orders.push(order);
        Ok(())
    }

    pub fn get(&self, id: OrderId) -> Option<&Order> {
        self.index.get(&id).map(|&i| &self.orders[i])
    }

    /// Overwrite an existing order's state. Used by matching to commit a
    /// staged fill; the order must already be in the book.
    pub(crate) fn replace(&mut self, order: Order) -> Result<(), CoreError> {
        match self.index.get(&order.id) {
            Some(&i) => {
                self.orders[i] = order;
                Ok(())
            }
            None => Err(CoreError::Internal(format!(
                "order {} missing during fill commit",
                order.id.0
            ))),
        }
    }

    /// Cancel an order. Legal only from PENDING or PARTIAL; anything else
    /// (including an unknown id) is a state conflict.
    pub fn cancel(&mut self, id: OrderId) -> Result<Order, CoreError> {
        let i = *self
            .index
            .get(&id)
            .ok_or_else(|| CoreError::state_conflict(format!("unknown order {}", id.0)))?;
        let order = &mut self.orders[i];
        if !order.status.is_open() {
            return Err(CoreError::state_conflict(format!(
                "order {} is {:?} and not cancellable",
                id.0, order.status
            )));
        }
        order.status = OrderStatus::Cancelled;
        Ok(order.clone())
    }

    /// Open buy orders matchable at `now`, best price first, earliest
    /// arrival first within a price.
    pub fn open_buys(&self, now: DateTime<Utc>) -> Vec<OrderId> {
        let mut ids: Vec<(Decimal, OrderId)> = self
            .orders
            .iter()
            .filter(|o| o.side == Side::Buy && o.is_matchable_at(now))
            .map(|o| (o.price, o.id))
            .collect();
        ids.sort_by(|a, b| b.0.cmp(&a.0));
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Open sell orders matchable at `now`, best (lowest) price first,
    /// earliest arrival first within a price.
    pub fn open_sells(&self, now: DateTime<Utc>) -> Vec<OrderId> {
        let mut ids: Vec<(Decimal, OrderId)> = self
            .orders
            .iter()
            .filter(|o| o.side == Side::Sell && o.is_matchable_at(now))
            .map(|o| (o.price, o.id))
            .collect();
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Flip open orders whose expiry has passed to EXPIRED. Returns the ids
    /// that were flipped. Expired orders are never matched; this sweep makes
    /// the transition explicit rather than leaving them silently skipped.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<OrderId> {
        let mut expired = Vec::new();
        for order in &mut self.orders {
            // Only PENDING expires; a PARTIAL order has a live counterparty
            // fill history and stays cancellable by its owner instead.
            if order.status == OrderStatus::Pending && order.is_expired_at(now) {
                order.status = OrderStatus::Expired;
                expired.push(order.id);
            }
        }
        expired
    }

    /// Depth snapshot: (buys, sells) with remaining quantity per order,
    /// each side in its matching scan order, truncated to `limit`.
    pub fn depth(&self, now: DateTime<Utc>, limit: usize) -> (Vec<BookLevel>, Vec<BookLevel>) {
        let level = |id: &OrderId| {
            let o = &self.orders[self.index[id]];
            BookLevel {
                order_id: o.id,
                quantity: o.remaining(),
                price: o.price,
                created_at: o.created_at,
            }
        };
        let buys = self.open_buys(now).iter().take(limit).map(level).collect();
        let sells = self.open_sells(now).iter().take(limit).map(level).collect();
        (buys, sells)
    }

    /// Best open buy price, if any.
    pub fn best_buy(&self, now: DateTime<Utc>) -> Option<Decimal> {
        self.open_buys(now).first().map(|id| self.orders[self.index[id]].price)
    }

    /// Best open sell price, if any.
    pub fn best_sell(&self, now: DateTime<Utc>) -> Option<Decimal> {
        self.open_sells(now).first().map(|id| self.orders[self.index[id]].price)
    }

    /// All orders ever inserted, arrival order. For audit queries and tests.
    pub fn all_orders(&self) -> &[Order] {
        &self.orders
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OwnerId;
    use chrono::Duration;
    use uuid::Uuid;

    fn order(side: Side, qty: i64, price: &str, secs: i64) -> Order {
        let base = DateTime::parse_from_rfc3339("2025-01-15T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        Order {
            id: OrderId(Uuid::new_v4()),
            owner: OwnerId(Uuid::new_v4()),
            side,
            isin: Isin::from("US0378331005"),
            quantity: Decimal::from(qty),
            filled_quantity: Decimal::ZERO,
            price: price.parse().unwrap(),
            payment_token: None,
            expires_at: None,
            status: OrderStatus::Pending,
            created_at: base + Duration::seconds(secs),
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-15T11:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn open_buys_sorted_price_desc_then_arrival() {
        let mut book = OrderBook::new(Isin::from("US0378331005"));
        let a = order(Side::Buy, 10, "9.00", 0);
        let b = order(Side::Buy, 10, "10.00", 1);
        let c = order(Side::Buy, 10, "10.00", 2);
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        book.insert(a).unwrap();
        book.insert(b).unwrap();
        book.insert(c).unwrap();
        assert_eq!(book.open_buys(now()), vec![b_id, c_id, a_id]);
    }

    #[test]
    fn open_sells_sorted_price_asc_then_arrival() {
        let mut book = OrderBook::new(Isin::from("US0378331005"));
        let a = order(Side::Sell, 10, "10.00", 0);
        let b = order(Side::Sell, 10, "9.50", 1);
        let c = order(Side::Sell, 10, "9.50", 2);
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        book.insert(a).unwrap();
        book.insert(b).unwrap();
        book.insert(c).unwrap();
        assert_eq!(book.open_sells(now()), vec![b_id, c_id, a_id]);
    }

    #[test]
    fn cancel_pending_succeeds_and_closes_order() {
        let mut book = OrderBook::new(Isin::from("US0378331005"));
        let o = order(Side::Buy, 10, "10.00", 0);
        let id = o.id;
        book.insert(o).unwrap();
        let cancelled = book.cancel(id).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(book.open_buys(now()).is_empty());
        // Record is retained.
        assert_eq!(book.get(id).unwrap().status, OrderStatus::Cancelled);
    }

    #[test]
    fn cancel_closed_order_is_state_conflict() {
        let mut book = OrderBook::new(Isin::from("US0378331005"));
        let o = order(Side::Buy, 10, "10.00", 0);
        let id = o.id;
        book.insert(o).unwrap();
        book.cancel(id).unwrap();
        let err = book.cancel(id).unwrap_err();
        assert!(matches!(err, CoreError::StateConflict(_)));
    }

    #[test]
    fn cancel_unknown_order_is_state_conflict() {
        let mut book = OrderBook::new(Isin::from("US0378331005"));
        let err = book.cancel(OrderId(Uuid::new_v4())).unwrap_err();
        assert!(matches!(err, CoreError::StateConflict(_)));
    }

    #[test]
    fn duplicate_insert_rejected() {
        let mut book = OrderBook::new(Isin::from("US0378331005"));
        let o = order(Side::Buy, 10, "10.00", 0);
        book.insert(o.clone()).unwrap();
        assert!(matches!(
            book.insert(o).unwrap_err(),
            CoreError::StateConflict(_)
        ));
    }

    #[test]
    fn wrong_instrument_rejected() {
        let mut book = OrderBook::new(Isin::from("US0378331005"));
        let mut o = order(Side::Buy, 10, "10.00", 0);
        o.isin = Isin::from("DE0005557508");
        assert!(matches!(
            book.insert(o).unwrap_err(),
            CoreError::Validation(_)
        ));
    }

    #[test]
    fn expired_order_excluded_from_views_and_swept() {
        let mut book = OrderBook::new(Isin::from("US0378331005"));
        let mut o = order(Side::Buy, 10, "10.00", 0);
        o.expires_at = Some(now() - Duration::minutes(5));
        let id = o.id;
        book.insert(o).unwrap();
        assert!(book.open_buys(now()).is_empty());
        let expired = book.sweep_expired(now());
        assert_eq!(expired, vec![id]);
        assert_eq!(book.get(id).unwrap().status, OrderStatus::Expired);
        // Second sweep is a no-op.
        assert!(book.sweep_expired(now()).is_empty());
    }

    #[test]
    fn depth_reports_remaining_quantity_and_respects_limit() {
        let mut book = OrderBook::new(Isin::from("US0378331005"));
        for i in 0..5 {
            book.insert(order(Side::Buy, 10, "10.00", i)).unwrap();
        }
        book.insert(order(Side::Sell, 7, "11.00", 6)).unwrap();
        let (buys, sells) = book.depth(now(), 3);
        assert_eq!(buys.len(), 3);
        assert_eq!(sells.len(), 1);
        assert_eq!(sells[0].quantity, Decimal::from(7));
    }
}
