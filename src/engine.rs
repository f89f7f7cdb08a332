//! Matching engine over per-instrument order books.
//!
//! One book per instrument, each behind its own lock: a submit locks only
//! the book it touches, so matching on one instrument never blocks another.
//! Matching runs inline on submit under that lock, which also makes cancel
//! atomic with respect to matching on the same instrument. Settlements are
//! opened after the book lock is released.

use crate::error::CoreError;
use crate::matching::match_instrument;
use crate::order_book::{BookLevel, OrderBook};
use crate::settlement::{Settlement, SettlementLedger, SettlementSource};
use crate::types::{Isin, Order, OrderId, OrderStatus, Side, Trade};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Parameters for a new order.
#[derive(Clone, Debug)]
pub struct NewOrder {
    pub owner: crate::types::OwnerId,
    pub side: Side,
    pub isin: Isin,
    pub quantity: Decimal,
    pub price: Decimal,
    pub payment_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// What a submit produced: the accepted order (post-matching state) and the
/// trades the matching sweep executed.
#[derive(Clone, Debug)]
pub struct SubmitOutcome {
    pub order: Order,
    pub trades: Vec<Trade>,
    pub settlements: Vec<Settlement>,
}

/// Matching engine: per-instrument books, a global trade log, and the
/// settlement ledger trades feed into.
pub struct Engine {
    books: Mutex<HashMap<Isin, Arc<Mutex<OrderBook>>>>,
    /// Order id -> instrument, so cancel and lookup find the right book.
    order_index: Mutex<HashMap<OrderId, Isin>>,
    trades: Mutex<Vec<Trade>>,
    settlements: Arc<SettlementLedger>,
    default_source: SettlementSource,
}

impl Engine {
    pub fn new(settlements: Arc<SettlementLedger>, default_source: SettlementSource) -> Self {
        Self {
            books: Mutex::new(HashMap::new()),
            order_index: Mutex::new(HashMap::new()),
            trades: Mutex::new(Vec::new()),
            settlements,
            default_source,
        }
    }

    pub fn settlements(&self) -> &Arc<SettlementLedger> {
        &self.settlements
    }

    fn book(&self, isin: &Isin) -> Arc<Mutex<OrderBook>> {
        let mut books = self.books.lock().expect("books lock");
        books
            .entry(isin.clone())
            .or_insert_with(|| Arc::new(Mutex::new(OrderBook::new(isin.clone()))))
            .clone()
    }

    fn existing_book(&self, isin: &Isin) -> Option<Arc<Mutex<OrderBook>>> {
        self.books.lock().expect("books lock").get(isin).cloned()
    }

    /// Validate, accept, and match a new order. The insert and the matching
    /// sweep happen under the instrument's book lock; settlement records for
    /// the resulting trades are opened after the lock is released.
    pub fn submit_order(&self, new: NewOrder, now: DateTime<Utc>) -> Result<SubmitOutcome, CoreError> {
        if new.isin.0.trim().is_empty() {
            return Err(CoreError::validation("instrument identifier required"));
        }
        if new.quantity <= Decimal::ZERO {
            return Err(CoreError::validation("order quantity must be positive"));
        }
        if new.price <= Decimal::ZERO {
            return Err(CoreError::validation("order price must be positive"));
        }
        if let Some(expires_at) = new.expires_at {
            if expires_at <= now {
                return Err(CoreError::validation("expiry must be in the future"));
            }
        }

        let order = Order {
            id: OrderId(Uuid::new_v4()),
            owner: new.owner,
            side: new.side,
            isin: new.isin.clone(),
            quantity: new.quantity,
            filled_quantity: Decimal::ZERO,
            price: new.price,
            payment_token: new.payment_token,
            expires_at: new.expires_at,
            status: OrderStatus::Pending,
            created_at: now,
        };
        let order_id = order.id;

        let book = self.book(&new.isin);
        let (order, trades) = {
            let mut book = book.lock().expect("book lock");
            book.insert(order)?;
            let trades = match_instrument(&mut book, now);
            let order = book.get(order_id).cloned().ok_or_else(|| {
                CoreError::Internal(format!("order {} vanished after insert", order_id.0))
            })?;
            (order, trades)
        };
        self.order_index
            .lock()
            .expect("order index lock")
            .insert(order_id, new.isin.clone());
        log::info!(
            "order accepted order_id={} isin={} side={:?} quantity={} price={} trades={}",
            order_id.0,
            new.isin,
            order.side,
            order.quantity,
            order.price,
            trades.len()
        );

        // Book lock is released; record trades and open settlements.
        self.trades
            .lock()
            .expect("trades lock")
            .extend(trades.iter().cloned());
        let mut settlements = Vec::with_capacity(trades.len());
        for trade in &trades {
            match self.settlements.open(
                self.default_source,
                trade.isin.clone(),
                trade.quantity,
                None,
                None,
                format!("trade {}", trade.id.0),
                now,
            ) {
                Ok(s) => settlements.push(s),
                Err(e) => {
                    // The trade stands; settlement creation is retried by ops.
                    log::error!("settlement open failed for trade {}: {}", trade.id.0, e);
                }
            }
        }

        Ok(SubmitOutcome {
            order,
            trades,
            settlements,
        })
    }

    /// Cancel an order. Runs under the instrument's book lock, so it cannot
    /// interleave with a matching sweep on the same book.
    pub fn cancel_order(&self, id: OrderId) -> Result<Order, CoreError> {
        let isin = self
            .order_index
            .lock()
            .expect("order index lock")
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::state_conflict(format!("unknown order {}", id.0)))?;
        let book = self
            .existing_book(&isin)
            .ok_or_else(|| CoreError::state_conflict(format!("unknown order {}", id.0)))?;
        let cancelled = book.lock().expect("book lock").cancel(id)?;
        log::info!("order cancelled order_id={} isin={}", id.0, isin);
        Ok(cancelled)
    }

    pub fn get_order(&self, id: OrderId) -> Option<Order> {
        let isin = self
            .order_index
            .lock()
            .expect("order index lock")
            .get(&id)
            .cloned()?;
        let book = self.existing_book(&isin)?;
        let book = book.lock().expect("book lock");
        book.get(id).cloned()
    }

    /// Depth snapshot for one instrument. An instrument that never traded
    /// has an empty book, not an error.
    pub fn book_depth(
        &self,
        isin: &Isin,
        now: DateTime<Utc>,
        limit: usize,
    ) -> (Vec<BookLevel>, Vec<BookLevel>) {
        match self.existing_book(isin) {
            Some(book) => book.lock().expect("book lock").depth(now, limit),
            None => (Vec::new(), Vec::new()),
        }
    }

    /// Expire overdue orders across every book. Returns the flipped ids.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<OrderId> {
        let books: Vec<Arc<Mutex<OrderBook>>> =
            self.books.lock().expect("books lock").values().cloned().collect();
        let mut expired = Vec::new();
        for book in books {
            expired.extend(book.lock().expect("book lock").sweep_expired(now));
        }
        if !expired.is_empty() {
            log::info!("expiry sweep flipped {} orders", expired.len());
        }
        expired
    }

    /// All executed trades, oldest first.
    pub fn trades(&self) -> Vec<Trade> {
        self.trades.lock().expect("trades lock").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::SettlementStatus;
    use crate::types::OwnerId;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-15T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn engine() -> Engine {
        Engine::new(
            Arc::new(SettlementLedger::new()),
            SettlementSource::Euroclear,
        )
    }

    fn new_order(side: Side, qty: &str, price: &str) -> NewOrder {
        NewOrder {
            owner: OwnerId(Uuid::new_v4()),
            side,
            isin: Isin::from("US0378331005"),
            quantity: qty.parse().unwrap(),
            price: price.parse().unwrap(),
            payment_token: None,
            expires_at: None,
        }
    }

    #[test]
    fn submit_match_opens_one_settlement_per_trade() {
        let engine = engine();
        engine
            .submit_order(new_order(Side::Buy, "100", "10.00"), now())
            .unwrap();
        let outcome = engine
            .submit_order(new_order(Side::Sell, "60", "10.00"), now() + Duration::seconds(1))
            .unwrap();

        assert_eq!(outcome.trades.len(), 1);
        assert_eq!(outcome.settlements.len(), 1);
        let settlement = &outcome.settlements[0];
        assert_eq!(settlement.status, SettlementStatus::Initiated);
        assert_eq!(settlement.quantity, "60".parse().unwrap());
        assert_eq!(settlement.isin, Isin::from("US0378331005"));
        // The incoming sell filled completely.
        assert_eq!(outcome.order.status, OrderStatus::Filled);
        assert_eq!(engine.trades().len(), 1);
    }

    #[test]
    fn submit_rejects_nonpositive_quantity_and_price() {
        let engine = engine();
        assert!(matches!(
            engine
                .submit_order(new_order(Side::Buy, "0", "10.00"), now())
                .unwrap_err(),
            CoreError::Validation(_)
        ));
        assert!(matches!(
            engine
                .submit_order(new_order(Side::Buy, "10", "-1"), now())
                .unwrap_err(),
            CoreError::Validation(_)
        ));
        let mut blank = new_order(Side::Buy, "10", "10.00");
        blank.isin = Isin::from("  ");
        assert!(matches!(
            engine.submit_order(blank, now()).unwrap_err(),
            CoreError::Validation(_)
        ));
    }

    #[test]
    fn submit_rejects_past_expiry() {
        let engine = engine();
        let mut order = new_order(Side::Buy, "10", "10.00");
        order.expires_at = Some(now() - Duration::minutes(1));
        assert!(matches!(
            engine.submit_order(order, now()).unwrap_err(),
            CoreError::Validation(_)
        ));
    }

    #[test]
    fn cancel_open_order_then_cancel_again_conflicts() {
        let engine = engine();
        let outcome = engine
            .submit_order(new_order(Side::Buy, "10", "10.00"), now())
            .unwrap();
        let cancelled = engine.cancel_order(outcome.order.id).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(matches!(
            engine.cancel_order(outcome.order.id).unwrap_err(),
            CoreError::StateConflict(_)
        ));
    }

    #[test]
    fn cancel_unknown_order_conflicts() {
        let engine = engine();
        assert!(matches!(
            engine.cancel_order(OrderId(Uuid::new_v4())).unwrap_err(),
            CoreError::StateConflict(_)
        ));
    }

    #[test]
    fn instruments_are_isolated() {
        let engine = engine();
        let mut de = new_order(Side::Sell, "10", "10.00");
        de.isin = Isin::from("DE0005557508");
        engine.submit_order(de, now()).unwrap();
        // A crossing buy on a different instrument must not trade.
        let outcome = engine
            .submit_order(new_order(Side::Buy, "10", "10.00"), now() + Duration::seconds(1))
            .unwrap();
        assert!(outcome.trades.is_empty());

        let (buys, _) = engine.book_depth(&Isin::from("US0378331005"), now() + Duration::seconds(2), 10);
        assert_eq!(buys.len(), 1);
        let (_, sells) = engine.book_depth(&Isin::from("DE0005557508"), now() + Duration::seconds(2), 10);
        assert_eq!(sells.len(), 1);
    }

    #[test]
    fn depth_on_unknown_instrument_is_empty() {
        let engine = engine();
        let (buys, sells) = engine.book_depth(&Isin::from("FR0000131104"), now(), 10);
        assert!(buys.is_empty());
        assert!(sells.is_empty());
    }

    #[test]
    fn sweep_expires_pending_orders_across_books() {
        let engine = engine();
        let mut a = new_order(Side::Buy, "10", "10.00");
        a.expires_at = Some(now() + Duration::minutes(5));
        let mut b = new_order(Side::Sell, "10", "20.00");
        b.isin = Isin::from("DE0005557508");
        b.expires_at = Some(now() + Duration::minutes(5));
        let a_id = engine.submit_order(a, now()).unwrap().order.id;
        let b_id = engine.submit_order(b, now()).unwrap().order.id;

        let expired = engine.sweep_expired(now() + Duration::minutes(10));
        assert_eq!(expired.len(), 2);
        assert_eq!(engine.get_order(a_id).unwrap().status, OrderStatus::Expired);
        assert_eq!(engine.get_order(b_id).unwrap().status, OrderStatus::Expired);
        // Expired orders are no longer cancellable.
        assert!(engine.cancel_order(a_id).is_err());
    }

    #[test]
    fn partial_order_survives_expiry_sweep() {
        let engine = engine();
        let mut buy = new_order(Side::Buy, "100", "10.00");
        buy.expires_at = Some(now() + Duration::minutes(5));
        let buy_id = engine.submit_order(buy, now()).unwrap().order.id;
        engine
            .submit_order(new_order(Side::Sell, "40", "10.00"), now() + Duration::seconds(1))
            .unwrap();
        assert_eq!(engine.get_order(buy_id).unwrap().status, OrderStatus::Partial);

        let expired = engine.sweep_expired(now() + Duration::minutes(10));
        assert!(expired.is_empty());
        // Still open for its owner to cancel.
        assert_eq!(
            engine.cancel_order(buy_id).unwrap().status,
            OrderStatus::Cancelled
        );
    }
}
