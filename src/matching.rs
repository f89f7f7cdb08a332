//! Price-time priority matching sweep.
//!
//! [`match_instrument`] runs one continuous-double-auction pass over a
//! book: buy orders outer (best price, then earliest arrival), sell orders
//! inner (lowest price, then earliest arrival). A buy/sell pair matches
//! while `buy.price >= sell.price`; the first sell that breaks the
//! condition ends the inner scan, since no later sell can price better.
//! Trade quantity is `min(remaining)` of both sides and the execution price
//! is the sell order's limit price, so the side that provided liquidity
//! sets the price.
//!
//! Each trade is one atomic unit: the trade record and both parent fills
//! commit together or not at all, and a failed unit never touches the fill
//! state of other pairs in the same sweep.

use crate::error::CoreError;
use crate::order_book::OrderBook;
use crate::types::{Order, OrderId, OrderStatus, Trade, TradeId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Run one matching sweep for the book's instrument. Returns the trades
/// executed in this pass; order fill state is updated in the book.
pub fn match_instrument(book: &mut OrderBook, now: DateTime<Utc>) -> Vec<Trade> {
    let buy_ids = book.open_buys(now);
    let sell_ids = book.open_sells(now);
    let mut trades = Vec::new();

    for buy_id in buy_ids {
        let (buy_price, mut buy_remaining) = match book.get(buy_id) {
            Some(o) if o.is_matchable_at(now) => (o.price, o.remaining()),
            _ => continue,
        };

        for &sell_id in &sell_ids {
            if buy_remaining <= Decimal::ZERO {
                break;
            }
            let (sell_price, sell_remaining) = match book.get(sell_id) {
                Some(o) if o.is_matchable_at(now) => (o.price, o.remaining()),
                _ => continue,
            };
            if buy_price < sell_price {
                // Sells are price-ascending; no further sell can match.
                break;
            }
            let quantity = buy_remaining.min(sell_remaining);
            if quantity <= Decimal::ZERO {
                continue;
            }
            match execute_trade(book, buy_id, sell_id, quantity, sell_price, now) {
                Ok(trade) => {
                    buy_remaining -= quantity;
                    trades.push(trade);
                }
                Err(e) => {
                    // One failed unit must not corrupt unrelated pairs.
                    log::error!(
                        "trade execution failed buy={} sell={}: {}",
                        buy_id.0,
                        sell_id.0,
                        e
                    );
                }
            }
        }
    }

    trades
}

/// Execute one trade between two orders as an all-or-nothing unit: both
/// parent orders' fill state and the trade record are staged, validated,
/// and only then committed.
pub fn execute_trade(
    book: &mut OrderBook,
    buy_id: OrderId,
    sell_id: OrderId,
    quantity: Decimal,
    price: Decimal,
    now: DateTime<Utc>,
) -> Result<Trade, CoreError> {
    if quantity <= Decimal::ZERO {
        return Err(CoreError::validation("trade quantity must be positive"));
    }
    if price <= Decimal::ZERO {
        return Err(CoreError::validation("trade price must be positive"));
    }

    let mut buy = book
        .get(buy_id)
        .cloned()
        .ok_or_else(|| CoreError::Internal(format!("buy order {} not in book", buy_id.0)))?;
    let mut sell = book
        .get(sell_id)
        .cloned()
        .ok_or_else(|| CoreError::Internal(format!("sell order {} not in book", sell_id.0)))?;

    apply_fill(&mut buy, quantity)?;
    apply_fill(&mut sell, quantity)?;

    let trade = Trade {
        id: TradeId(Uuid::new_v4()),
        buy_order_id: buy_id,
        sell_order_id: sell_id,
        isin: buy.isin.clone(),
        quantity,
        price,
        total_value: quantity * price,
        executed_at: now,
    };

    // All checks passed; commit both sides together.
    book.replace(buy)?;
    book.replace(sell)?;

    log::info!(
        "trade executed trade_id={} isin={} buy_order={} sell_order={} quantity={} price={}",
        trade.id.0,
        trade.isin,
        buy_id.0,
        sell_id.0,
        quantity,
        price
    );
    Ok(trade)
}

/// Stage a fill on a copy of an order: bump filled quantity and recompute
/// status. Fails without side effects if the fill would overshoot.
fn apply_fill(order: &mut Order, quantity: Decimal) -> Result<(), CoreError> {
    if quantity > order.remaining() {
        return Err(CoreError::Internal(format!(
            "fill {} exceeds remaining {} on order {}",
            quantity,
            order.remaining(),
            order.id.0
        )));
    }
    order.filled_quantity += quantity;
    order.status = if order.filled_quantity >= order.quantity {
        OrderStatus::Filled
    } else {
        OrderStatus::Partial
    };
    Ok(())
}
