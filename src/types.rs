//! Core identifiers and order/trade data models.
//!
//! All identifiers are UUID newtypes. [`Order`] carries its own fill state
//! and status; [`Trade`] is an immutable execution record linking one buy
//! and one sell order.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Unique order identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct OrderId(pub Uuid);

/// Trade identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TradeId(pub Uuid);

/// Settlement identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SettlementId(pub Uuid);

/// Order owner (account) identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct OwnerId(pub Uuid);

/// Instrument identifier (ISIN).
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Isin(pub String);

impl std::fmt::Display for Isin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Isin {
    fn from(s: &str) -> Self {
        Isin(s.to_string())
    }
}

/// Order side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

/// Order lifecycle status. Transitions are forward-only; Filled, Cancelled,
/// and Expired are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Partial,
    Filled,
    Cancelled,
    Expired,
}

impl OrderStatus {
    /// Whether the order can still fill or be cancelled.
    pub fn is_open(self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Partial)
    }

    /// Legal forward transitions: Pending -> {Partial, Filled, Cancelled,
    /// Expired}; Partial -> {Filled, Cancelled}.
    pub fn may_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Partial)
                | (Pending, Filled)
                | (Pending, Cancelled)
                | (Pending, Expired)
                | (Partial, Filled)
                | (Partial, Cancelled)
        )
    }
}

/// A resting intent to buy or sell a fixed quantity of one instrument at a
/// limit price. Never deleted; closed orders are retained as audit records.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub owner: OwnerId,
    pub side: Side,
    pub isin: Isin,
    pub quantity: Decimal,
    /// Starts at zero, monotonically non-decreasing, never exceeds `quantity`.
    pub filled_quantity: Decimal,
    pub price: Decimal,
    pub payment_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Unfilled quantity.
    pub fn remaining(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    /// Eligible for matching at `now`: status is open and the order has not
    /// passed its expiry timestamp.
    pub fn is_matchable_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_open() && !self.is_expired_at(now)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| t < now).unwrap_or(false)
    }
}

/// Immutable execution event linking exactly one buy and one sell order.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: TradeId,
    pub buy_order_id: OrderId,
    pub sell_order_id: OrderId,
    pub isin: Isin,
    pub quantity: Decimal,
    pub price: Decimal,
    pub total_value: Decimal,
    pub executed_at: DateTime<Utc>,
}
