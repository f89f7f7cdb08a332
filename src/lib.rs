//! # LedgerBridge
//!
//! Order matching and settlement reconciliation core for a tokenized
//! securities back office: per-instrument order books with price-time
//! priority matching, a strict settlement state machine fed by custodian
//! webhooks, and the guards that keep retried requests and replayed
//! webhooks from double-applying.
//!
//! ## Entry point
//!
//! Use [`Engine`] as the single entry point: create with [`Engine::new`],
//! then [`Engine::submit_order`] and [`Engine::cancel_order`]. Trades open
//! settlement records on the shared [`SettlementLedger`]; custodian webhooks
//! and the [`reconciliation::Reconciler`] move them through their lifecycle.
//!
//! ## Example
//!
//! ```rust
//! use ledgerbridge::{Engine, NewOrder, SettlementLedger, SettlementSource};
//! use ledgerbridge::types::{Isin, OwnerId, Side};
//! use std::sync::Arc;
//!
//! let ledger = Arc::new(SettlementLedger::new());
//! let engine = Engine::new(ledger, SettlementSource::Euroclear);
//! let outcome = engine
//!     .submit_order(
//!         NewOrder {
//!             owner: OwnerId(uuid::Uuid::new_v4()),
//!             side: Side::Buy,
//!             isin: Isin::from("US0378331005"),
//!             quantity: "100".parse().unwrap(),
//!             price: "10.00".parse().unwrap(),
//!             payment_token: None,
//!             expires_at: None,
//!         },
//!         chrono::Utc::now(),
//!     )
//!     .unwrap();
//! assert!(outcome.trades.is_empty());
//! ```
//!
//! ## Lower-level API
//!
//! You can also use [`OrderBook`] and [`matching::match_instrument`] directly
//! if you manage books yourself.

pub mod api;
pub mod audit;
pub mod custodian;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod matching;
pub mod order_book;
pub mod reconciliation;
pub mod settlement;
pub mod types;
pub mod webhook;

pub use engine::{Engine, NewOrder, SubmitOutcome};
pub use error::CoreError;
pub use matching::match_instrument;
pub use order_book::{BookLevel, OrderBook};
pub use settlement::{
    CustodianEvent, Settlement, SettlementLedger, SettlementSource, SettlementStatus,
};
pub use types::{Order, OrderId, OrderStatus, Side, Trade};
