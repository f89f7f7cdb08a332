//! Error taxonomy for the core.
//!
//! Five categories with distinct propagation rules: validation and state
//! conflicts go back to the caller, authenticity failures are opaque,
//! upstream failures are absorbed by the reconciliation loop, and internal
//! inconsistencies abort the single operation that hit them.

use thiserror::Error;

/// Core error type. Authenticity failures carry no detail about which
/// check failed.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed input (quantity, price, instrument, payload shape).
    /// Rejected before any state change.
    #[error("validation error: {0}")]
    Validation(String),

    /// Illegal order/settlement transition, non-cancellable order, or an
    /// unknown record reference. No partial mutation occurred.
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// Bad signature, stale timestamp, or reused nonce on an inbound
    /// webhook. Deliberately opaque.
    #[error("unauthorized")]
    AuthenticityFailure,

    /// Custodian call failed or timed out. The affected record stays in
    /// its last known state and is retried on the next reconciliation pass.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// An execution unit failed partway and was rolled back. Retryable.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn state_conflict(msg: impl Into<String>) -> Self {
        CoreError::StateConflict(msg.into())
    }
}
