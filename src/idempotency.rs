//! Idempotency guard for client-retried mutating requests.
//!
//! A `(client key, request path)` pair maps to the response the first
//! successful execution produced. A retry within the validity window gets
//! the stored response back byte-identically, without re-executing the
//! handler. Caching is opt-in per request: no key, no record. Only
//! successful JSON responses are stored; the store is read-mostly and a
//! sub-millisecond double-execution race is an accepted risk.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// How long a stored response stays valid.
pub const VALIDITY_HOURS: i64 = 24;

/// Previously produced response: status code plus exact body bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Clone, Debug)]
struct IdempotencyRecord {
    response: StoredResponse,
    expires_at: DateTime<Utc>,
}

/// In-memory `(key, path)` -> response store with expiry.
#[derive(Debug, Default)]
pub struct IdempotencyStore {
    records: Mutex<HashMap<(String, String), IdempotencyRecord>>,
}

impl IdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored response for `(key, path)` if present and unexpired.
    pub fn lookup(&self, key: &str, path: &str, now: DateTime<Utc>) -> Option<StoredResponse> {
        let records = self.records.lock().expect("idempotency lock");
        records
            .get(&(key.to_string(), path.to_string()))
            .filter(|r| r.expires_at > now)
            .map(|r| r.response.clone())
    }

    /// Record a successful response with the fixed validity window.
    pub fn store(&self, key: &str, path: &str, response: StoredResponse, now: DateTime<Utc>) {
        let mut records = self.records.lock().expect("idempotency lock");
        records.insert(
            (key.to_string(), path.to_string()),
            IdempotencyRecord {
                response,
                expires_at: now + chrono::Duration::hours(VALIDITY_HOURS),
            },
        );
    }

    /// Drop expired records. Returns how many were removed.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let mut records = self.records.lock().expect("idempotency lock");
        let before = records.len();
        records.retain(|_, r| r.expires_at > now);
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("idempotency lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
