//! Webhook replay guard: HMAC signature, clock-skew bound, single-use nonce.
//!
//! [`verify`] runs five checks over an inbound custodian callback:
//! signature over the raw body, timestamp parse, skew bound, nonce
//! presence, and atomic nonce consumption. Every failure collapses to the
//! same opaque [`CoreError::AuthenticityFailure`] so a forger learns
//! nothing about which check tripped. The guard holds no business
//! knowledge of what the webhook means.

use crate::error::CoreError;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Mutex;

type HmacSha256 = Hmac<Sha256>;

/// Maximum allowed clock skew between the sender's timestamp and now.
pub const MAX_SKEW_SECS: i64 = 300;

/// How long consumed nonces are retained before pruning.
pub const NONCE_RETENTION_HOURS: i64 = 24;

/// Store of consumed webhook nonces. Check-and-insert is atomic under one
/// lock, so two concurrent deliveries of the same nonce cannot both pass.
#[derive(Debug, Default)]
pub struct NonceStore {
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl NonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a nonce. Returns false if it was already consumed.
    pub fn try_consume(&self, nonce: &str, now: DateTime<Utc>) -> bool {
        let mut seen = self.seen.lock().expect("nonce lock");
        if seen.contains_key(nonce) {
            return false;
        }
        seen.insert(nonce.to_string(), now);
        true
    }

    pub fn contains(&self, nonce: &str) -> bool {
        self.seen.lock().expect("nonce lock").contains_key(nonce)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().expect("nonce lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop nonces older than the retention window. Returns how many were
    /// removed.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono::Duration::hours(NONCE_RETENTION_HOURS);
        let mut seen = self.seen.lock().expect("nonce lock");
        let before = seen.len();
        seen.retain(|_, at| *at >= cutoff);
        before - seen.len()
    }
}

/// Parse a sender timestamp: integer epoch seconds or an ISO-8601 instant.
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if value.bytes().all(|b| b.is_ascii_digit()) {
        return DateTime::from_timestamp(value.parse().ok()?, 0);
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Verify an inbound webhook. Passing all checks consumes the nonce; the
/// caller may then interpret the payload.
pub fn verify(
    raw_body: &[u8],
    signature: Option<&str>,
    timestamp: Option<&str>,
    nonce: Option<&str>,
    secret: &str,
    nonces: &NonceStore,
    now: DateTime<Utc>,
) -> Result<(), CoreError> {
    if secret.is_empty() {
        return Err(CoreError::AuthenticityFailure);
    }

    // 1. Signature: sha256=<hex> over the raw body, constant-time compare.
    let sig_hex = signature
        .and_then(|s| s.strip_prefix("sha256="))
        .map(str::trim)
        .ok_or(CoreError::AuthenticityFailure)?;
    let sent = hex::decode(sig_hex).map_err(|_| CoreError::AuthenticityFailure)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| CoreError::AuthenticityFailure)?;
    mac.update(raw_body);
    mac.verify_slice(&sent)
        .map_err(|_| CoreError::AuthenticityFailure)?;

    // 2 + 3. Timestamp parses and is within the skew bound.
    let ts = timestamp
        .and_then(parse_timestamp)
        .ok_or(CoreError::AuthenticityFailure)?;
    if (now - ts).num_seconds().abs() > MAX_SKEW_SECS {
        return Err(CoreError::AuthenticityFailure);
    }

    // 4 + 5. Nonce present and never consumed before; consumption is the
    // atomic check-and-insert, so a racing duplicate loses.
    let nonce = nonce.map(str::trim).filter(|n| !n.is_empty()).ok_or(CoreError::AuthenticityFailure)?;
    if !nonces.try_consume(nonce, now) {
        return Err(CoreError::AuthenticityFailure);
    }

    Ok(())
}

/// Hex HMAC-SHA256 of `body` under `secret`, for outbound signing and tests.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-webhook-secret";

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-15T10:30:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn sig(body: &[u8]) -> String {
        format!("sha256={}", sign(SECRET, body))
    }

    fn epoch() -> String {
        now().timestamp().to_string()
    }

    #[test]
    fn valid_webhook_passes_and_consumes_nonce() {
        let nonces = NonceStore::new();
        let body = br#"{"event":"status_update"}"#;
        verify(
            body,
            Some(&sig(body)),
            Some(&epoch()),
            Some("abc123"),
            SECRET,
            &nonces,
            now(),
        )
        .unwrap();
        assert!(nonces.contains("abc123"));
        assert_eq!(nonces.len(), 1);
    }

    #[test]
    fn replayed_nonce_rejected_one_record_remains() {
        let nonces = NonceStore::new();
        let body = br#"{"event":"status_update"}"#;
        let signature = sig(body);
        verify(
            body,
            Some(&signature),
            Some(&epoch()),
            Some("abc123"),
            SECRET,
            &nonces,
            now(),
        )
        .unwrap();
        let err = verify(
            body,
            Some(&signature),
            Some(&epoch()),
            Some("abc123"),
            SECRET,
            &nonces,
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::AuthenticityFailure));
        assert_eq!(nonces.len(), 1);
    }

    #[test]
    fn bad_signature_rejected() {
        let nonces = NonceStore::new();
        let body = b"payload";
        let err = verify(
            body,
            Some("sha256=deadbeef"),
            Some(&epoch()),
            Some("n1"),
            SECRET,
            &nonces,
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::AuthenticityFailure));
        // Nonce not consumed when an earlier check fails.
        assert!(nonces.is_empty());
    }

    #[test]
    fn signature_over_different_body_rejected() {
        let nonces = NonceStore::new();
        let err = verify(
            b"tampered",
            Some(&sig(b"original")),
            Some(&epoch()),
            Some("n1"),
            SECRET,
            &nonces,
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::AuthenticityFailure));
    }

    #[test]
    fn missing_or_malformed_signature_header_rejected() {
        let nonces = NonceStore::new();
        let body = b"x";
        for header in [None, Some("sha1=abcd"), Some("garbage"), Some("sha256=zz")] {
            assert!(verify(body, header, Some(&epoch()), Some("n1"), SECRET, &nonces, now()).is_err());
        }
    }

    #[test]
    fn stale_timestamp_rejected_fresh_accepted() {
        let nonces = NonceStore::new();
        let body = b"x";
        let stale = (now().timestamp() - MAX_SKEW_SECS - 1).to_string();
        assert!(verify(body, Some(&sig(body)), Some(&stale), Some("n1"), SECRET, &nonces, now()).is_err());
        let edge = (now().timestamp() - MAX_SKEW_SECS).to_string();
        assert!(verify(body, Some(&sig(body)), Some(&edge), Some("n2"), SECRET, &nonces, now()).is_ok());
    }

    #[test]
    fn future_timestamp_beyond_skew_rejected() {
        let nonces = NonceStore::new();
        let body = b"x";
        let future = (now().timestamp() + MAX_SKEW_SECS + 10).to_string();
        assert!(verify(body, Some(&sig(body)), Some(&future), Some("n1"), SECRET, &nonces, now()).is_err());
    }

    #[test]
    fn iso8601_timestamp_accepted() {
        let nonces = NonceStore::new();
        let body = b"x";
        verify(
            body,
            Some(&sig(body)),
            Some("2025-01-15T10:29:00Z"),
            Some("n1"),
            SECRET,
            &nonces,
            now(),
        )
        .unwrap();
    }

    #[test]
    fn unparseable_timestamp_rejected() {
        let nonces = NonceStore::new();
        let body = b"x";
        for ts in [None, Some("yesterday"), Some("")] {
            assert!(verify(body, Some(&sig(body)), ts, Some("n1"), SECRET, &nonces, now()).is_err());
        }
    }

    #[test]
    fn empty_nonce_rejected() {
        let nonces = NonceStore::new();
        let body = b"x";
        for nonce in [None, Some(""), Some("   ")] {
            assert!(verify(body, Some(&sig(body)), Some(&epoch()), nonce, SECRET, &nonces, now()).is_err());
        }
    }

    #[test]
    fn empty_secret_rejects_everything() {
        let nonces = NonceStore::new();
        let body = b"x";
        assert!(verify(body, Some(&sig(body)), Some(&epoch()), Some("n1"), "", &nonces, now()).is_err());
    }

    #[test]
    fn concurrent_duplicate_delivery_only_one_passes() {
        use std::sync::Arc;
        let nonces = Arc::new(NonceStore::new());
        let body: &'static [u8] = br#"{"event":"status_update"}"#;
        let signature = Arc::new(sig(body));
        let ts = Arc::new(epoch());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let nonces = nonces.clone();
            let signature = signature.clone();
            let ts = ts.clone();
            handles.push(std::thread::spawn(move || {
                verify(
                    body,
                    Some(&signature),
                    Some(&ts),
                    Some("race-nonce"),
                    SECRET,
                    &nonces,
                    now(),
                )
                .is_ok()
            }));
        }
        let passed = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .filter(|ok| *ok)
            .count();
        assert_eq!(passed, 1);
        assert_eq!(nonces.len(), 1);
    }

    #[test]
    fn prune_drops_only_aged_nonces() {
        let nonces = NonceStore::new();
        nonces.try_consume("old", now() - chrono::Duration::hours(NONCE_RETENTION_HOURS + 1));
        nonces.try_consume("fresh", now());
        assert_eq!(nonces.prune(now()), 1);
        assert!(!nonces.contains("old"));
        assert!(nonces.contains("fresh"));
    }
}
