//! Structured audit trail for material actions.
//!
//! Events: order submit/cancel, settlement create/advance, webhook accept/reject.
//! Format: JSON with timestamp, actor, action, resource, outcome. Sink: stdout or pluggable (e.g. test mock).

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Single audit record: one line of JSON per event.
#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    /// Unix timestamp (seconds since epoch). Log aggregators can convert to ISO8601.
    pub timestamp_secs: u64,
    /// Who performed the action (e.g. owner id, custodian source, "anonymous").
    pub actor: String,
    /// Action type: order_submit, order_cancel, settlement_create, settlement_advance, webhook_accept, webhook_reject.
    pub action: String,
    /// Resource identifiers (e.g. order_id, settlement_id, isin). Flexible for different action types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<serde_json::Value>,
    /// Outcome: success, rejected, error.
    pub outcome: String,
}

impl AuditEvent {
    pub fn now(actor: impl Into<String>, action: impl Into<String>, resource: Option<serde_json::Value>, outcome: impl Into<String>) -> Self {
        let timestamp_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            timestamp_secs,
            actor: actor.into(),
            action: action.into(),
            resource,
            outcome: outcome.into(),
        }
    }
}

/// Sink for audit events. Implementations write to stdout, file, or in-memory (tests).
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &AuditEvent);
}

/// Writes one JSON line per event to stdout. Safe to use from multiple threads.
pub struct StdoutAuditSink;

impl AuditSink for StdoutAuditSink {
    fn emit(&self, event: &AuditEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{}", line);
        }
    }
}

/// In-memory sink that stores events for tests. Clone shares the same backing buffer.
#[derive(Clone)]
pub struct InMemoryAuditSink {
    events: std::sync::Arc<std::sync::Mutex<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self {
            events: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("lock").clone()
    }

    pub fn clear(&self) {
        self.events.lock().expect("lock").clear();
    }
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn emit(&self, event: &AuditEvent) {
        self.events.lock().expect("lock").push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_sink_captures_events() {
        let sink = InMemoryAuditSink::new();
        sink.emit(&AuditEvent::now(
            "owner-1",
            "order_submit",
            Some(serde_json::json!({"isin": "US0378331005"})),
            "success",
        ));
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "order_submit");
        assert_eq!(events[0].outcome, "success");
    }

    #[test]
    fn event_serializes_without_null_resource() {
        let event = AuditEvent::now("euroclear", "webhook_reject", None, "rejected");
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("resource"));
        assert!(json.contains("webhook_reject"));
    }
}
