//! Settlement lifecycle: a bounded state machine with an append-only
//! timeline.
//!
//! A [`Settlement`] tracks post-trade custodial settlement of a quantity of
//! an instrument, created either when a trade executes or when an operator
//! submits an instruction. The legal transitions are exactly
//! INITIATED -> MATCHED -> SETTLED plus INITIATED/MATCHED -> FAILED; nothing
//! moves backward and the two terminal states never move again. Every
//! accepted transition appends a [`TimelineFact`]; an illegal request is
//! rejected without mutating the record.
//!
//! [`SettlementLedger::apply_custodian_event`] is the only path by which an
//! externally sourced fact (a verified webhook) drives a transition.

use crate::error::CoreError;
use crate::types::{Isin, SettlementId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Custodian channel a settlement originates from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementSource {
    Euroclear,
    Clearstream,
    Xetra,
}

impl SettlementSource {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "euroclear" => Some(SettlementSource::Euroclear),
            "clearstream" => Some(SettlementSource::Clearstream),
            "xetra" => Some(SettlementSource::Xetra),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SettlementSource::Euroclear => "euroclear",
            SettlementSource::Clearstream => "clearstream",
            SettlementSource::Xetra => "xetra",
        }
    }
}

/// Settlement status. SETTLED and FAILED are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Initiated,
    Matched,
    Settled,
    Failed,
}

impl SettlementStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SettlementStatus::Settled | SettlementStatus::Failed)
    }

    /// The full legal-transition table. INITIATED -> SETTLED directly is
    /// not in it: settlement must be MATCHED first.
    pub fn can_advance_to(self, next: SettlementStatus) -> bool {
        use SettlementStatus::*;
        matches!(
            (self, next),
            (Initiated, Matched) | (Matched, Settled) | (Initiated, Failed) | (Matched, Failed)
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INITIATED" => Some(SettlementStatus::Initiated),
            "MATCHED" => Some(SettlementStatus::Matched),
            "SETTLED" => Some(SettlementStatus::Settled),
            "FAILED" => Some(SettlementStatus::Failed),
            _ => None,
        }
    }
}

/// One recorded lifecycle fact. The timeline only ever grows.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TimelineFact {
    pub at: DateTime<Utc>,
    /// Status the record held after this fact, if the fact changed it.
    pub status: Option<SettlementStatus>,
    pub note: String,
}

/// Post-trade custodial settlement record. Never deleted (regulatory
/// retention).
#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
    pub id: SettlementId,
    pub source: SettlementSource,
    pub isin: Isin,
    pub quantity: Decimal,
    pub counterparty: Option<String>,
    pub account: Option<String>,
    pub status: SettlementStatus,
    pub timeline: Vec<TimelineFact>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A custodian-reported fact, decoded from a verified webhook payload.
/// The event vocabulary is closed; anything else is an explicit error
/// rather than a silent pass-through.
#[derive(Clone, Debug, PartialEq)]
pub enum CustodianEvent {
    /// `status_update`: the custodian reports a new status for a
    /// settlement we hold.
    StatusUpdate {
        source: SettlementSource,
        reference: SettlementId,
        status: SettlementStatus,
    },
}

impl CustodianEvent {
    /// Decode a webhook body: `{"event": "...", "reference": "<uuid>",
    /// "data": {"status": "..."}}`. Unknown event kinds and malformed
    /// references are validation errors.
    pub fn parse(source: SettlementSource, payload: &serde_json::Value) -> Result<Self, CoreError> {
        let kind = payload
            .get("event")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::validation("missing event type"))?;
        match kind {
            "status_update" => {
                let reference = payload
                    .get("reference")
                    .and_then(|v| v.as_str())
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .ok_or_else(|| CoreError::validation("missing or malformed reference"))?;
                let status = payload
                    .get("data")
                    .and_then(|d| d.get("status"))
                    .and_then(|v| v.as_str())
                    .and_then(SettlementStatus::parse)
                    .ok_or_else(|| CoreError::validation("missing or unknown status"))?;
                Ok(CustodianEvent::StatusUpdate {
                    source,
                    reference: SettlementId(reference),
                    status,
                })
            }
            other => Err(CoreError::validation(format!(
                "unknown event type: {other}"
            ))),
        }
    }
}

/// In-memory store of settlement records with transition enforcement.
#[derive(Debug, Default)]
pub struct SettlementLedger {
    records: Mutex<HashMap<SettlementId, Settlement>>,
}

impl SettlementLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an INITIATED settlement with a seeded timeline.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &self,
        source: SettlementSource,
        isin: Isin,
        quantity: Decimal,
        counterparty: Option<String>,
        account: Option<String>,
        note: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Settlement, CoreError> {
        if quantity <= Decimal::ZERO {
            return Err(CoreError::validation("settlement quantity must be positive"));
        }
        if isin.0.is_empty() {
            return Err(CoreError::validation("instrument identifier required"));
        }
        let settlement = Settlement {
            id: SettlementId(Uuid::new_v4()),
            source,
            isin,
            quantity,
            counterparty,
            account,
            status: SettlementStatus::Initiated,
            timeline: vec![TimelineFact {
                at: now,
                status: Some(SettlementStatus::Initiated),
                note: note.into(),
            }],
            last_synced_at: None,
            created_at: now,
        };
        log::info!(
            "settlement opened settlement_id={} source={} isin={} quantity={}",
            settlement.id.0,
            settlement.source.as_str(),
            settlement.isin,
            settlement.quantity
        );
        let mut records = self.records.lock().expect("ledger lock");
        records.insert(settlement.id, settlement.clone());
        Ok(settlement)
    }

    pub fn get(&self, id: SettlementId) -> Option<Settlement> {
        self.records.lock().expect("ledger lock").get(&id).cloned()
    }

    /// Advance a settlement to `target`, appending `fact` to the timeline.
    /// An illegal transition is rejected with a state conflict and does not
    /// mutate the record.
    pub fn advance(
        &self,
        id: SettlementId,
        target: SettlementStatus,
        fact: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Settlement, CoreError> {
        let mut records = self.records.lock().expect("ledger lock");
        let settlement = records
            .get_mut(&id)
            .ok_or_else(|| CoreError::state_conflict(format!("unknown settlement {}", id.0)))?;
        if !settlement.status.can_advance_to(target) {
            return Err(CoreError::state_conflict(format!(
                "settlement {} cannot advance {:?} -> {:?}",
                id.0, settlement.status, target
            )));
        }
        settlement.status = target;
        settlement.timeline.push(TimelineFact {
            at: now,
            status: Some(target),
            note: fact.into(),
        });
        log::info!(
            "settlement advanced settlement_id={} status={:?}",
            id.0,
            target
        );
        Ok(settlement.clone())
    }

    /// Append a non-transition fact (e.g. a reconciliation discrepancy)
    /// without changing status.
    pub fn record_fact(
        &self,
        id: SettlementId,
        note: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut records = self.records.lock().expect("ledger lock");
        let settlement = records
            .get_mut(&id)
            .ok_or_else(|| CoreError::state_conflict(format!("unknown settlement {}", id.0)))?;
        settlement.timeline.push(TimelineFact {
            at: now,
            status: None,
            note: note.into(),
        });
        Ok(())
    }

    /// Mark a settlement as freshly compared against the custodian.
    pub fn touch_synced(&self, id: SettlementId, now: DateTime<Utc>) {
        let mut records = self.records.lock().expect("ledger lock");
        if let Some(s) = records.get_mut(&id) {
            s.last_synced_at = Some(now);
        }
    }

    /// Settlements that are neither SETTLED nor FAILED, for reconciliation.
    pub fn open_settlements(&self) -> Vec<Settlement> {
        self.records
            .lock()
            .expect("ledger lock")
            .values()
            .filter(|s| !s.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Apply a verified custodian event. The intended target state is
    /// re-derived from the event's declared status; events referencing an
    /// unknown settlement are refused.
    pub fn apply_custodian_event(
        &self,
        event: &CustodianEvent,
        now: DateTime<Utc>,
    ) -> Result<Settlement, CoreError> {
        match event {
            CustodianEvent::StatusUpdate {
                source,
                reference,
                status,
            } => {
                let updated = self.advance(
                    *reference,
                    *status,
                    format!("{} reported {:?}", source.as_str(), status),
                    now,
                )?;
                self.touch_synced(*reference, now);
                Ok(updated)
            }
        }
    }
}
