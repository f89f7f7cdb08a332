//! Periodic settlement reconciliation against the custodian.
//!
//! For every settlement that is not yet terminal, fetch the custodian's
//! reported status. Legal forward drift is applied through the ledger's
//! `advance`; drift the transition table forbids is recorded on the
//! timeline as a discrepancy instead of being overwritten; upstream
//! failures are logged and retried on the next pass. Custodian calls run
//! outside any instrument lock.

use crate::custodian::CustodianClient;
use crate::settlement::SettlementLedger;
use chrono::Utc;
use std::sync::Arc;

/// Outcome of one reconciliation pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct ReconciliationReport {
    /// Settlements compared against the custodian.
    pub checked: usize,
    /// Settlements advanced to match reported state.
    pub advanced: usize,
    /// Disagreements recorded on timelines without mutation.
    pub discrepancies: usize,
    /// Custodian calls that failed; retried next pass.
    pub upstream_errors: usize,
}

pub struct Reconciler {
    ledger: Arc<SettlementLedger>,
    client: Arc<dyn CustodianClient>,
}

impl Reconciler {
    pub fn new(ledger: Arc<SettlementLedger>, client: Arc<dyn CustodianClient>) -> Self {
        Self { ledger, client }
    }

    /// Run one pass over all non-terminal settlements.
    pub async fn run_once(&self) -> ReconciliationReport {
        let mut report = ReconciliationReport::default();
        for settlement in self.ledger.open_settlements() {
            report.checked += 1;
            let reference = settlement.id.0.to_string();
            let reported = match self.client.get_instruction_status(&reference).await {
                Ok(status) => status,
                Err(e) => {
                    // Leave the record in its last known state.
                    log::warn!(
                        "reconciliation: custodian unavailable for settlement {}: {}",
                        reference,
                        e
                    );
                    report.upstream_errors += 1;
                    continue;
                }
            };
            let now = Utc::now();
            if reported == settlement.status {
                self.ledger.touch_synced(settlement.id, now);
                continue;
            }
            if settlement.status.can_advance_to(reported) {
                match self.ledger.advance(
                    settlement.id,
                    reported,
                    format!("reconciled: {} reported {:?}", settlement.source.as_str(), reported),
                    now,
                ) {
                    Ok(_) => {
                        self.ledger.touch_synced(settlement.id, now);
                        report.advanced += 1;
                    }
                    Err(e) => {
                        // Lost a race with a webhook; record, do not overwrite.
                        log::warn!("reconciliation: advance refused for {}: {}", reference, e);
                        report.discrepancies += 1;
                    }
                }
            } else {
                let note = format!(
                    "discrepancy: local {:?}, {} reported {:?}",
                    settlement.status,
                    settlement.source.as_str(),
                    reported
                );
                log::warn!("reconciliation: settlement {} {}", reference, note);
                let _ = self.ledger.record_fact(settlement.id, note, now);
                report.discrepancies += 1;
            }
        }
        log::info!(
            "reconciliation pass: checked={} advanced={} discrepancies={} upstream_errors={}",
            report.checked,
            report.advanced,
            report.discrepancies,
            report.upstream_errors
        );
        report
    }
}
