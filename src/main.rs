//! HTTP server for the matching and settlement core.
//!
//! Endpoints: health, order submit/cancel, order book depth, settlement
//! create/read, custodian webhooks. Background loops: order expiry sweep,
//! settlement reconciliation, idempotency/nonce pruning.

use ledgerbridge::api::{self, AppState};
use ledgerbridge::audit::StdoutAuditSink;
use ledgerbridge::custodian::HttpCustodianClient;
use ledgerbridge::engine::Engine;
use ledgerbridge::reconciliation::Reconciler;
use ledgerbridge::settlement::{SettlementLedger, SettlementSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() {
    let _ = env_logger::try_init();

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let webhook_secret = std::env::var("WEBHOOK_SECRET").unwrap_or_default();
    if webhook_secret.is_empty() {
        log::warn!("WEBHOOK_SECRET not set; all webhook deliveries will be rejected");
    }
    let default_source = std::env::var("DEFAULT_CUSTODIAN")
        .ok()
        .and_then(|s| SettlementSource::parse(&s))
        .unwrap_or(SettlementSource::Euroclear);
    let custodian_base =
        std::env::var("CUSTODIAN_API_BASE").unwrap_or_else(|_| "http://localhost:9090".into());
    let custodian_key = std::env::var("CUSTODIAN_API_KEY").unwrap_or_default();
    let custodian_timeout = Duration::from_secs(env_u64("CUSTODIAN_TIMEOUT_SECS", 10));
    let reconcile_interval = Duration::from_secs(env_u64("RECONCILE_INTERVAL_SECS", 60));
    let sweep_interval = Duration::from_secs(env_u64("EXPIRY_SWEEP_INTERVAL_SECS", 30));

    let ledger = Arc::new(SettlementLedger::new());
    let engine = Arc::new(Engine::new(ledger.clone(), default_source));
    let custodian = Arc::new(
        HttpCustodianClient::new(custodian_base, custodian_key, custodian_timeout)
            .expect("custodian client"),
    );
    let state = AppState::new(engine.clone(), webhook_secret, Arc::new(StdoutAuditSink));

    // Expiry sweep.
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                engine.sweep_expired(chrono::Utc::now());
            }
        });
    }

    // Reconciliation.
    {
        let reconciler = Reconciler::new(ledger, custodian);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reconcile_interval);
            loop {
                ticker.tick().await;
                reconciler.run_once().await;
            }
        });
    }

    // Guard-store pruning.
    {
        let idempotency = state.idempotency.clone();
        let nonces = state.nonces.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                let now = chrono::Utc::now();
                idempotency.prune_expired(now);
                nonces.prune(now);
            }
        });
    }

    let app = api::create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await.expect("bind");
    eprintln!("listening on http://{}", addr);
    axum::serve(listener, app.into_make_service())
        .await
        .expect("serve");
}
