//! REST API router for the matching and settlement core.
//!
//! Used by the binary and by integration tests. Create with [`create_router`].
//! Uses Extension for state so the router is `Router<()>` and works with
//! `into_make_service()`. Mutating routes sit behind the idempotency
//! middleware; webhook deliveries are verified inline, then handed to an
//! async worker so the HTTP response never waits on ledger work.

use axum::{
    body::{Body, Bytes},
    extract::{Extension, Path, Query, Request},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::engine::{Engine, NewOrder};
use crate::error::CoreError;
use crate::idempotency::{IdempotencyStore, StoredResponse};
use crate::settlement::{CustodianEvent, SettlementSource};
use crate::types::{Isin, OrderId, OrderStatus, OwnerId, SettlementId, Side, Trade};
use crate::webhook::{self, NonceStore};

/// Default number of levels per side in the depth query.
const DEFAULT_DEPTH: usize = 20;

/// Shared app state: one engine, the guards, and the webhook worker handle.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub idempotency: Arc<IdempotencyStore>,
    pub nonces: Arc<NonceStore>,
    pub webhook_secret: String,
    pub audit: Arc<dyn AuditSink>,
    webhook_tx: mpsc::Sender<CustodianEvent>,
}

impl AppState {
    /// Build the state and spawn the webhook worker that applies verified
    /// custodian events to the settlement ledger.
    pub fn new(engine: Arc<Engine>, webhook_secret: String, audit: Arc<dyn AuditSink>) -> Self {
        let (webhook_tx, mut webhook_rx) = mpsc::channel::<CustodianEvent>(256);
        let ledger = engine.settlements().clone();
        let worker_audit = audit.clone();
        tokio::spawn(async move {
            while let Some(event) = webhook_rx.recv().await {
                let (source, reference) = match &event {
                    CustodianEvent::StatusUpdate {
                        source, reference, ..
                    } => (*source, *reference),
                };
                match ledger.apply_custodian_event(&event, Utc::now()) {
                    Ok(updated) => worker_audit.emit(&AuditEvent::now(
                        source.as_str(),
                        "settlement_advance",
                        Some(serde_json::json!({
                            "settlementId": reference.0,
                            "status": updated.status,
                        })),
                        "success",
                    )),
                    Err(e) => {
                        log::warn!(
                            "webhook event refused settlement_id={}: {}",
                            reference.0,
                            e
                        );
                        worker_audit.emit(&AuditEvent::now(
                            source.as_str(),
                            "settlement_advance",
                            Some(serde_json::json!({ "settlementId": reference.0 })),
                            "rejected",
                        ));
                    }
                }
            }
        });
        Self {
            engine,
            idempotency: Arc::new(IdempotencyStore::new()),
            nonces: Arc::new(NonceStore::new()),
            webhook_secret,
            audit,
            webhook_tx,
        }
    }
}

/// Builds the REST router with state. Returns `Router<()>` so you can call
/// `.into_make_service()` for `axum::serve`.
pub fn create_router(state: AppState) -> Router<()> {
    Router::new()
        .route("/health", get(health))
        .route("/orders", post(submit_order))
        .route("/orders/cancel", post(cancel_order))
        .route("/orderbook/:isin", get(order_book))
        .route("/settlements", post(create_settlement))
        .route("/settlements/:id", get(get_settlement))
        .route("/webhooks/:source", post(receive_webhook))
        .layer(middleware::from_fn(idempotency_guard))
        .layer(Extension(state))
}

fn error_response(err: &CoreError) -> Response {
    let status = match err {
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::StateConflict(_) => StatusCode::CONFLICT,
        CoreError::AuthenticityFailure => StatusCode::UNAUTHORIZED,
        CoreError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

/// Replay guard for client retries: a POST carrying `Idempotency-Key` that
/// matches a stored `(key, path)` gets the first execution's response back
/// byte-identically; otherwise the handler runs and a successful JSON
/// response is stored for the validity window. Requests without the header
/// bypass the guard entirely.
async fn idempotency_guard(
    Extension(state): Extension<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let key = request
        .headers()
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .filter(|k| !k.is_empty())
        .map(str::to_string);
    let key = match key {
        Some(k) if request.method() == Method::POST => k,
        _ => return next.run(request).await,
    };
    let path = request.uri().path().to_string();
    let now = Utc::now();

    if let Some(stored) = state.idempotency.lookup(&key, &path, now) {
        log::info!("idempotent replay key={} path={}", key, path);
        return stored_response(stored);
    }

    let response = next.run(request).await;
    let status = response.status();
    if !status.is_success() {
        return response;
    }
    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => return error_response(&CoreError::Internal(format!("body buffering: {e}"))),
    };
    // Only well-formed JSON successes are worth replaying.
    if serde_json::from_slice::<serde_json::Value>(&bytes).is_ok() {
        state.idempotency.store(
            &key,
            &path,
            StoredResponse {
                status: status.as_u16(),
                body: bytes.to_vec(),
            },
            now,
        );
    }
    Response::from_parts(parts, Body::from(bytes))
}

fn stored_response(stored: StoredResponse) -> Response {
    let status = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::OK);
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(stored.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitOrderRequest {
    owner_id: OwnerId,
    isin: String,
    side: Side,
    quantity: Decimal,
    price: Decimal,
    #[serde(default)]
    payment_token: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitOrderResponse {
    order_id: OrderId,
    status: OrderStatus,
    filled_quantity: Decimal,
    trades: Vec<Trade>,
    settlement_ids: Vec<SettlementId>,
}

async fn submit_order(
    Extension(state): Extension<AppState>,
    Json(body): Json<SubmitOrderRequest>,
) -> Response {
    let new = NewOrder {
        owner: body.owner_id,
        side: body.side,
        isin: Isin(body.isin),
        quantity: body.quantity,
        price: body.price,
        payment_token: body.payment_token,
        expires_at: body.expires_at,
    };
    let isin = new.isin.clone();
    match state.engine.submit_order(new, Utc::now()) {
        Ok(outcome) => {
            state.audit.emit(&AuditEvent::now(
                body.owner_id.0.to_string(),
                "order_submit",
                Some(serde_json::json!({
                    "orderId": outcome.order.id.0,
                    "isin": isin.0,
                    "trades": outcome.trades.len(),
                })),
                "success",
            ));
            (
                StatusCode::OK,
                Json(SubmitOrderResponse {
                    order_id: outcome.order.id,
                    status: outcome.order.status,
                    filled_quantity: outcome.order.filled_quantity,
                    trades: outcome.trades,
                    settlement_ids: outcome.settlements.iter().map(|s| s.id).collect(),
                }),
            )
                .into_response()
        }
        Err(e) => {
            state.audit.emit(&AuditEvent::now(
                body.owner_id.0.to_string(),
                "order_submit",
                Some(serde_json::json!({ "isin": isin.0 })),
                "rejected",
            ));
            error_response(&e)
        }
    }
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest {
    order_id: OrderId,
}

async fn cancel_order(
    Extension(state): Extension<AppState>,
    Json(body): Json<CancelRequest>,
) -> Response {
    match state.engine.cancel_order(body.order_id) {
        Ok(order) => {
            state.audit.emit(&AuditEvent::now(
                order.owner.0.to_string(),
                "order_cancel",
                Some(serde_json::json!({ "orderId": order.id.0 })),
                "success",
            ));
            #[derive(serde::Serialize)]
            #[serde(rename_all = "camelCase")]
            struct Out {
                order_id: OrderId,
                status: OrderStatus,
            }
            (
                StatusCode::OK,
                Json(Out {
                    order_id: order.id,
                    status: order.status,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}

#[derive(serde::Deserialize)]
struct DepthQuery {
    depth: Option<usize>,
}

async fn order_book(
    Extension(state): Extension<AppState>,
    Path(isin): Path<String>,
    Query(query): Query<DepthQuery>,
) -> Response {
    let isin = Isin(isin);
    let depth = query.depth.unwrap_or(DEFAULT_DEPTH);
    let (buys, sells) = state.engine.book_depth(&isin, Utc::now(), depth);
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "isin": isin.0,
            "buyOrders": buys,
            "sellOrders": sells,
        })),
    )
        .into_response()
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSettlementRequest {
    source: String,
    isin: String,
    quantity: Decimal,
    #[serde(default)]
    counterparty: Option<String>,
    #[serde(default)]
    account: Option<String>,
}

async fn create_settlement(
    Extension(state): Extension<AppState>,
    Json(body): Json<CreateSettlementRequest>,
) -> Response {
    let source = match SettlementSource::parse(&body.source) {
        Some(source) => source,
        None => {
            return error_response(&CoreError::validation(format!(
                "unknown settlement source: {}",
                body.source
            )))
        }
    };
    match state.engine.settlements().open(
        source,
        Isin(body.isin),
        body.quantity,
        body.counterparty,
        body.account,
        "operator instruction",
        Utc::now(),
    ) {
        Ok(settlement) => {
            state.audit.emit(&AuditEvent::now(
                "operator",
                "settlement_create",
                Some(serde_json::json!({
                    "settlementId": settlement.id.0,
                    "source": source.as_str(),
                })),
                "success",
            ));
            #[derive(serde::Serialize)]
            #[serde(rename_all = "camelCase")]
            struct Out {
                settlement_id: SettlementId,
                status: crate::settlement::SettlementStatus,
            }
            (
                StatusCode::OK,
                Json(Out {
                    settlement_id: settlement.id,
                    status: settlement.status,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn get_settlement(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.engine.settlements().get(SettlementId(id)) {
        Some(settlement) => (StatusCode::OK, Json(settlement)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "settlement not found" })),
        )
            .into_response(),
    }
}

async fn receive_webhook(
    Extension(state): Extension<AppState>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let source = match SettlementSource::parse(&source) {
        Some(source) => source,
        None => {
            return error_response(&CoreError::validation(format!(
                "unknown webhook source: {source}"
            )))
        }
    };
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let nonce = header("x-nonce").map(str::to_string);

    if let Err(e) = webhook::verify(
        &body,
        header("x-signature"),
        header("x-timestamp"),
        nonce.as_deref(),
        &state.webhook_secret,
        &state.nonces,
        Utc::now(),
    ) {
        state.audit.emit(&AuditEvent::now(
            source.as_str(),
            "webhook_reject",
            None,
            "rejected",
        ));
        return error_response(&e);
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return error_response(&CoreError::validation("body is not valid JSON")),
    };
    let event = match CustodianEvent::parse(source, &payload) {
        Ok(event) => event,
        Err(e) => return error_response(&e),
    };

    if state.webhook_tx.send(event).await.is_err() {
        return error_response(&CoreError::Internal("webhook worker unavailable".into()));
    }
    // Verified and queued; ledger work continues on the worker.
    let event_id = nonce.unwrap_or_default();
    state.audit.emit(&AuditEvent::now(
        source.as_str(),
        "webhook_accept",
        Some(serde_json::json!({ "eventId": event_id })),
        "success",
    ));
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "received": true,
            "source": source.as_str(),
            "eventId": event_id,
        })),
    )
        .into_response()
}
