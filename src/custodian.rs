//! Custodian client seam: positions, instructions, instruction status.
//!
//! The core only depends on this request/response contract; the HTTP
//! implementation is a thin reqwest adapter with a bounded timeout. A
//! synchronous confirmation from the custodian never implies settlement
//! finality — status flows back through webhooks and reconciliation.

use crate::error::CoreError;
use crate::settlement::SettlementStatus;
use crate::types::Isin;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::time::Duration;

/// One position line as reported by a custodian.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub isin: Isin,
    pub settled_qty: Decimal,
    pub pending_qty: Decimal,
    pub as_of: DateTime<Utc>,
}

/// Outbound custodial instruction.
#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionRequest {
    pub instruction_type: String,
    pub isin: Isin,
    pub quantity: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterparty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
}

/// Remote custodian adapter. All calls are fallible and bounded by the
/// implementation's timeout.
#[async_trait]
pub trait CustodianClient: Send + Sync {
    async fn get_positions(
        &self,
        account: &str,
        isin: Option<&Isin>,
    ) -> Result<Vec<Position>, CoreError>;

    /// Submit an instruction; returns the custodian's instruction id.
    async fn create_instruction(&self, request: &InstructionRequest) -> Result<String, CoreError>;

    /// Current custodian-reported status for an instruction/settlement
    /// reference.
    async fn get_instruction_status(&self, reference: &str)
        -> Result<SettlementStatus, CoreError>;
}

/// HTTP custodian client with bearer-key auth and a per-request timeout.
pub struct HttpCustodianClient {
    base: String,
    api_key: String,
    http: reqwest::Client,
}

impl HttpCustodianClient {
    pub fn new(base: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self, CoreError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Internal(format!("http client build failed: {e}")))?;
        Ok(Self {
            base: base.into(),
            api_key: api_key.into(),
            http,
        })
    }

    fn upstream(err: reqwest::Error) -> CoreError {
        CoreError::UpstreamUnavailable(err.to_string())
    }
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionsResponse {
    positions: Vec<Position>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstructionResponse {
    instruction_id: String,
}

#[derive(serde::Deserialize)]
struct StatusResponse {
    status: String,
}

#[async_trait]
impl CustodianClient for HttpCustodianClient {
    async fn get_positions(
        &self,
        account: &str,
        isin: Option<&Isin>,
    ) -> Result<Vec<Position>, CoreError> {
        let mut request = self
            .http
            .get(format!("{}/positions/{}", self.base, account))
            .bearer_auth(&self.api_key);
        if let Some(isin) = isin {
            request = request.query(&[("isin", isin.0.as_str())]);
        }
        let response = request
            .send()
            .await
            .map_err(Self::upstream)?
            .error_for_status()
            .map_err(Self::upstream)?;
        let body: PositionsResponse = response.json().await.map_err(Self::upstream)?;
        Ok(body.positions)
    }

    async fn create_instruction(&self, request: &InstructionRequest) -> Result<String, CoreError> {
        let response = self
            .http
            .post(format!("{}/instructions", self.base))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(Self::upstream)?
            .error_for_status()
            .map_err(Self::upstream)?;
        let body: InstructionResponse = response.json().await.map_err(Self::upstream)?;
        Ok(body.instruction_id)
    }

    async fn get_instruction_status(
        &self,
        reference: &str,
    ) -> Result<SettlementStatus, CoreError> {
        let response = self
            .http
            .get(format!("{}/instructions/{}", self.base, reference))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(Self::upstream)?
            .error_for_status()
            .map_err(Self::upstream)?;
        let body: StatusResponse = response.json().await.map_err(Self::upstream)?;
        SettlementStatus::parse(&body.status).ok_or_else(|| {
            CoreError::UpstreamUnavailable(format!("unknown custodian status: {}", body.status))
        })
    }
}
