//! The analytics-sink long-running-ingestion collaborator (§4.4).
//!
//! Grounded on `pii-detection`'s `DetectionEngine` trait shape (request in,
//! classified error out) and on `ccai_insights_function/main.py`'s
//! `UploadConversationRequest`/`AlreadyExists` handling for the wire shape
//! and the already-exists-is-success rule.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Numeric code for "already exists" in the standard RPC code space (§4.4
/// step 4) — carried over from the original's `google.api_core.exceptions`
/// code, which this HTTP-flavored RPC mirrors as a plain integer.
pub const ALREADY_EXISTS_CODE: i32 = 6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionConfig {
    pub inspect_template: String,
    pub deidentify_template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConversationRequest {
    pub parent: String,
    pub conversation_id: String,
    pub transcript_uri: String,
    pub redaction_config: RedactionConfig,
}

/// Terminal outcome of a long-running ingestion operation (§4.4 step 3:
/// "success, failure, or deadline-exceeded" — deadline-exceeded is modeled
/// by the wait loop's own timeout, not as a variant here).
#[derive(Debug, Clone)]
pub enum OperationStatus {
    Pending,
    Succeeded,
    Failed { code: i32, message: String },
}

impl OperationStatus {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, OperationStatus::Failed { code, .. } if *code == ALREADY_EXISTS_CODE)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("transient sink error: {0}")]
    Transient(String),
    #[error("sink error: {0}")]
    Other(String),
}

#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// Start the long-running ingestion call, returning its operation name
    /// (§4.4 step 2).
    async fn submit(&self, request: &UploadConversationRequest) -> Result<String, SinkError>;

    /// Check the current status of a previously submitted operation (§4.4
    /// step 3).
    async fn poll(&self, operation_name: &str) -> Result<OperationStatus, SinkError>;
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    operation_name: String,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    done: bool,
    #[serde(default)]
    error: Option<PollError>,
}

#[derive(Debug, Deserialize)]
struct PollError {
    code: i32,
    message: String,
}

/// HTTP-backed RPC client — the analytics sink is an external collaborator
/// (§1), reached the same way the detection engine is in `pii-detection`.
pub struct HttpAnalyticsSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAnalyticsSink {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl AnalyticsSink for HttpAnalyticsSink {
    async fn submit(&self, request: &UploadConversationRequest) -> Result<String, SinkError> {
        let response = self
            .client
            .post(format!("{}/submit", self.endpoint))
            .json(request)
            .send()
            .await
            .map_err(|e| SinkError::Transient(e.to_string()))?;

        match response.status().as_u16() {
            200..=299 => {
                let parsed: SubmitResponse = response
                    .json()
                    .await
                    .map_err(|e| SinkError::Other(e.to_string()))?;
                Ok(parsed.operation_name)
            }
            502 | 503 | 504 => Err(SinkError::Transient(format!("status {}", response.status()))),
            other => Err(SinkError::Other(format!("status {other}"))),
        }
    }

    async fn poll(&self, operation_name: &str) -> Result<OperationStatus, SinkError> {
        let response = self
            .client
            .get(format!("{}/operations/{}", self.endpoint, operation_name))
            .send()
            .await
            .map_err(|e| SinkError::Transient(e.to_string()))?;

        match response.status().as_u16() {
            200..=299 => {
                let parsed: PollResponse = response
                    .json()
                    .await
                    .map_err(|e| SinkError::Other(e.to_string()))?;
                if !parsed.done {
                    return Ok(OperationStatus::Pending);
                }
                match parsed.error {
                    Some(err) => Ok(OperationStatus::Failed {
                        code: err.code,
                        message: err.message,
                    }),
                    None => Ok(OperationStatus::Succeeded),
                }
            }
            502 | 503 | 504 => Err(SinkError::Transient(format!("status {}", response.status()))),
            other => Err(SinkError::Other(format!("status {other}"))),
        }
    }
}
