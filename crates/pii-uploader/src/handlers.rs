//! `POST /upload` (§4.4).
//!
//! Grounded on `ccai_insights_function/main.py`'s `upload_transcript`:
//! conversation-id derivation, the submit-then-poll shape, and the
//! already-exists-is-success rule. Unlike the original, every other
//! non-2xx outcome is re-raised as a 5xx here rather than logged and
//! swallowed, per the explicit redelivery invariant this re-implementation
//! follows (see the project's grounding notes on that divergence).

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::app::{AppState, POLL_INTERVAL_SECS};
use crate::sink::{OperationStatus, RedactionConfig, SinkError, UploadConversationRequest};

pub async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
pub struct BlobCreatedEvent {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub name: String,
}

/// `<conversation_id>_transcript.json` → `conversation_id` (§4.4 "Inputs").
fn derive_conversation_id(name: &str) -> String {
    let stem = name.strip_suffix(".json").unwrap_or(name);
    stem.strip_suffix("_transcript").unwrap_or(stem).to_string()
}

pub async fn upload_handler(
    State(state): State<Arc<AppState>>,
    Json(event): Json<BlobCreatedEvent>,
) -> (StatusCode, Json<Value>) {
    if event.bucket.trim().is_empty() || event.name.trim().is_empty() {
        warn!(event = "missing_fields_error", "rejecting blob-created event");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing bucket or name"})),
        );
    }

    let conversation_id = derive_conversation_id(&event.name);
    let transcript_uri = format!("s3://{}/{}", event.bucket, event.name);

    let request = UploadConversationRequest {
        parent: state.config.parent_scope(),
        conversation_id: conversation_id.clone(),
        transcript_uri,
        redaction_config: RedactionConfig {
            inspect_template: format!(
                "{}/inspectTemplates/identify",
                state.config.parent_scope()
            ),
            deidentify_template: format!(
                "{}/deidentifyTemplates/deidentify",
                state.config.parent_scope()
            ),
        },
    };

    let operation_name = match state.sink.submit(&request).await {
        Ok(name) => name,
        Err(SinkError::Transient(msg)) => {
            warn!(
                conversation_id = %conversation_id,
                event = "ccai_submit_error",
                error = msg,
                "transient error submitting analytics-sink upload"
            );
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "failed to submit upload"})),
            );
        }
        Err(SinkError::Other(msg)) => {
            warn!(
                conversation_id = %conversation_id,
                event = "ccai_submit_error",
                error = msg,
                "error submitting analytics-sink upload"
            );
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "failed to submit upload"})),
            );
        }
    };

    let wait = tokio::time::timeout(
        Duration::from_secs(state.wait_deadline_secs),
        poll_until_done(&state, &operation_name),
    )
    .await;

    match wait {
        Ok(Ok(status)) => match status {
            OperationStatus::Succeeded => {
                info!(
                    conversation_id = %conversation_id,
                    event = "ccai_upload_success",
                    "analytics-sink ingestion completed"
                );
                (StatusCode::OK, Json(json!({"status": "uploaded"})))
            }
            OperationStatus::Failed { ref message, .. } if status.is_already_exists() => {
                warn!(
                    conversation_id = %conversation_id,
                    event = "ccai_upload_already_exists",
                    message,
                    "analytics-sink already has this conversation, treating as success"
                );
                (StatusCode::OK, Json(json!({"status": "already_exists"})))
            }
            OperationStatus::Failed { code, message } => {
                warn!(
                    conversation_id = %conversation_id,
                    event = "ccai_upload_error",
                    code,
                    message = %message,
                    "analytics-sink ingestion failed"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": message})),
                )
            }
            OperationStatus::Pending => unreachable!("poll_until_done only returns a terminal status"),
        },
        Ok(Err(e)) => {
            warn!(
                conversation_id = %conversation_id,
                event = "ccai_poll_error",
                error = %e,
                "error polling analytics-sink operation"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "failed to poll upload operation"})),
            )
        }
        Err(_) => {
            warn!(
                conversation_id = %conversation_id,
                event = "polling_timeout",
                deadline_secs = state.wait_deadline_secs,
                "analytics-sink ingestion did not complete before the overall deadline"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "upload did not complete before deadline"})),
            )
        }
    }
}

/// Polls `operation_name` at a fixed interval until it reports a terminal
/// status (§4.4 step 3), grounded on `SchedulerEngine::run`'s
/// `interval.tick()` loop.
async fn poll_until_done(state: &AppState, operation_name: &str) -> Result<OperationStatus, SinkError> {
    let mut interval = tokio::time::interval(Duration::from_secs(POLL_INTERVAL_SECS));
    interval.tick().await; // first tick fires immediately

    loop {
        match state.sink.poll(operation_name).await? {
            OperationStatus::Pending => {
                interval.tick().await;
            }
            terminal => return Ok(terminal),
        }
    }
}
