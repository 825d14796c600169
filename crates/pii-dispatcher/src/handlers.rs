//! `/ingest` — the dispatcher's single route (§4.1).
//!
//! Grounded on `subscriber_service/main.py`'s `process_transcript_event`:
//! a non-2xx from the Redactor or a failed republish is logged and the
//! utterance is skipped, but the overall handler still acknowledges the
//! bus delivery (`"OK", 200` in the source) — only envelope decode errors
//! and truly unexpected failures request redelivery.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::{info, warn};

use pii_bus::BusEnvelope;
use pii_core::types::{ParticipantRole, Utterance};
use pii_identity::IdentityMinter;

use crate::app::AppState;

pub async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub async fn ingest_handler<M: IdentityMinter + 'static>(
    State(state): State<Arc<AppState<M>>>,
    Json(envelope): Json<BusEnvelope>,
) -> (StatusCode, Json<Value>) {
    let utterance: Utterance = match envelope.decode() {
        Ok(u) => u,
        Err(e) => {
            warn!(event = "envelope_decode_error", error = %e, "failed to decode raw-utterance envelope");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid envelope", "reason": e.to_string()})),
            );
        }
    };

    if let Err(reason) = utterance.validate_shape() {
        warn!(
            conversation_id = %utterance.conversation_id,
            event = "missing_fields_error",
            reason,
            "rejecting utterance with missing required fields"
        );
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing required fields", "reason": reason})),
        );
    }

    let role = match ParticipantRole::parse(&utterance.participant_role) {
        Some(role) => role,
        None => {
            warn!(
                conversation_id = %utterance.conversation_id,
                event = "unknown_role_skipped",
                role = %utterance.participant_role,
                "unknown participant role, skipping utterance"
            );
            return (StatusCode::OK, Json(json!({"status": "skipped"})));
        }
    };

    match dispatch(&state, &utterance, role).await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ok"}))),
        Err(e) => {
            tracing::error!(
                conversation_id = %utterance.conversation_id,
                event = "dispatch_unexpected_error",
                error = %e,
                "unexpected dispatcher error, requesting redelivery"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            )
        }
    }
}

/// Call the Redactor for one utterance and republish on success. Returns
/// `Err` only for unexpected failures (e.g. identity-token minting) that
/// should cause the bus to redeliver — a rejected or unreachable Redactor
/// call is logged and absorbed, never propagated (§4.1 "Failure
/// semantics").
async fn dispatch<M: IdentityMinter>(
    state: &AppState<M>,
    utterance: &Utterance,
    role: ParticipantRole,
) -> pii_core::error::Result<()> {
    let token = state.identity_cache.token_for(&state.redactor_base_url).await?;

    match role {
        ParticipantRole::Agent => {
            let url = format!("{}/handle-agent-utterance", state.redactor_base_url);
            let body = json!({"conversation_id": utterance.conversation_id, "transcript": utterance.text});
            match state.http_client.post(&url).bearer_auth(&token).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    republish(state, utterance, &utterance.text).await;
                }
                Ok(resp) => {
                    warn!(
                        conversation_id = %utterance.conversation_id,
                        event = "redactor_call_rejected",
                        status = %resp.status(),
                        "agent-utterance call rejected, skipping"
                    );
                }
                Err(e) => {
                    warn!(
                        conversation_id = %utterance.conversation_id,
                        event = "redactor_call_error",
                        error = %e,
                        "agent-utterance call failed, skipping"
                    );
                }
            }
        }
        ParticipantRole::EndUser => {
            let url = format!("{}/handle-customer-utterance", state.redactor_base_url);
            let body = json!({"conversation_id": utterance.conversation_id, "transcript": utterance.text});
            match state.http_client.post(&url).bearer_auth(&token).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                    Ok(parsed) => match parsed.get("redacted_transcript").and_then(|v| v.as_str()) {
                        Some(redacted) => republish(state, utterance, redacted).await,
                        None => warn!(
                            conversation_id = %utterance.conversation_id,
                            event = "redactor_response_shape_error",
                            "customer-utterance response missing redacted_transcript, skipping"
                        ),
                    },
                    Err(e) => warn!(
                        conversation_id = %utterance.conversation_id,
                        event = "redactor_response_decode_error",
                        error = %e,
                        "failed to decode customer-utterance response, skipping"
                    ),
                },
                Ok(resp) => {
                    warn!(
                        conversation_id = %utterance.conversation_id,
                        event = "redactor_call_rejected",
                        status = %resp.status(),
                        "customer-utterance call rejected, skipping"
                    );
                }
                Err(e) => {
                    warn!(
                        conversation_id = %utterance.conversation_id,
                        event = "redactor_call_error",
                        error = %e,
                        "customer-utterance call failed, skipping"
                    );
                }
            }
        }
    }

    Ok(())
}


async fn republish<M: IdentityMinter>(state: &AppState<M>, original: &Utterance, text: &str) {
    let mut outgoing = original.clone();
    outgoing.text = text.to_string();

    let envelope = match BusEnvelope::encode(&outgoing) {
        Ok(e) => e,
        Err(e) => {
            warn!(conversation_id = %original.conversation_id, event = "republish_encode_error", error = %e, "failed to encode redacted utterance");
            return;
        }
    };

    let payload = match serde_json::to_vec(&envelope) {
        Ok(p) => p,
        Err(e) => {
            warn!(conversation_id = %original.conversation_id, event = "republish_encode_error", error = %e, "failed to serialize envelope");
            return;
        }
    };

    let token = match state.identity_cache.token_for(&state.redacted_bus_url).await {
        Ok(t) => t,
        Err(e) => {
            warn!(conversation_id = %original.conversation_id, event = "republish_token_error", error = %e, "failed to mint token for redacted bus");
            return;
        }
    };

    match state
        .bus_publisher
        .publish(&state.redacted_bus_url, &payload, &token)
        .await
    {
        Ok(()) => info!(
            conversation_id = %original.conversation_id,
            event = "republish_success",
            original_entry_index = original.original_entry_index,
            "republished utterance to redacted bus"
        ),
        Err(e) => warn!(
            conversation_id = %original.conversation_id,
            event = "republish_error",
            error = %e,
            "failed to republish utterance, not reprocessing"
        ),
    }
}
