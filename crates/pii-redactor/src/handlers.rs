//! `/handle-agent-utterance`, `/handle-customer-utterance` (§4.2).
//!
//! Grounded on `main_service/main.py`'s `handle_agent_utterance` /
//! `handle_customer_utterance` — missing-field shape checks, the Redis
//! context round-trip, and the "never fail the customer endpoint" rule for
//! detection-engine errors all carry over unchanged.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use pii_core::types::RedactionContext;
use pii_detection::{build_detection_request, DetectionEngineError};

use crate::app::AppState;

pub async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
pub struct UtteranceTranscriptRequest {
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub transcript: String,
}

impl UtteranceTranscriptRequest {
    fn validate(&self) -> Result<(), &'static str> {
        if self.conversation_id.trim().is_empty() {
            return Err("missing conversation_id");
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct AgentUtteranceResponse {
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected_pii: Option<String>,
}

/// `context:<conversation_id>` KV key (§3, §4.2).
fn context_key(conversation_id: &str) -> String {
    format!("context:{conversation_id}")
}

pub async fn handle_agent_utterance(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UtteranceTranscriptRequest>,
) -> (StatusCode, Json<Value>) {
    if let Err(reason) = body.validate() {
        warn!(event = "missing_fields_error", reason, "rejecting agent utterance");
        return (StatusCode::BAD_REQUEST, Json(json!({"error": reason})));
    }

    let expected_pii_type = state.templates.match_expected_pii_type(&body.transcript);

    let Some(pii_type) = expected_pii_type else {
        return (
            StatusCode::OK,
            Json(json!(AgentUtteranceResponse {
                message: "agent utterance processed, no specific PII context to store",
                expected_pii: None,
            })),
        );
    };

    let now = chrono::Utc::now();
    let context = RedactionContext::new(pii_type, now.timestamp_millis() as f64 / 1000.0);
    let serialized = match serde_json::to_string(&context) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(
                conversation_id = %body.conversation_id,
                event = "context_serialize_error",
                error = %e,
                "failed to serialize redaction context"
            );
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            );
        }
    };

    match state
        .cache
        .set_ex(
            &context_key(&body.conversation_id),
            &serialized,
            state.config.context_ttl_seconds,
        )
        .await
    {
        Ok(()) => {
            info!(
                conversation_id = %body.conversation_id,
                event = "context_armed",
                expected_pii_type = pii_type,
                "stored redaction context"
            );
            (
                StatusCode::OK,
                Json(json!(AgentUtteranceResponse {
                    message: "agent utterance processed, context stored",
                    expected_pii: Some(pii_type.to_string()),
                })),
            )
        }
        Err(e) => {
            warn!(
                conversation_id = %body.conversation_id,
                event = "context_store_error",
                error = %e,
                "failed to store redaction context in KV"
            );
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "failed to store context"})),
            )
        }
    }
}

pub async fn handle_customer_utterance(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UtteranceTranscriptRequest>,
) -> (StatusCode, Json<Value>) {
    if let Err(reason) = body.validate() {
        warn!(event = "missing_fields_error", reason, "rejecting customer utterance");
        return (StatusCode::BAD_REQUEST, Json(json!({"error": reason})));
    }

    // Absence is not an error (§3 "absence MUST NOT raise an error"); a
    // decode failure of a stale/foreign value degrades the same way (§7.7).
    let context: Option<RedactionContext> = match state.cache.get(&context_key(&body.conversation_id)).await {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                warn!(
                    conversation_id = %body.conversation_id,
                    event = "context_decode_error",
                    error = %e,
                    "failed to decode stored redaction context, treating as absent"
                );
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!(
                conversation_id = %body.conversation_id,
                event = "context_read_error",
                error = %e,
                "failed to read redaction context, treating as absent"
            );
            None
        }
    };

    let parent = state.config.parent_scope();
    let (request, dynamic_context_applied) = build_detection_request(
        &parent,
        &body.transcript,
        context.as_ref(),
        &state.templates,
        state.allow_inline_configs,
    );

    let redacted_transcript = match state.detection_engine.redact(&request).await {
        Ok(redacted) => redacted,
        Err(DetectionEngineError::TemplateNotFound) => {
            warn!(
                conversation_id = %body.conversation_id,
                event = "dlp_template_not_found_retry",
                "inspect template not found, retrying with a fully inline request"
            );
            let fallback_request = request.into_fully_inline(&state.templates);
            match state.detection_engine.redact(&fallback_request).await {
                Ok(redacted) => redacted,
                Err(e) => tagged_fallback(&body.conversation_id, &e, &body.transcript),
            }
        }
        Err(e) => tagged_fallback(&body.conversation_id, &e, &body.transcript),
    };

    (
        StatusCode::OK,
        Json(json!({
            "redacted_transcript": redacted_transcript,
            // True only when a stored context was both present and actually
            // merged into the inline inspect config. This narrows the
            // original's `retrieved_context is not None` (true whenever a
            // context was found in Redis, merged or not) — when
            // `allow_inline_configs` is false, `context_used` is pinned to
            // `false` here even if a context was retrieved, since nothing
            // was applied to the request.
            "context_used": dynamic_context_applied,
        })),
    )
}

/// Detection-engine errors never fail the customer endpoint (§4.2 step 3,
/// §7.4) — they degrade to the transcript prefixed with a `[…_ERROR]` tag.
fn tagged_fallback(conversation_id: &str, error: &DetectionEngineError, transcript: &str) -> String {
    warn!(
        conversation_id = %conversation_id,
        event = "dlp_call_error",
        error_tag = error.error_tag(),
        error = %error,
        "detection engine call failed, returning tagged transcript"
    );
    format!("[{}] {}", error.error_tag(), transcript)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use pii_cache::fake::FakeKvCache;
    use pii_detection::DetectionRequest;
    use tower::ServiceExt;

    struct StubEngine {
        result: std::sync::Mutex<Option<Result<String, DetectionEngineError>>>,
        fallback_result: std::sync::Mutex<Option<Result<String, DetectionEngineError>>>,
    }

    #[async_trait::async_trait]
    impl pii_detection::DetectionEngine for StubEngine {
        async fn redact(&self, request: &DetectionRequest) -> Result<String, DetectionEngineError> {
            if request.inspect_template_name.is_none() && request.inspect_config.is_some() && request.deidentify_config.is_some() {
                if let Some(fallback) = self.fallback_result.lock().unwrap().take() {
                    return fallback;
                }
            }
            self.result
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Ok(format!("[redacted] {}", request.item)))
        }
    }

    const SAMPLE_TEMPLATE: &str = r#"
dlp_location: global
dlp_templates:
  inspect_template_name: null
  deidentify_template_name: null
inspect_config:
  info_types:
    - name: EMAIL_ADDRESS
  min_likelihood: POSSIBLE
deidentify_config:
  replace_with_info_type_config: {}
context_keywords:
  PHONE_NUMBER: ["phone number"]
  US_SOCIAL_SECURITY_NUMBER: ["ssn"]
"#;

    fn test_state(engine: StubEngine) -> Arc<AppState> {
        let templates = pii_templates::DetectionTemplates::load_from_str(SAMPLE_TEMPLATE, "proj").unwrap();
        Arc::new(AppState {
            config: pii_core::config::PipelineConfig {
                google_cloud_project: "proj".into(),
                location: "us-central1".into(),
                context_ttl_seconds: 90,
                polling_interval_seconds: 5,
                max_polling_attempts: 12,
                aggregation_delay_seconds: 15,
                aggregated_transcripts_bucket: String::new(),
                frontend_url: None,
                archival_ttl_seconds: 3600,
                bind: "0.0.0.0".into(),
                port: 8081,
            },
            templates,
            cache: Arc::new(FakeKvCache::new()),
            detection_engine: Arc::new(engine),
            bearer_token: "test-token".into(),
            allow_inline_configs: true,
        })
    }

    fn empty_engine() -> StubEngine {
        StubEngine {
            result: std::sync::Mutex::new(None),
            fallback_result: std::sync::Mutex::new(None),
        }
    }

    #[tokio::test]
    async fn agent_utterance_with_keyword_arms_context() {
        let state = test_state(empty_engine());
        let router = crate::app::build_router(state.clone());

        let body = json!({"conversation_id": "c1", "transcript": "Could you share your phone number?"});
        let response = router
            .oneshot(
                Request::post("/handle-agent-utterance")
                    .header("authorization", "Bearer test-token")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let cached = state.cache.get("context:c1").await.unwrap().unwrap();
        let context: RedactionContext = serde_json::from_str(&cached).unwrap();
        assert_eq!(context.expected_pii_type, "PHONE_NUMBER");
    }

    #[tokio::test]
    async fn agent_utterance_without_keyword_is_a_no_op() {
        let state = test_state(empty_engine());
        let router = crate::app::build_router(state.clone());

        let body = json!({"conversation_id": "c2", "transcript": "How's your day going?"});
        let response = router
            .oneshot(
                Request::post("/handle-agent-utterance")
                    .header("authorization", "Bearer test-token")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.cache.get("context:c2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_conversation_id_is_rejected() {
        let state = test_state(empty_engine());
        let router = crate::app::build_router(state);

        let body = json!({"transcript": "hello"});
        let response = router
            .oneshot(
                Request::post("/handle-agent-utterance")
                    .header("authorization", "Bearer test-token")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn requests_without_bearer_token_are_rejected() {
        let state = test_state(empty_engine());
        let router = crate::app::build_router(state);

        let body = json!({"conversation_id": "c1", "transcript": "hi"});
        let response = router
            .oneshot(
                Request::post("/handle-agent-utterance")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn customer_utterance_without_context_does_not_apply_dynamic_context() {
        let state = test_state(empty_engine());
        let router = crate::app::build_router(state);

        let body = json!({"conversation_id": "c3", "transcript": "My email is alice@example.com"});
        let response = router
            .oneshot(
                Request::post("/handle-customer-utterance")
                    .header("authorization", "Bearer test-token")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["context_used"], json!(false));
    }

    #[tokio::test]
    async fn empty_transcript_redacts_to_empty_string() {
        let state = test_state(StubEngine {
            result: std::sync::Mutex::new(Some(Ok(String::new()))),
            fallback_result: std::sync::Mutex::new(None),
        });
        let router = crate::app::build_router(state);

        let body = json!({"conversation_id": "c4", "transcript": ""});
        let response = router
            .oneshot(
                Request::post("/handle-customer-utterance")
                    .header("authorization", "Bearer test-token")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["redacted_transcript"], json!(""));
    }

    #[tokio::test]
    async fn template_not_found_falls_back_to_inline_request() {
        let state = test_state(StubEngine {
            result: std::sync::Mutex::new(Some(Err(DetectionEngineError::TemplateNotFound))),
            fallback_result: std::sync::Mutex::new(Some(Ok("fallback redacted".to_string()))),
        });
        let router = crate::app::build_router(state);

        let body = json!({"conversation_id": "c5", "transcript": "hello there"});
        let response = router
            .oneshot(
                Request::post("/handle-customer-utterance")
                    .header("authorization", "Bearer test-token")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["redacted_transcript"], json!("fallback redacted"));
    }

    #[tokio::test]
    async fn permission_denied_returns_tagged_placeholder() {
        let state = test_state(StubEngine {
            result: std::sync::Mutex::new(Some(Err(DetectionEngineError::PermissionDenied))),
            fallback_result: std::sync::Mutex::new(None),
        });
        let router = crate::app::build_router(state);

        let body = json!({"conversation_id": "c6", "transcript": "hello there"});
        let response = router
            .oneshot(
                Request::post("/handle-customer-utterance")
                    .header("authorization", "Bearer test-token")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        let redacted = parsed["redacted_transcript"].as_str().unwrap();
        assert!(redacted.starts_with("[DLP_PERMISSION_DENIED_ERROR]"));
    }
}
