//! `/redacted-transcripts`, `/conversation-ended` (§4.3).
//!
//! Grounded on `transcript_aggregator_service/main.py` for the polling and
//! skip/ignore semantics; persistence and retry wiring follow
//! `pii-store`/`pii-core::retry` directly.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::{info, warn};

use pii_core::extract::ShapeJson;
use pii_core::retry::with_standard_backoff;
use pii_core::types::{ArchivalArtifact, ArchivalEntry, LifecycleEvent, PersistedUtterance, Utterance};

use crate::app::AppState;

/// Last-N window kept by the streaming-buffer variant (§4.3 "LTRIM to the
/// last N (default 5)").
#[cfg(feature = "streaming-buffer")]
const UTTERANCE_WINDOW_SIZE: i64 = 5;

pub async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub async fn redacted_transcripts_handler(
    State(state): State<Arc<AppState>>,
    ShapeJson(utterance): ShapeJson<Utterance>,
) -> (StatusCode, Json<Value>) {
    if let Err(reason) = utterance.validate_shape() {
        warn!(event = "missing_fields_error", reason, "rejecting redacted utterance");
        return (StatusCode::BAD_REQUEST, Json(json!({"error": reason})));
    }

    let received_at = chrono::Utc::now().to_rfc3339();
    let persisted = PersistedUtterance {
        conversation_id: utterance.conversation_id.clone(),
        original_entry_index: utterance.original_entry_index,
        participant_role: utterance.participant_role.clone(),
        user_id: utterance.user_id.clone(),
        text: utterance.text.clone(),
        start_timestamp_usec: utterance.start_timestamp_usec,
        received_at,
    };

    let context_ttl_seconds = state.config.context_ttl_seconds;
    let now_unix = chrono::Utc::now().timestamp();

    let result = with_standard_backoff(
        || state.store.record_utterance(&persisted, context_ttl_seconds, now_unix),
        |e| e.is_retryable(),
    )
    .await;

    match result {
        Ok(root) => {
            info!(
                conversation_id = %utterance.conversation_id,
                event = "utterance_persisted",
                utterance_count = root.utterance_count,
                "persisted redacted utterance"
            );

            #[cfg(feature = "streaming-buffer")]
            buffer_utterance(&state, &utterance).await;

            (StatusCode::OK, Json(json!({"status": "ok"})))
        }
        Err(e) => {
            warn!(
                conversation_id = %utterance.conversation_id,
                event = "utterance_persist_error",
                error = %e,
                "failed to persist redacted utterance"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "failed to persist utterance"})),
            )
        }
    }
}

/// RPUSH the redacted utterance JSON, trim to the last N, refresh the list
/// TTL, then forward the combined last-N transcript to the Redactor's
/// customer endpoint for multi-turn context (§4.3 "Optional streaming
/// buffer"). Best-effort throughout: a KV or forwarding failure here must
/// never fail the per-utterance write that already succeeded.
#[cfg(feature = "streaming-buffer")]
async fn buffer_utterance(state: &AppState, utterance: &Utterance) {
    let Some(cache) = state.cache.as_ref() else {
        return;
    };
    let key = format!("utterances:{}", utterance.conversation_id);
    let payload = match serde_json::to_string(utterance) {
        Ok(p) => p,
        Err(_) => return,
    };
    if cache.rpush(&key, &payload).await.is_err() {
        return;
    }
    let _ = cache.ltrim(&key, -UTTERANCE_WINDOW_SIZE, -1).await;
    let _ = cache.expire(&key, state.config.context_ttl_seconds).await;

    let combined_transcript = match cache.lrange_all(&key).await {
        Ok(raw) => raw
            .iter()
            .filter_map(|entry| serde_json::from_str::<Utterance>(entry).ok())
            .map(|u| u.text)
            .collect::<Vec<_>>()
            .join(" "),
        Err(e) => {
            warn!(
                conversation_id = %utterance.conversation_id,
                event = "streaming_buffer_read_error",
                error = %e,
                "failed to read back buffered utterances, skipping forward"
            );
            return;
        }
    };

    let url = format!("{}/handle-customer-utterance", state.redactor_base_url);
    let body = json!({"conversation_id": utterance.conversation_id, "transcript": combined_transcript});
    match state.http_client.post(&url).json(&body).send().await {
        Ok(resp) if resp.status().is_success() => {
            info!(
                conversation_id = %utterance.conversation_id,
                event = "forward_to_redactor",
                "forwarded combined transcript to redactor for multi-turn context"
            );
        }
        Ok(resp) => warn!(
            conversation_id = %utterance.conversation_id,
            event = "forward_to_redactor_rejected",
            status = %resp.status(),
            "redactor rejected combined transcript forward"
        ),
        Err(e) => warn!(
            conversation_id = %utterance.conversation_id,
            event = "forward_to_redactor_error",
            error = %e,
            "failed to forward combined transcript to redactor"
        ),
    }
}

pub async fn conversation_ended_handler(
    State(state): State<Arc<AppState>>,
    ShapeJson(event): ShapeJson<LifecycleEvent>,
) -> (StatusCode, Json<Value>) {
    if event.conversation_id.trim().is_empty() {
        warn!(event = "missing_fields_error", "rejecting conversation-ended event");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing conversation_id"})),
        );
    }

    if !event.is_conversation_ended() {
        return (StatusCode::OK, Json(json!({"status": "ignored"})));
    }

    wait_for_utterances(&state, &event).await;

    let utterances = match state.store.list_utterances_ordered(&event.conversation_id).await {
        Ok(u) => u,
        Err(e) => {
            warn!(
                conversation_id = %event.conversation_id,
                event = "utterance_scan_error",
                error = %e,
                "failed to scan utterances for closing conversation"
            );
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "failed to scan utterances"})),
            );
        }
    };

    if utterances.is_empty() {
        warn!(
            conversation_id = %event.conversation_id,
            event = "empty_conversation_skipped",
            "no utterances persisted for conversation at close, skipping archival"
        );
        return (StatusCode::OK, Json(json!({"status": "skipped"})));
    }

    let entries: Vec<ArchivalEntry> = utterances
        .iter()
        .map(|u| ArchivalEntry {
            text: u.text.clone(),
            role: u.participant_role.clone(),
            user_id: u.user_id.clone(),
        })
        .collect();
    let artifact = ArchivalArtifact { entries };

    let body = match serde_json::to_vec(&artifact) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(
                conversation_id = %event.conversation_id,
                event = "artifact_serialize_error",
                error = %e,
                "failed to serialize archival artifact"
            );
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            );
        }
    };

    write_final_transcript_cache(&state, &event.conversation_id, &body).await;

    let key = format!("{}_transcript.json", event.conversation_id);
    let bucket = state.config.aggregated_transcripts_bucket.clone();

    let upload_result = with_standard_backoff(
        || {
            let body = body.clone();
            state.blob.put_object(&bucket, &key, body, "application/json")
        },
        |e| e.is_retryable(),
    )
    .await;

    match upload_result {
        Ok(()) => {
            info!(
                conversation_id = %event.conversation_id,
                event = "gcs_upload_success",
                "wrote archival transcript to blob store"
            );
            if let Err(e) = state.store.delete_conversation(&event.conversation_id).await {
                warn!(
                    conversation_id = %event.conversation_id,
                    event = "conversation_cleanup_error",
                    error = %e,
                    "failed to delete conversation after successful archival"
                );
            }
            (StatusCode::OK, Json(json!({"status": "archived"})))
        }
        Err(e) => {
            warn!(
                conversation_id = %event.conversation_id,
                event = "gcs_upload_error",
                error = %e,
                "failed to write archival transcript to blob store"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "failed to write archival transcript"})),
            )
        }
    }
}

/// Best-effort `final_transcript:<id>` cache write (§3 "Supplemented ...
/// additive caching"). Its absence must never block the blob write, so
/// every failure here is swallowed after a warning.
async fn write_final_transcript_cache(state: &AppState, conversation_id: &str, body: &[u8]) {
    #[cfg(feature = "streaming-buffer")]
    {
        let Some(cache) = state.cache.as_ref() else {
            return;
        };
        let Ok(text) = std::str::from_utf8(body) else {
            return;
        };
        let ttl = state.config.archival_ttl_seconds.max(0) as u64;
        if let Err(e) = cache
            .set_ex(&format!("final_transcript:{conversation_id}"), text, ttl)
            .await
        {
            warn!(
                conversation_id = %conversation_id,
                event = "final_transcript_cache_error",
                error = %e,
                "failed to write final_transcript cache entry"
            );
        }
    }
    #[cfg(not(feature = "streaming-buffer"))]
    {
        let _ = (state, conversation_id, body);
    }
}

/// Polls the conversation root until the persisted count reaches
/// `total_utterance_count`, or applies a fixed settling delay absent a
/// supplied total (§4.3 "Wait for utterances").
async fn wait_for_utterances(state: &AppState, event: &LifecycleEvent) {
    let Some(expected) = event.total_utterance_count else {
        tokio::time::sleep(std::time::Duration::from_secs(state.config.aggregation_delay_seconds)).await;
        return;
    };

    let mut last_count = 0u64;
    for attempt in 1..=state.config.max_polling_attempts {
        match state.store.get_conversation_root(&event.conversation_id).await {
            Ok(Some(root)) => {
                last_count = root.utterance_count;
                if root.utterance_count >= expected {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    conversation_id = %event.conversation_id,
                    event = "conversation_root_read_error",
                    error = %e,
                    "failed to read conversation root while polling"
                );
            }
        }

        if attempt < state.config.max_polling_attempts {
            tokio::time::sleep(std::time::Duration::from_secs(state.config.polling_interval_seconds)).await;
        }
    }

    if last_count < expected {
        warn!(
            conversation_id = %event.conversation_id,
            event = "partial_utterances",
            persisted = last_count,
            expected,
            "conversation closed before all utterances were received, proceeding with partial transcript"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use pii_blob::fake::FakeBlobStore;
    use pii_store::SqliteDocumentStore;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState {
            config: pii_core::config::PipelineConfig {
                google_cloud_project: "proj".into(),
                location: "us-central1".into(),
                context_ttl_seconds: 90,
                polling_interval_seconds: 0,
                max_polling_attempts: 2,
                aggregation_delay_seconds: 0,
                aggregated_transcripts_bucket: "test-bucket".into(),
                frontend_url: None,
                archival_ttl_seconds: 3600,
                bind: "0.0.0.0".into(),
                port: 8082,
            },
            store: Arc::new(SqliteDocumentStore::open_in_memory().unwrap()),
            blob: Arc::new(FakeBlobStore::new()),
            #[cfg(feature = "streaming-buffer")]
            cache: None,
            #[cfg(feature = "streaming-buffer")]
            http_client: reqwest::Client::new(),
            #[cfg(feature = "streaming-buffer")]
            redactor_base_url: "http://localhost:8081".into(),
        })
    }

    fn utterance_body(conversation_id: &str, index: u64, text: &str) -> Value {
        json!({
            "conversation_id": conversation_id,
            "original_entry_index": index,
            "participant_role": "END_USER",
            "text": text,
            "start_timestamp_usec": 1_000_000 + index as i64,
        })
    }

    #[tokio::test]
    async fn redelivered_utterance_is_idempotent() {
        let state = test_state();
        let router = crate::app::build_router(state.clone());

        for _ in 0..2 {
            let response = router
                .clone()
                .oneshot(
                    Request::post("/redacted-transcripts")
                        .header("content-type", "application/json")
                        .body(Body::from(utterance_body("c1", 0, "hello").to_string()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let root = state.store.get_conversation_root("c1").await.unwrap().unwrap();
        assert_eq!(root.utterance_count, 1);
    }

    #[tokio::test]
    async fn missing_fields_are_rejected() {
        let state = test_state();
        let router = crate::app::build_router(state);

        let body = json!({"text": "hi"});
        let response = router
            .oneshot(
                Request::post("/redacted-transcripts")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn conversation_ended_ignores_non_matching_event_type() {
        let state = test_state();
        let router = crate::app::build_router(state);

        let body = json!({"conversation_id": "c2", "event_type": "conversation_started"});
        let response = router
            .oneshot(
                Request::post("/conversation-ended")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["status"], json!("ignored"));
    }

    #[tokio::test]
    async fn conversation_ended_with_no_utterances_is_skipped() {
        let state = test_state();
        let router = crate::app::build_router(state);

        let body = json!({"conversation_id": "c3", "event_type": "conversation_ended"});
        let response = router
            .oneshot(
                Request::post("/conversation-ended")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["status"], json!("skipped"));
    }

    #[tokio::test]
    async fn conversation_ended_archives_in_index_order() {
        let state = test_state();
        let router = crate::app::build_router(state.clone());

        for (idx, text) in [(1, "second"), (0, "first")] {
            let response = router
                .clone()
                .oneshot(
                    Request::post("/redacted-transcripts")
                        .header("content-type", "application/json")
                        .body(Body::from(utterance_body("c4", idx, text).to_string()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let body = json!({"conversation_id": "c4", "event_type": "conversation_ended"});
        let response = router
            .clone()
            .oneshot(
                Request::post("/conversation-ended")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stored = state.blob.get_object("test-bucket", "c4_transcript.json").await.unwrap();
        let artifact: ArchivalArtifact = serde_json::from_slice(&stored).unwrap();
        assert_eq!(artifact.entries.len(), 2);
        assert_eq!(artifact.entries[0].text, "first");
        assert_eq!(artifact.entries[1].text, "second");

        assert!(state.store.get_conversation_root("c4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conversation_ended_proceeds_with_partial_utterances_after_polling_exhausted() {
        let state = test_state();
        let router = crate::app::build_router(state.clone());

        let response = router
            .clone()
            .oneshot(
                Request::post("/redacted-transcripts")
                    .header("content-type", "application/json")
                    .body(Body::from(utterance_body("c5", 0, "only one").to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json!({"conversation_id": "c5", "event_type": "conversation_ended", "total_utterance_count": 5});
        let response = router
            .oneshot(
                Request::post("/conversation-ended")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stored = state.blob.get_object("test-bucket", "c5_transcript.json").await.unwrap();
        let artifact: ArchivalArtifact = serde_json::from_slice(&stored).unwrap();
        assert_eq!(artifact.entries.len(), 1);
    }

    #[cfg(feature = "streaming-buffer")]
    #[tokio::test]
    async fn streaming_buffer_forwards_combined_transcript_to_redactor() {
        use axum::extract::State as AxumState;
        use pii_cache::fake::FakeKvCache;
        use std::sync::Mutex as StdMutex;

        struct Received(StdMutex<Vec<Value>>);

        async fn capture(
            AxumState(received): AxumState<Arc<Received>>,
            Json(body): Json<Value>,
        ) -> StatusCode {
            received.0.lock().unwrap().push(body);
            StatusCode::OK
        }

        let received = Arc::new(Received(StdMutex::new(Vec::new())));
        let fake_router = axum::Router::new()
            .route("/handle-customer-utterance", axum::routing::post(capture))
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, fake_router).await.unwrap() });

        let mut state = test_state();
        Arc::get_mut(&mut state).unwrap().cache = Some(Arc::new(FakeKvCache::new()));
        Arc::get_mut(&mut state).unwrap().redactor_base_url = format!("http://{addr}");
        let router = crate::app::build_router(state);

        for (idx, text) in [(0, "hello"), (1, "world")] {
            let response = router
                .clone()
                .oneshot(
                    Request::post("/redacted-transcripts")
                        .header("content-type", "application/json")
                        .body(Body::from(utterance_body("c6", idx, text).to_string()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let calls = received.0.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1]["transcript"], json!("hello world"));
    }
}
