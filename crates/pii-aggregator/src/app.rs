use std::sync::Arc;

use pii_blob::BlobStore;
use pii_core::config::PipelineConfig;
use pii_store::DocumentStore;

/// Shared state for the aggregator process (§4.3, §5 "Shared clients").
pub struct AppState {
    pub config: PipelineConfig,
    pub store: Arc<dyn DocumentStore>,
    pub blob: Arc<dyn BlobStore>,
    /// Optional `final_transcript:<id>` cache write-through (§3
    /// "Supplemented ... additive caching") and the streaming-buffer
    /// variant's utterance list (§4.3 "Optional streaming buffer"). `None`
    /// when the deployment has no KV client configured; both features
    /// degrade gracefully without it.
    #[cfg(feature = "streaming-buffer")]
    pub cache: Option<Arc<dyn pii_cache::KvCache>>,
    /// Where the streaming-buffer variant forwards the combined last-N
    /// transcript for multi-turn context (spec §4.3 "Optional streaming
    /// buffer"). Unused with the feature off.
    #[cfg(feature = "streaming-buffer")]
    pub http_client: reqwest::Client,
    #[cfg(feature = "streaming-buffer")]
    pub redactor_base_url: String,
}

pub fn build_router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route(
            "/redacted-transcripts",
            axum::routing::post(crate::handlers::redacted_transcripts_handler),
        )
        .route(
            "/conversation-ended",
            axum::routing::post(crate::handlers::conversation_ended_handler),
        )
        .route("/health", axum::routing::get(crate::handlers::health_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
