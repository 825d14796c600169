use std::sync::Arc;

use pii_core::config::PipelineConfig;

use crate::sink::AnalyticsSink;

/// Overall deadline for the long-running ingestion wait (§4.4 step 3:
/// "540-900s (default 900s)").
pub const DEFAULT_WAIT_DEADLINE_SECS: u64 = 900;
/// Poll interval when explicitly polling the operation resource (§4.4
/// step 3: "explicit poll ... at 10s intervals").
pub const POLL_INTERVAL_SECS: u64 = 10;

/// Shared state for the uploader process (§4.4, §5 "Shared clients").
pub struct AppState {
    pub config: PipelineConfig,
    pub sink: Arc<dyn AnalyticsSink>,
    pub wait_deadline_secs: u64,
}

pub fn build_router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/upload", axum::routing::post(crate::handlers::upload_handler))
        .route("/health", axum::routing::get(crate::handlers::health_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
