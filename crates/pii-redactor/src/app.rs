use std::sync::Arc;

use pii_cache::KvCache;
use pii_core::auth::BearerTokenSource;
use pii_core::config::PipelineConfig;
use pii_detection::DetectionEngine;
use pii_templates::DetectionTemplates;

/// Shared state for the redactor process (§4.2, §5 "Shared clients").
pub struct AppState {
    pub config: PipelineConfig,
    pub templates: DetectionTemplates,
    pub cache: Arc<dyn KvCache>,
    pub detection_engine: Arc<dyn DetectionEngine>,
    pub bearer_token: String,
    /// Pins `dynamic_context_applied = false` unconditionally when a
    /// deployment disallows inline detection configs (§9 "Deliberately-
    /// left-ambiguous"). Defaults to `true`.
    pub allow_inline_configs: bool,
}

impl BearerTokenSource for Arc<AppState> {
    fn expected_bearer_token(&self) -> &str {
        &self.bearer_token
    }
}

pub fn build_router(state: Arc<AppState>) -> axum::Router {
    // §6 requires bearer-token auth on both redaction endpoints, but not on
    // `/health`; `route_layer` scopes the middleware to the routes already
    // registered on `protected`, so the probe stays open.
    let protected = axum::Router::new()
        .route(
            "/handle-agent-utterance",
            axum::routing::post(crate::handlers::handle_agent_utterance),
        )
        .route(
            "/handle-customer-utterance",
            axum::routing::post(crate::handlers::handle_customer_utterance),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            pii_core::auth::require_bearer_token::<Arc<AppState>>,
        ));

    axum::Router::new()
        .merge(protected)
        .route("/health", axum::routing::get(crate::handlers::health_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
