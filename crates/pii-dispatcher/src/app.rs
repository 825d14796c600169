use std::sync::Arc;

use pii_bus::{BusPublisher, HttpBusPublisher};
use pii_core::config::PipelineConfig;
use pii_identity::{HttpIdentityMinter, IdentityMinter, IdentityTokenCache};

/// Shared state for the dispatcher process (§4.1, §5 "Shared clients").
///
/// Generic over the identity minter so tests can swap in a fake minter
/// without standing up a real token-issuing endpoint; production wiring
/// always instantiates `AppState<HttpIdentityMinter>`.
pub struct AppState<M: IdentityMinter = HttpIdentityMinter> {
    pub config: PipelineConfig,
    pub http_client: reqwest::Client,
    pub identity_cache: IdentityTokenCache<M>,
    pub bus_publisher: Arc<dyn BusPublisher>,
    pub redactor_base_url: String,
    pub redacted_bus_url: String,
}

impl AppState<HttpIdentityMinter> {
    pub fn new(
        config: PipelineConfig,
        redactor_base_url: String,
        redacted_bus_url: String,
        token_endpoint: String,
    ) -> Self {
        let http_client = reqwest::Client::new();
        let minter = HttpIdentityMinter::new(http_client.clone(), token_endpoint);
        let identity_cache = IdentityTokenCache::new(minter, config.context_ttl_seconds as i64);
        Self {
            bus_publisher: Arc::new(HttpBusPublisher::new(http_client.clone())),
            config,
            http_client,
            identity_cache,
            redactor_base_url,
            redacted_bus_url,
        }
    }
}

pub fn build_router<M: IdentityMinter + 'static>(state: Arc<AppState<M>>) -> axum::Router {
    axum::Router::new()
        .route("/ingest", axum::routing::post(crate::handlers::ingest_handler::<M>))
        .route("/health", axum::routing::get(crate::handlers::health_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
