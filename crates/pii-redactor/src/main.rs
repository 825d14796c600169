use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use pii_core::secret::{EnvSecretResolver, SecretResolver};

mod app;
mod handlers;

/// Secret ids for the Redis connection, carried over from the original
/// `main_service`'s `get_secret` lookups.
const REDIS_HOST_SECRET_ID: &str = "CONTEXT_MANAGER_REDIS_HOST";
const REDIS_PORT_SECRET_ID: &str = "CONTEXT_MANAGER_REDIS_PORT";
const DEFAULT_REDIS_PORT: &str = "6379";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pii_redactor=info,tower_http=info".into()),
        )
        .init();

    let config_path = std::env::var("PII_CONFIG").ok();
    let config = pii_core::config::PipelineConfig::load(config_path.as_deref())?;

    let secrets = EnvSecretResolver;
    let redis_host = secrets.resolve(REDIS_HOST_SECRET_ID).await?;
    let redis_port = secrets
        .resolve(REDIS_PORT_SECRET_ID)
        .await
        .unwrap_or_else(|_| DEFAULT_REDIS_PORT.to_string());
    let redis_url = format!("redis://{redis_host}:{redis_port}");
    let cache = Arc::new(pii_cache::RedisKvCache::open(&redis_url)?);

    let templates_path = std::env::var("DETECTION_TEMPLATES_PATH")
        .unwrap_or_else(|_| "config/detection_templates.yaml".to_string());
    let templates =
        pii_templates::DetectionTemplates::load_from_file(&templates_path, &config.google_cloud_project)?;

    let detection_engine_url = std::env::var("DETECTION_ENGINE_URL")
        .unwrap_or_else(|_| "http://localhost:8085/redact".to_string());
    let http_client = reqwest::Client::new();
    let detection_engine = Arc::new(pii_detection::HttpDetectionEngine::new(
        http_client,
        detection_engine_url,
    ));

    let bearer_token = std::env::var("REDACTOR_BEARER_TOKEN")
        .unwrap_or_else(|_| "dev-redactor-token".to_string());

    let allow_inline_configs = std::env::var("ALLOW_INLINE_DETECTION_CONFIGS")
        .map(|v| v != "false" && v != "0")
        .unwrap_or(true);

    let bind = config.bind.clone();
    let port = config.port;
    let state = Arc::new(app::AppState {
        config,
        templates,
        cache,
        detection_engine,
        bearer_token,
        allow_inline_configs,
    });
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("pii-redactor listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
