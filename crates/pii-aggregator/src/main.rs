use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

mod app;
mod handlers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pii_aggregator=info,tower_http=info".into()),
        )
        .init();

    let config_path = std::env::var("PII_CONFIG").ok();
    let config = pii_core::config::PipelineConfig::load(config_path.as_deref())?;

    let document_store_path =
        std::env::var("DOCUMENT_STORE_PATH").unwrap_or_else(|_| "pii-aggregator.sqlite".to_string());
    let conn = rusqlite::Connection::open(&document_store_path)?;
    let store = Arc::new(pii_store::SqliteDocumentStore::new(conn)?);

    let blob = Arc::new(pii_blob::S3BlobStore::from_env().await);

    #[cfg(feature = "streaming-buffer")]
    let cache: Option<Arc<dyn pii_cache::KvCache>> = match std::env::var("AGGREGATOR_REDIS_URL") {
        Ok(url) => Some(Arc::new(pii_cache::RedisKvCache::open(&url)?)),
        Err(_) => None,
    };
    #[cfg(feature = "streaming-buffer")]
    let redactor_base_url =
        std::env::var("REDACTOR_BASE_URL").unwrap_or_else(|_| "http://localhost:8081".to_string());

    let bind = config.bind.clone();
    let port = config.port;
    let state = Arc::new(app::AppState {
        config,
        store,
        blob,
        #[cfg(feature = "streaming-buffer")]
        cache,
        #[cfg(feature = "streaming-buffer")]
        http_client: reqwest::Client::new(),
        #[cfg(feature = "streaming-buffer")]
        redactor_base_url,
    });
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("pii-aggregator listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
