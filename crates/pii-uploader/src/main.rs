use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

mod app;
mod handlers;
mod sink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pii_uploader=info,tower_http=info".into()),
        )
        .init();

    let config_path = std::env::var("PII_CONFIG").ok();
    let config = pii_core::config::PipelineConfig::load(config_path.as_deref())?;

    let analytics_sink_url = std::env::var("ANALYTICS_SINK_URL")
        .unwrap_or_else(|_| "http://localhost:8095".to_string());
    let http_client = reqwest::Client::new();
    let sink = Arc::new(sink::HttpAnalyticsSink::new(http_client, analytics_sink_url));

    let wait_deadline_secs = std::env::var("ANALYTICS_UPLOAD_TIMEOUT_SECONDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(app::DEFAULT_WAIT_DEADLINE_SECS);

    let bind = config.bind.clone();
    let port = config.port;
    let state = Arc::new(app::AppState {
        config,
        sink,
        wait_deadline_secs,
    });
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("pii-uploader listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
