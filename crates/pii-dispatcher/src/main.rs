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
                .unwrap_or_else(|_| "pii_dispatcher=info,tower_http=info".into()),
        )
        .init();

    let config_path = std::env::var("PII_CONFIG").ok();
    let config = pii_core::config::PipelineConfig::load(config_path.as_deref())?;

    let redactor_base_url = std::env::var("REDACTOR_BASE_URL")
        .unwrap_or_else(|_| "http://localhost:8081".to_string());
    let redacted_bus_url = std::env::var("REDACTED_BUS_URL")
        .unwrap_or_else(|_| "http://localhost:8082/redacted-transcripts".to_string());
    let token_endpoint =
        std::env::var("IDENTITY_TOKEN_ENDPOINT").unwrap_or_else(|_| "http://localhost:8090/token".to_string());

    let bind = config.bind.clone();
    let port = config.port;
    let state = Arc::new(app::AppState::new(
        config,
        redactor_base_url,
        redacted_bus_url,
        token_endpoint,
    ));
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("pii-dispatcher listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
