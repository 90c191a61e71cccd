//! Binary entrypoint: env-driven config, tracing, HTTP server with
//! graceful shutdown.

use glm_proxy::config::ProxyConfig;
use glm_proxy::server::{app, AppState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ProxyConfig::from_env();
    if config.keys.is_empty() {
        tracing::warn!("GLM_KEYS is empty; every upstream attempt will fail");
    }
    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::build(config);
    state.spawn_background();

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, keys = state.store.len(), "glm-proxy listening");

    axum::serve(listener, app(state).into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, draining");
        })
        .await?;
    Ok(())
}
