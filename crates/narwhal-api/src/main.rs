//! Narwhal API server entry point.

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use narwhal_api::bootstrap::{app, bootstrap};
use narwhal_api::config::NarwhalConfig;
use narwhal_api::telemetry::Telemetry;
use narwhal_core::clock::SystemClock;
use narwhal_core::context::Context;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = NarwhalConfig::from_env()?;
    let telemetry = Telemetry::init(config.otlp_endpoint.as_deref())?;

    tracing::info!(exporting_spans = telemetry.exporting(), "Starting Narwhal API server");

    let state = bootstrap(&config, Arc::new(SystemClock)).await?;
    let background = state.start(&Context::background()).await?;

    let addr: SocketAddr = config
        .bind_address()
        .parse()
        .map_err(|e| format!("invalid HOST:PORT combination: {e}"))?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped, draining background work");
    background.shutdown(&state).await;
    telemetry.shutdown();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
