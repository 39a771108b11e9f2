mod analytics;
mod bootstrap;
mod health;
mod llm;
mod routes;
mod tool_backend;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use opsdesk_core::config::{AppConfig, LoadOptions};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    use opsdesk_core::config::LogFormat::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    let builder = tracing_subscriber::fmt().with_target(false).with_env_filter(filter);

    match config.logging.format {
        Compact => builder.compact().init(),
        Pretty => builder.pretty().init(),
        Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Logging must be up before bootstrap emits its first event.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let address: SocketAddr =
        format!("{}:{}", app.config.server.bind_address, app.config.server.port)
            .parse()
            .context("invalid server bind address")?;
    let listener =
        TcpListener::bind(address).await.with_context(|| format!("binding {address}"))?;
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        address = %address,
        tool_backend = app.tool_backend.as_deref().unwrap_or("disabled"),
        "opsdesk-server listening"
    );

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let router = app.router();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await
    });

    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        grace_secs = grace.as_secs(),
        "opsdesk-server stopping"
    );
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(grace, server).await {
        Ok(joined) => joined.context("server task panicked")?.context("server error")?,
        Err(_) => tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            "in-flight requests did not drain before the grace period ended"
        ),
    }

    app.db_pool.close().await;
    tracing::info!(event_name = "system.server.stopped", correlation_id = "shutdown", "opsdesk-server stopped");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
