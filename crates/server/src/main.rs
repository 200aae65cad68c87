mod api;
mod bootstrap;
mod health;

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use steward_core::config::{AppConfig, LoadOptions, LogFormat};

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    let builder = tracing_subscriber::fmt().with_target(false).with_env_filter(filter);

    match config.logging.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Logging needs the loaded config, so it comes up before bootstrap.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let shutdown = CancellationToken::new();

    let router = health::router(app.db_pool.clone()).merge(api::router(api::ApiState::new(
        app.runner.clone(),
        app.registry.clone(),
        shutdown.clone(),
    )));

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind http listener on {address}"))?;

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        address = %address,
        "steward-server listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_shutdown(shutdown.clone()))
        .await
        .context("http server failed")?;

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "steward-server stopping"
    );

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    if tokio::time::timeout(grace, app.registry.close_all()).await.is_err() {
        tracing::warn!(
            event_name = "system.server.tool_shutdown_timeout",
            correlation_id = "shutdown",
            grace_secs = grace.as_secs(),
            "tool servers did not close within the grace period"
        );
    }
    app.db_pool.close().await;

    Ok(())
}

/// Resolves on ctrl-c or SIGTERM and cancels in-flight turns.
async fn wait_for_shutdown(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(event_name = "system.server.signal_error", error = %error, "ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(event_name = "system.server.signal_error", error = %error, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    shutdown.cancel();
}
