//! HTTP listener lifecycle.
//!
//! The listener stops accepting on SIGINT or SIGTERM. Background tasks are
//! stopped only after in-flight requests have drained, so a PATCH that
//! completes a session during shutdown still gets its job enqueued.

use std::time::Instant;

use anyhow::{Context, Result};
use axum::Router;
use formdrop_core::Config;

use super::services::BackgroundTasks;

pub async fn start_server(config: &Config, app: Router, background: BackgroundTasks) -> Result<()> {
    let addr = format!("0.0.0.0:{}", config.server_port());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!(
        addr = %addr,
        upload_path = %config.upload_base_path(),
        max_upload_bytes = config.upload_max_size_bytes(),
        max_chunk_bytes = config.upload_max_chunk_size_bytes(),
        workers = config.job_queue_workers(),
        "Accepting uploads"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let signal = shutdown_signal().await;
            tracing::info!(signal, "Stopping listener");
        })
        .await?;

    let draining = Instant::now();
    background.shutdown().await;
    tracing::info!(
        drain_ms = draining.elapsed().as_millis() as u64,
        "Upload workers drained"
    );
    Ok(())
}

/// Name of the signal that requested shutdown.
///
/// # Panics
/// Panics if a signal handler cannot be installed.
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
