//! HTTP server lifecycle management.
//!
//! Provides [`start_server`], which binds to a TCP port and serves the
//! router until the given shutdown future resolves, and [`shutdown`],
//! which stops and joins any running fit.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use fitview_core::config::ServerSection;
use fitview_core::fit_thread::JoinOutcome;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::router::build_router;
use crate::state::ServerState;

/// Errors that can occur when starting or running the server.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// Failed to bind to the network address.
    #[error("bind error: {0}")]
    Bind(String),

    /// The server encountered a fatal error while serving.
    #[error("serve error: {0}")]
    Serve(String),
}

/// Bind to the configured address and serve until `signal` resolves.
///
/// # Errors
///
/// Returns an error if the address is invalid, the TCP listener cannot
/// bind, or the server encounters a fatal I/O error.
pub async fn start_server<F>(
    config: &ServerSection,
    state: Arc<ServerState>,
    signal: F,
) -> Result<(), LifecycleError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| LifecycleError::Bind(format!("invalid address: {e}")))?;

    let router = build_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| LifecycleError::Bind(format!("bind failed on {addr}: {e}")))?;

    info!(%addr, "Fitview server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| LifecycleError::Serve(format!("serve error: {e}")))?;

    Ok(())
}

/// Stop the running fit, if any, and wait for its thread within the
/// configured join timeout.
pub async fn shutdown(state: &ServerState) -> Option<JoinOutcome> {
    let job = state.fitting.lock().await.active.take()?;
    job.stop();
    let outcome = job.join(state.config.fit.join_timeout()).await;
    if outcome == JoinOutcome::Joined {
        info!("Fit thread stopped for shutdown");
    } else {
        warn!(?outcome, "Fit thread did not stop cleanly");
    }
    Some(outcome)
}
