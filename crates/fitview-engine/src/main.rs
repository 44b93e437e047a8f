//! Fitview engine binary.
//!
//! Loads configuration, initializes logging, bootstraps the shared server
//! state with the built-in fitters and serves HTTP plus `WebSocket`
//! clients until Ctrl-C. On shutdown any running fit is stopped and its
//! worker thread joined.
//!
//! Configuration comes from the file named by `FITVIEW_CONFIG`, falling
//! back to `fitview-config.yaml` in the working directory, and finally to
//! built-in defaults.

mod error;

use std::path::PathBuf;
use std::sync::Arc;

use fitview_core::config::FitviewConfig;
use fitview_core::fitters::FitterRegistry;
use fitview_server::ServerState;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;

/// Config file used when `FITVIEW_CONFIG` is not set.
const DEFAULT_CONFIG_PATH: &str = "fitview-config.yaml";

/// Where the configuration was read from, reported once logging is up.
enum ConfigSource {
    File(PathBuf),
    Defaults(PathBuf),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), EngineError> {
    // Logging needs the configured level, so the config is read first and
    // its origin logged afterwards.
    let (config, source) = load_config()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    match &source {
        ConfigSource::File(path) => info!(path = %path.display(), "Loaded config"),
        ConfigSource::Defaults(path) => {
            info!(path = %path.display(), "Config file not found, using defaults");
        }
    }

    info!(
        host = %config.server.host,
        port = config.server.port,
        progress_interval_ms = config.fit.progress_interval_ms,
        retention = config.topics.retention,
        "Fitview engine starting"
    );

    let state = ServerState::bootstrap(config, FitterRegistry::builtin());

    fitview_server::start_server(&state.config.server, Arc::clone(&state), shutdown_signal())
        .await?;

    info!("Shutdown requested");
    if fitview_server::shutdown(&state).await.is_none() {
        info!("No fit running at shutdown");
    }
    info!("Fitview engine stopped");

    Ok(())
}

/// Resolve and load the configuration file.
fn load_config() -> Result<(FitviewConfig, ConfigSource), EngineError> {
    let path = std::env::var_os("FITVIEW_CONFIG")
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);

    if path.exists() {
        let config = FitviewConfig::from_file(&path)?;
        Ok((config, ConfigSource::File(path)))
    } else {
        let mut config = FitviewConfig::default();
        config.server.apply_env_overrides();
        Ok((config, ConfigSource::Defaults(path)))
    }
}

/// Resolves on Ctrl-C. If the handler cannot be installed the server
/// keeps running until killed.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
