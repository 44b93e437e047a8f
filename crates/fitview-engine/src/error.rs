//! Error types for the Fitview engine binary.
//!
//! [`EngineError`] is the top-level error type that wraps every failure
//! mode during startup and serving.

/// Top-level error for the engine binary.
///
/// Each variant wraps a specific subsystem error, providing a single
/// error type that `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: fitview_core::config::ConfigError,
    },

    /// The HTTP server failed to bind or serve.
    #[error("server error: {source}")]
    Server {
        /// The underlying lifecycle error.
        #[from]
        source: fitview_server::LifecycleError,
    },
}
