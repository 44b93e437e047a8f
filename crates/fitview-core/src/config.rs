//! Configuration loading and typed config structures for the Fitview server.
//!
//! The canonical configuration lives in `fitview-config.yaml` next to the
//! binary's working directory. This module defines strongly-typed structs
//! that mirror the YAML structure, and provides a loader that reads the
//! file and applies environment overrides.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level server configuration.
///
/// Mirrors the structure of `fitview-config.yaml`. Every section is
/// optional and falls back to its defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FitviewConfig {
    /// Listen address.
    #[serde(default)]
    pub server: ServerSection,

    /// Fit worker cadences and timeouts.
    #[serde(default)]
    pub fit: FitConfig,

    /// Topic retention and broadcast sizing.
    #[serde(default)]
    pub topics: TopicConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FitviewConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override YAML values for the listen address:
    /// - `FITVIEW_HOST` overrides `server.host`
    /// - `FITVIEW_PORT` overrides `server.port`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yml::from_str(&contents)?;
        config.server.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yml::from_str(yaml)?;
        config.server.apply_env_overrides();
        Ok(config)
    }
}

/// Listen address configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerSection {
    /// Host address to bind (`127.0.0.1` for local-only access).
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ServerSection {
    /// Override the listen address with environment variables when set.
    ///
    /// An unparseable `FITVIEW_PORT` is ignored and the configured port
    /// is kept.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("FITVIEW_HOST") {
            self.host = val;
        }
        if let Some(port) = std::env::var("FITVIEW_PORT")
            .ok()
            .and_then(|val| val.parse().ok())
        {
            self.port = port;
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Fit worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FitConfig {
    /// Milliseconds between `progress` events (0 = every iteration).
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Seconds between intermediate `convergence_update` events.
    #[serde(default = "default_convergence_interval_secs")]
    pub convergence_interval_secs: u64,

    /// Seconds between intermediate `uncertainty_update` events.
    #[serde(default = "default_uncertainty_interval_secs")]
    pub uncertainty_interval_secs: u64,

    /// Milliseconds to wait for the worker thread to exit after its
    /// terminal event.
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

impl FitConfig {
    /// Interval between progress reports.
    pub const fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Interval between intermediate convergence reports.
    pub const fn convergence_interval(&self) -> Duration {
        Duration::from_secs(self.convergence_interval_secs)
    }

    /// Interval between intermediate uncertainty reports.
    pub const fn uncertainty_interval(&self) -> Duration {
        Duration::from_secs(self.uncertainty_interval_secs)
    }

    /// Bound on joining a finished worker thread.
    pub const fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval_ms(),
            convergence_interval_secs: default_convergence_interval_secs(),
            uncertainty_interval_secs: default_uncertainty_interval_secs(),
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

/// Topic store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TopicConfig {
    /// Maximum number of records retained per topic.
    #[serde(default = "default_retention")]
    pub retention: usize,

    /// Capacity of the broadcast channel feeding connected clients.
    ///
    /// A client that falls further behind than this skips ahead to the
    /// newest message.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

const fn default_port() -> u16 {
    8080
}

const fn default_progress_interval_ms() -> u64 {
    5000
}

const fn default_convergence_interval_secs() -> u64 {
    3600
}

const fn default_uncertainty_interval_secs() -> u64 {
    3600
}

const fn default_join_timeout_ms() -> u64 {
    1000
}

const fn default_retention() -> usize {
    100
}

const fn default_broadcast_capacity() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = FitviewConfig::default();
        assert_eq!(config.fit.progress_interval(), Duration::from_secs(5));
        assert_eq!(config.fit.convergence_interval(), Duration::from_secs(3600));
        assert_eq!(config.fit.join_timeout(), Duration::from_secs(1));
        assert_eq!(config.topics.retention, 100);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn parse_full_yaml() {
        let yaml = r#"
server:
  host: "0.0.0.0"
  port: 9090

fit:
  progress_interval_ms: 250
  convergence_interval_secs: 30
  uncertainty_interval_secs: 600
  join_timeout_ms: 2500

topics:
  retention: 10
  broadcast_capacity: 64

logging:
  level: "debug"
"#;

        let config = FitviewConfig::parse(yaml);
        assert!(config.is_ok());
        let config = config.ok().unwrap_or_default();

        assert_eq!(config.fit.progress_interval_ms, 250);
        assert_eq!(config.fit.convergence_interval_secs, 30);
        assert_eq!(config.fit.uncertainty_interval_secs, 600);
        assert_eq!(config.fit.join_timeout_ms, 2500);
        assert_eq!(config.topics.retention, 10);
        assert_eq!(config.topics.broadcast_capacity, 64);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn parse_minimal_yaml() {
        let yaml = "topics:\n  retention: 3\n";
        let config = FitviewConfig::parse(yaml);
        assert!(config.is_ok());
        let config = config.ok().unwrap_or_default();

        // Retention is overridden
        assert_eq!(config.topics.retention, 3);
        // Everything else uses defaults
        assert_eq!(config.topics.broadcast_capacity, 256);
        assert_eq!(config.fit.progress_interval_ms, 5000);
    }

    #[test]
    fn parse_empty_yaml() {
        let yaml = "";
        let config = FitviewConfig::parse(yaml);
        assert!(config.is_ok());
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let yaml = "fit: [unclosed";
        assert!(matches!(
            FitviewConfig::parse(yaml),
            Err(ConfigError::Yaml { .. })
        ));
    }

    #[test]
    fn load_project_config_file() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("fitview-config.yaml");
        if path.exists() {
            let config = FitviewConfig::from_file(&path);
            assert!(config.is_ok(), "Failed to load project config: {config:?}");
        }
    }
}
