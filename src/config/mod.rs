//! Application configuration.
//!
//! Loaded from an optional YAML file and environment variables. The broker
//! endpoint is mandatory; a missing endpoint is reported as a
//! `ConfigError` for the composition root to act on.

mod messaging;

pub use messaging::MessagingConfig;

use serde::Deserialize;

/// Default configuration file name (extension optional).
pub const DEFAULT_CONFIG_FILE: &str = "ecom-events";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "ECOM_EVENTS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "ECOM_EVENTS";
/// Environment variable for the broker endpoint.
pub const ENDPOINT_ENV_VAR: &str = "RABBITMQ_ENDPOINT";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "ECOM_LOG";
/// Environment variable selecting the log format (`text` or `json`).
pub const LOG_FORMAT_ENV_VAR: &str = "ECOM_LOG_FORMAT";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("No broker endpoint configured; set RABBITMQ_ENDPOINT")]
    MissingEndpoint,
}

/// Identity of the service emitting events.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Stamped into every message's `app_id`.
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "ecom-events".to_string(),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub messaging: MessagingConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `ecom-events.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. `ENDPOINT_ENV_VAR` for the broker endpoint
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("messaging.endpoint", std::env::var(ENDPOINT_ENV_VAR).ok())?
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Broker endpoint, or `MissingEndpoint` when none was configured.
    pub fn endpoint(&self) -> Result<&str, ConfigError> {
        self.messaging
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or(ConfigError::MissingEndpoint)
    }
}
