//! Configuration Module
//!
//! Provides TOML-based configuration for floorlink with support for:
//! - Logging level
//! - Health endpoint and shutdown drain window
//! - MQTT and Kafka connections
//! - PostgreSQL connection
//! - Bridge topic layout, retry queues and loop timings
//! - Ingest topic, transaction deadlines and putback policy
//! - Environment variable overrides (FLOORLINK__* prefix)
//!
//! Configuration is read once at startup and never reloaded.

use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

pub use bridge::{BridgeConfig, QueueConfig};
pub use health::{HealthConfig, LifecycleConfig};
pub use store::{IngestConfig, PostgresConfig};
pub use transport::{KafkaConfig, MqttConfig, MqttProtocol};

mod bridge;
mod health;
mod store;
mod transport;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("static regex");
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

#[cfg(test)]
mod tests;

/// Long-running loops counted as workers next to dispatched tasks:
/// the four bridge loops and the ingest loop
pub const LOOP_WORKERS: usize = 5;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// Config crate error
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Health endpoint
    pub health: HealthConfig,
    /// Shutdown behaviour
    pub lifecycle: LifecycleConfig,
    /// Device transport
    pub mqtt: MqttConfig,
    /// Durable broker
    pub kafka: KafkaConfig,
    /// Relational store
    pub postgres: PostgresConfig,
    /// MQTT <-> Kafka bridge
    pub bridge: BridgeConfig,
    /// Kafka -> PostgreSQL ingest
    pub ingest: IngestConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `FLOORLINK__` prefix with double underscores for nesting:
    ///    - `FLOORLINK__POSTGRES__HOST=db.internal` overrides `postgres.host`
    ///    - `FLOORLINK__KAFKA__BOOTSTRAP_SERVERS=kafka:9092` overrides `kafka.bootstrap_servers`
    ///    - `FLOORLINK__INGEST__DRY_RUN=true` overrides `ingest.dry_run`
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("postgres.host", "db")?
            .set_default("postgres.port", 5432)?
            .set_default("ingest.dry_run", false)?;

        let path = path.as_ref();
        if !path.as_os_str().is_empty() {
            match std::fs::read_to_string(path) {
                Ok(content) => {
                    let substituted = substitute_env_vars(&content);
                    builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ConfigError::Io(e)),
            }
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("FLOORLINK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only.
    ///
    /// Useful for containerized deployments where all config comes from env vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.qos > 2 {
            return Err(ConfigError::Validation(
                "mqtt.qos must be 0, 1, or 2".to_string(),
            ));
        }

        let prefix = &self.bridge.topic_prefix;
        if prefix.is_empty()
            || !prefix
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(ConfigError::Validation(format!(
                "bridge.topic_prefix '{}' must be a single level of [A-Za-z0-9_-]",
                prefix
            )));
        }

        if self.bridge.mqtt_listen_topic.is_empty() {
            return Err(ConfigError::Validation(
                "bridge.mqtt_listen_topic cannot be empty".to_string(),
            ));
        }

        if matches!(self.bridge.kafka_listen_topic.as_deref(), Some("")) {
            return Err(ConfigError::Validation(
                "bridge.kafka_listen_topic cannot be empty when set".to_string(),
            ));
        }

        if self.bridge.max_in_flight == 0 {
            return Err(ConfigError::Validation(
                "bridge.max_in_flight must be at least 1".to_string(),
            ));
        }

        if self.ingest.topic.is_empty() {
            return Err(ConfigError::Validation(
                "ingest.topic cannot be empty".to_string(),
            ));
        }

        if !self.ingest.topic_matches_prefix(prefix) {
            return Err(ConfigError::Validation(format!(
                "ingest.topic '{}' is not under bridge.topic_prefix '{}' (expected e.g. '{}')",
                self.ingest.topic,
                prefix,
                IngestConfig::default_topic(prefix)
            )));
        }

        if self.ingest.transaction_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "ingest.transaction_timeout must be greater than zero".to_string(),
            ));
        }

        if self.ingest.putback_backoff > self.ingest.max_putback_backoff {
            return Err(ConfigError::Validation(
                "ingest.putback_backoff cannot exceed ingest.max_putback_backoff".to_string(),
            ));
        }

        // Every dispatched task holds a worker slot
        if self.health.enabled
            && self.bridge.max_in_flight + LOOP_WORKERS > self.health.max_workers
        {
            return Err(ConfigError::Validation(format!(
                "bridge.max_in_flight ({}) plus {} service loops exceeds health.max_workers ({})",
                self.bridge.max_in_flight, LOOP_WORKERS, self.health.max_workers
            )));
        }

        if self.postgres.max_connections == 0 {
            return Err(ConfigError::Validation(
                "postgres.max_connections must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
