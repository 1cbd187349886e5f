//! Store and ingest configuration

use std::time::Duration;

use serde::Deserialize;

/// PostgreSQL connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    /// Pool size
    pub max_connections: u32,
    /// Timeout for establishing the initial connection
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "db".to_string(),
            port: 5432,
            user: "factoryinsight".to_string(),
            password: None,
            database: "factoryinsight".to_string(),
            max_connections: 10,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Kafka -> PostgreSQL ingest configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Kafka topic or `^`-prefixed regex carrying domain messages
    pub topic: String,

    /// Consumer group
    pub group_id: String,

    /// Perform every write but roll back instead of committing
    pub dry_run: bool,

    /// Deadline applied separately to transaction begin, prepare and execute
    #[serde(with = "humantime_serde")]
    pub transaction_timeout: Duration,

    /// Broker consume timeout
    #[serde(with = "humantime_serde")]
    pub consume_timeout: Duration,

    /// Back-off after consume errors
    #[serde(with = "humantime_serde")]
    pub error_backoff: Duration,

    /// First wait before redelivering a put-back message
    #[serde(with = "humantime_serde")]
    pub putback_backoff: Duration,

    /// Upper bound for the doubling put-back wait
    #[serde(with = "humantime_serde")]
    pub max_putback_backoff: Duration,

    /// Discard a message after this many consecutive putbacks (0 = never)
    pub max_putback_attempts: u32,
}

impl IngestConfig {
    /// Regex matching every domain topic the ingest handlers know under `prefix`
    pub fn default_topic(prefix: &str) -> String {
        format!(
            r"^{}\.[^.]+\.[^.]+\.[^.]+\.(count|uniqueProduct|scrapUniqueProduct|state)$",
            regex::escape(prefix)
        )
    }

    /// Whether the topic (literal or `^` regex) lives under `prefix`
    pub fn topic_matches_prefix(&self, prefix: &str) -> bool {
        match self.topic.strip_prefix('^') {
            Some(pattern) => pattern.starts_with(&format!(r"{}\.", regex::escape(prefix))),
            None => self.topic.starts_with(&format!("{}.", prefix)),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            topic: Self::default_topic("ia"),
            group_id: "floorlink-ingest".to_string(),
            dry_run: false,
            transaction_timeout: Duration::from_secs(5),
            consume_timeout: Duration::from_millis(100),
            error_backoff: Duration::from_secs(5),
            putback_backoff: Duration::from_millis(500),
            max_putback_backoff: Duration::from_secs(60),
            max_putback_attempts: 0,
        }
    }
}
