//! Bridge Configuration
//!
//! Topic layout, retry queue limits and loop timings for the MQTT/Kafka bridge.

use std::time::Duration;

use serde::Deserialize;

use crate::bridge::OverflowPolicy;

/// Retry queue sizing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// High-water mark per direction (0 = unbounded)
    pub capacity: usize,
    /// What to do when a bounded queue is full
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// Bridge configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// First topic level shared by both transports
    pub topic_prefix: String,

    /// MQTT subscription filter feeding the MQTT -> Kafka direction
    pub mqtt_listen_topic: String,

    /// Kafka topic or `^`-prefixed regex feeding the Kafka -> MQTT direction.
    /// Unset disables that direction.
    pub kafka_listen_topic: Option<String>,

    /// Consumer group for the Kafka -> MQTT direction
    pub group_id: String,

    /// Retry queue limits
    pub queue: QueueConfig,

    /// Sleep when the retry queue is empty
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Sleep after a failed forward before the next attempt
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Broker consume timeout; keeps the loop responsive to shutdown
    #[serde(with = "humantime_serde")]
    pub consume_timeout: Duration,

    /// Back-off after consume errors and unknown topics
    #[serde(with = "humantime_serde")]
    pub error_backoff: Duration,

    /// Consecutive topic-creation failures before alerting
    pub topic_create_alert_threshold: u32,

    /// Maximum in-flight Kafka -> MQTT submissions
    pub max_in_flight: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "ia".to_string(),
            mqtt_listen_topic: "ia/#".to_string(),
            kafka_listen_topic: None,
            group_id: "floorlink-bridge".to_string(),
            queue: QueueConfig::default(),
            poll_interval: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(100),
            consume_timeout: Duration::from_millis(100),
            error_backoff: Duration::from_secs(5),
            topic_create_alert_threshold: 10,
            max_in_flight: 64,
        }
    }
}
