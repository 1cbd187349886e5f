//! Transport Configuration
//!
//! Connection settings for the device-facing MQTT broker and for Kafka.

use std::time::Duration;

use serde::Deserialize;

/// MQTT connection protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MqttProtocol {
    /// Plain MQTT over TCP
    #[default]
    Mqtt,
    /// MQTT over TLS
    Mqtts,
}

impl MqttProtocol {
    /// Get default port for this protocol
    pub fn default_port(&self) -> u16 {
        match self {
            MqttProtocol::Mqtt => 1883,
            MqttProtocol::Mqtts => 8883,
        }
    }

    /// Check if this protocol uses TLS
    pub fn uses_tls(&self) -> bool {
        matches!(self, MqttProtocol::Mqtts)
    }
}

impl std::fmt::Display for MqttProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MqttProtocol::Mqtt => write!(f, "mqtt"),
            MqttProtocol::Mqtts => write!(f, "mqtts"),
        }
    }
}

/// Device transport (MQTT broker) configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker address (host:port or just host)
    pub address: String,

    /// Connection protocol
    pub protocol: MqttProtocol,

    /// Client ID to use when connecting
    pub client_id: String,

    /// Username for authentication
    pub username: Option<String>,

    /// Password for authentication
    pub password: Option<String>,

    /// Keep-alive interval in seconds
    pub keepalive: u16,

    /// Use clean session (no session persistence)
    pub clean_session: bool,

    /// QoS for subscriptions and publishes (0, 1 or 2)
    pub qos: u8,

    /// Capacity of the client request channel
    pub channel_capacity: usize,

    /// Pause between reconnect attempts
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
}

pub(crate) fn default_client_id(role: &str) -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| std::process::id().to_string());
    format!("floorlink-{}-{}", role, host)
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            address: "localhost:1883".to_string(),
            protocol: MqttProtocol::default(),
            client_id: default_client_id("bridge"),
            username: None,
            password: None,
            keepalive: 60,
            clean_session: true,
            qos: 1,
            channel_capacity: 1000,
            reconnect_interval: Duration::from_secs(1),
        }
    }
}

impl MqttConfig {
    /// Parse address into host and port
    pub fn parse_address(&self) -> (String, u16) {
        if let Some((host, port_str)) = self.address.rsplit_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
        (self.address.clone(), self.protocol.default_port())
    }
}

/// Kafka connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers (comma-separated)
    pub bootstrap_servers: String,

    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL)
    pub security_protocol: Option<String>,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    pub sasl_mechanism: Option<String>,

    /// SASL username
    pub sasl_username: Option<String>,

    /// SASL password
    pub sasl_password: Option<String>,

    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,

    /// Partitions for topics created by the bridge
    pub topic_partitions: i32,

    /// Replication factor for topics created by the bridge
    pub topic_replication: i32,

    /// Timeout for produce and admin requests
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            topic_partitions: 1,
            topic_replication: 1,
            request_timeout: Duration::from_secs(5),
        }
    }
}
