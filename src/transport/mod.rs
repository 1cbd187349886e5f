//! Transport Layer
//!
//! Abstractions over the two message transports floorlink talks to: the
//! device-facing MQTT broker and the durable Kafka log. The bridge and the
//! ingest consumer only see these traits, so both can be driven by in-memory
//! implementations in tests.

mod kafka;
mod mqtt;

pub use kafka::{KafkaConsumer, KafkaProducer};
pub use mqtt::MqttDeviceClient;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Error type for transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Operation timed out
    #[error("operation timed out")]
    Timeout,
    /// Subscribed topic or partition does not exist (yet)
    #[error("unknown topic or partition")]
    UnknownTopicOrPartition,
    /// Topic could not be created
    #[error("failed to create topic {topic}: {reason}")]
    TopicCreation { topic: String, reason: String },
    /// Produce or publish was rejected or failed
    #[error("publish failed: {0}")]
    Publish(String),
    /// Subscription failed
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    /// Client could not be created or lost its connection
    #[error("connection error: {0}")]
    Connection(String),
    /// Offset commit or seek failed
    #[error("offset error: {0}")]
    Offset(String),
}

/// Status of a transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not connected, will attempt to connect
    Disconnected,
    /// Connected and operational
    Connected,
    /// Connection failed, backing off before retry
    Backoff,
}

/// A message consumed from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Bytes,
}

/// A publish received from the device transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Producing side of the durable broker
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// Create the topic if it does not exist yet.
    ///
    /// Idempotent: an already existing topic is success.
    async fn ensure_topic(&self, topic: &str) -> Result<(), TransportError>;

    /// Produce a payload to a topic and wait for the delivery report
    async fn produce(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;
}

/// Consuming side of the durable broker
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Subscribe to a topic name or a `^`-prefixed regex
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next message.
    ///
    /// `Ok(None)` means nothing arrived in time.
    async fn poll(&self, timeout: Duration) -> Result<Option<BrokerMessage>, TransportError>;

    /// Mark the message as processed
    async fn commit(&self, message: &BrokerMessage) -> Result<(), TransportError>;

    /// Rewind the message's partition so the message is delivered again
    async fn seek(&self, message: &BrokerMessage) -> Result<(), TransportError>;
}

/// Device-facing pub/sub client
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Subscribe to a topic filter.
    ///
    /// The subscription is kept across reconnects.
    async fn subscribe(&self, filter: &str) -> Result<(), TransportError>;

    /// Publish a payload to a topic
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Next publish received on any subscription.
    ///
    /// Returns `None` once the client has shut down.
    async fn next_message(&self) -> Option<DeviceMessage>;

    /// Current connection status
    fn status(&self) -> ConnectionStatus;
}
