//! Floorlink - shop-floor telemetry bridge and ingest service
//!
//! Forwards messages between the device-facing MQTT broker and Kafka, and
//! persists Kafka domain messages to PostgreSQL in deadline-bound
//! transactions with putback on transient failures.

pub mod bridge;
pub mod cache;
pub mod config;
pub mod lifecycle;
pub mod metrics;
pub mod processor;
pub mod store;
pub mod transport;

pub use bridge::{BridgeEngine, Dispatcher, RetryQueue, TopicTranslator};
pub use cache::IdResolver;
pub use config::Config;
pub use lifecycle::Lifecycle;
pub use metrics::{HealthServer, Metrics};
pub use processor::{HandlerContext, HandlerRegistry, IngestConsumer, ProcessMessages, Verdict};
pub use store::{MemoryStore, PostgresStore, Store, StoreError};
pub use transport::{BrokerConsumer, BrokerProducer, DeviceClient, TransportError};
