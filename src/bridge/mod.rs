//! MQTT/Kafka Bridge
//!
//! Forwards shop-floor telemetry between the device-facing MQTT broker and
//! Kafka, in both directions, translating topics on the way.
//!
//! # Topic layout
//!
//! ```text
//! MQTT:  ia/<customer>/<location>/<asset>/<kind>
//! Kafka: ia.<customer>.<location>.<asset>.<kind>
//! ```
//!
//! Messages on topics outside this layout are dropped, never forwarded.
//!
//! # Example Configuration
//!
//! ```toml
//! [bridge]
//! topic_prefix = "ia"
//! mqtt_listen_topic = "ia/#"
//! kafka_listen_topic = "^ia\\..*\\.command$"
//! poll_interval = "10ms"
//!
//! [bridge.queue]
//! capacity = 100000
//! overflow = "drop_oldest"
//! ```

mod dispatch;
mod engine;
mod queue;
mod topic;


pub use dispatch::Dispatcher;
pub use engine::{BridgeEngine, Step};
pub use queue::{OverflowPolicy, QueueFull, QueuedMessage, RetryQueue};
pub use topic::{TopicRoute, TopicTranslator, MAX_BROKER_TOPIC_LEN, MIN_LEVELS};

pub use crate::config::BridgeConfig;
