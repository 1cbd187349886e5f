//! Topic translation between the device transport and the broker
//!
//! Device topics look like `ia/<customer>/<location>/<asset>/<kind>[/<sub>...]`.
//! The broker form swaps the level separator: `ia.<customer>.<location>.<asset>.<kind>`.
//!
//! Every function here is total: an unacceptable topic yields `None` and the
//! caller drops the message. Forwarding a mistranslated topic would attribute
//! data to the wrong customer, location or asset.

/// Maximum Kafka topic name length
pub const MAX_BROKER_TOPIC_LEN: usize = 249;

/// Minimum number of levels: prefix, customer, location, asset, kind
pub const MIN_LEVELS: usize = 5;

const DEVICE_SEPARATOR: char = '/';
const BROKER_SEPARATOR: char = '.';

/// Routing metadata carried positionally in a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRoute {
    pub customer_id: String,
    pub location: String,
    pub asset_id: String,
    /// First level after the asset (`count`, `uniqueProduct`, ...)
    pub kind: String,
}

/// Maps topics between the device transport and the broker
#[derive(Debug, Clone)]
pub struct TopicTranslator {
    prefix: String,
}

impl TopicTranslator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `ia/a/b/c/count` -> `ia.a.b.c.count`
    pub fn mqtt_to_kafka(&self, topic: &str) -> Option<String> {
        self.translate(topic, DEVICE_SEPARATOR, BROKER_SEPARATOR)
    }

    /// `ia.a.b.c.count` -> `ia/a/b/c/count`
    pub fn kafka_to_mqtt(&self, topic: &str) -> Option<String> {
        self.translate(topic, BROKER_SEPARATOR, DEVICE_SEPARATOR)
    }

    /// Split a broker topic into its routing metadata
    pub fn parse_kafka_topic(&self, topic: &str) -> Option<TopicRoute> {
        if !self.is_valid(topic, BROKER_SEPARATOR) {
            return None;
        }
        let mut levels = topic.split(BROKER_SEPARATOR).skip(1);
        Some(TopicRoute {
            customer_id: levels.next()?.to_string(),
            location: levels.next()?.to_string(),
            asset_id: levels.next()?.to_string(),
            kind: levels.next()?.to_string(),
        })
    }

    /// Whether a device topic would be accepted for forwarding
    pub fn is_valid_mqtt_topic(&self, topic: &str) -> bool {
        self.is_valid(topic, DEVICE_SEPARATOR)
    }

    /// Whether a broker topic would be accepted for forwarding
    pub fn is_valid_kafka_topic(&self, topic: &str) -> bool {
        self.is_valid(topic, BROKER_SEPARATOR)
    }

    fn translate(&self, topic: &str, from: char, to: char) -> Option<String> {
        if !self.is_valid(topic, from) {
            return None;
        }
        Some(topic.replace(from, &to.to_string()))
    }

    fn is_valid(&self, topic: &str, separator: char) -> bool {
        // Both forms have the same byte length, so one bound covers both directions
        if topic.is_empty() || topic.len() > MAX_BROKER_TOPIC_LEN {
            return false;
        }

        let mut levels = 0;
        for (index, level) in topic.split(separator).enumerate() {
            if index == 0 && level != self.prefix {
                return false;
            }
            if !is_valid_level(level) {
                return false;
            }
            levels += 1;
        }

        levels >= MIN_LEVELS
    }
}

impl Default for TopicTranslator {
    fn default() -> Self {
        Self::new("ia")
    }
}

/// A level is non-empty and limited to characters legal in both transports.
/// Excludes both separators and the MQTT wildcards.
fn is_valid_level(level: &str) -> bool {
    !level.is_empty()
        && level
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
