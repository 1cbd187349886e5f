//! Kafka transport
//!
//! Producer with idempotent topic creation and a consumer with manual offset
//! control, both built on librdkafka.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, info};

use super::{BrokerConsumer, BrokerMessage, BrokerProducer, TransportError};
use crate::config::KafkaConfig;

/// Apply connection and security settings shared by every client
fn base_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.bootstrap_servers);

    if let Some(ref protocol) = config.security_protocol {
        client.set("security.protocol", protocol);
    }
    if let Some(ref mechanism) = config.sasl_mechanism {
        client.set("sasl.mechanism", mechanism);
    }
    if let Some(ref username) = config.sasl_username {
        client.set("sasl.username", username);
    }
    if let Some(ref password) = config.sasl_password {
        client.set("sasl.password", password);
    }
    if let Some(ref ca_location) = config.ssl_ca_location {
        client.set("ssl.ca.location", ca_location);
    }

    client
}

fn connection_error(e: KafkaError) -> TransportError {
    TransportError::Connection(e.to_string())
}

/// Kafka producer that creates topics on first use
pub struct KafkaProducer {
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    /// Topics known to exist
    known_topics: DashSet<String>,
    partitions: i32,
    replication: i32,
    request_timeout: Duration,
}

impl KafkaProducer {
    /// Create the producer and admin clients. Fails only on invalid client configuration.
    pub fn new(config: &KafkaConfig) -> Result<Self, TransportError> {
        let timeout_ms = config.request_timeout.as_millis().to_string();

        let producer: FutureProducer = base_config(config)
            .set("message.timeout.ms", &timeout_ms)
            .set("acks", "all")
            .create()
            .map_err(connection_error)?;

        let admin: AdminClient<DefaultClientContext> =
            base_config(config).create().map_err(connection_error)?;

        info!("Kafka producer created for {}", config.bootstrap_servers);

        Ok(Self {
            producer,
            admin,
            known_topics: DashSet::new(),
            partitions: config.topic_partitions,
            replication: config.topic_replication,
            request_timeout: config.request_timeout,
        })
    }
}

#[async_trait]
impl BrokerProducer for KafkaProducer {
    async fn ensure_topic(&self, topic: &str) -> Result<(), TransportError> {
        if self.known_topics.contains(topic) {
            return Ok(());
        }

        let new_topic = NewTopic::new(
            topic,
            self.partitions,
            TopicReplication::Fixed(self.replication),
        );
        let opts = AdminOptions::new().operation_timeout(Some(self.request_timeout));

        let results = self
            .admin
            .create_topics(&[new_topic], &opts)
            .await
            .map_err(|e| TransportError::TopicCreation {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        for result in results {
            match result {
                Ok(name) => debug!("Created topic {}", name),
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((name, code)) => {
                    return Err(TransportError::TopicCreation {
                        topic: name,
                        reason: code.to_string(),
                    });
                }
            }
        }

        self.known_topics.insert(topic.to_string());
        Ok(())
    }

    async fn produce(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        let record = FutureRecord::<(), [u8]>::to(topic).payload(payload.as_ref());

        self.producer
            .send(record, self.request_timeout)
            .await
            .map_err(|(e, _)| match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::MessageTimedOut) => TransportError::Timeout,
                _ => TransportError::Publish(e.to_string()),
            })?;

        Ok(())
    }
}

/// Kafka consumer with explicit commit and rewind
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    seek_timeout: Duration,
}

impl KafkaConsumer {
    /// Create a consumer in `group_id`.
    ///
    /// With `auto_commit` disabled offsets only advance through [`BrokerConsumer::commit`].
    pub fn new(
        config: &KafkaConfig,
        group_id: &str,
        auto_commit: bool,
    ) -> Result<Self, TransportError> {
        let consumer: StreamConsumer = base_config(config)
            .set("group.id", group_id)
            .set("enable.auto.commit", if auto_commit { "true" } else { "false" })
            .set("auto.offset.reset", "earliest")
            .set("topic.metadata.refresh.interval.ms", "5000")
            .create()
            .map_err(connection_error)?;

        info!(
            "Kafka consumer created for {} (group={}, auto_commit={})",
            config.bootstrap_servers, group_id, auto_commit
        );

        Ok(Self {
            consumer,
            seek_timeout: config.request_timeout,
        })
    }
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.consumer
            .subscribe(&[topic])
            .map_err(|e| TransportError::Subscribe(format!("{}: {}", topic, e)))?;
        info!("Subscribed to Kafka topic {}", topic);
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<BrokerMessage>, TransportError> {
        let received = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Ok(received) => received,
            Err(_) => return Ok(None),
        };

        match received {
            Ok(message) => Ok(Some(BrokerMessage {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
            })),
            Err(e) => match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::UnknownTopicOrPartition)
                | Some(RDKafkaErrorCode::UnknownTopic)
                | Some(RDKafkaErrorCode::UnknownPartition) => {
                    Err(TransportError::UnknownTopicOrPartition)
                }
                Some(RDKafkaErrorCode::RequestTimedOut)
                | Some(RDKafkaErrorCode::OperationTimedOut) => Err(TransportError::Timeout),
                _ => Err(connection_error(e)),
            },
        }
    }

    async fn commit(&self, message: &BrokerMessage) -> Result<(), TransportError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )
        .map_err(|e| TransportError::Offset(e.to_string()))?;

        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| TransportError::Offset(e.to_string()))
    }

    async fn seek(&self, message: &BrokerMessage) -> Result<(), TransportError> {
        self.consumer
            .seek(
                &message.topic,
                message.partition,
                Offset::Offset(message.offset),
                self.seek_timeout,
            )
            .map_err(|e| TransportError::Offset(e.to_string()))
    }
}
