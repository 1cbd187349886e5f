//! Bridge Engine
//!
//! Moves messages between the device transport and the broker. Each
//! direction is a pair of loops around a [`RetryQueue`]:
//!
//! - MQTT -> Kafka: the ingest loop validates device topics and enqueues,
//!   the forward loop translates, ensures the broker topic and produces.
//! - Kafka -> MQTT: the consume loop hands messages to the [`Dispatcher`],
//!   the publish loop drains the outgoing queue to the device transport.
//!
//! A failed forward re-enqueues the message at the tail, so delivery is
//! at-least-once for as long as the process lives.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{Dispatcher, QueuedMessage, RetryQueue, TopicTranslator};
use crate::config::BridgeConfig;
use crate::lifecycle::Lifecycle;
use crate::metrics::Metrics;
use crate::transport::{
    BrokerConsumer, BrokerProducer, DeviceClient, DeviceMessage, TransportError,
};

const MQTT_TO_KAFKA: &str = "mqtt_to_kafka";
const KAFKA_TO_MQTT: &str = "kafka_to_mqtt";

/// Result of one forwarding step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Queue was empty
    Idle,
    /// Message delivered
    Forwarded,
    /// Delivery failed, message went back on the queue
    Requeued,
    /// Message dropped for good
    Dropped,
}

/// Bidirectional MQTT/Kafka bridge
pub struct BridgeEngine {
    config: BridgeConfig,
    translator: TopicTranslator,
    producer: Arc<dyn BrokerProducer>,
    consumer: Option<Arc<dyn BrokerConsumer>>,
    device: Arc<dyn DeviceClient>,
    incoming: Arc<RetryQueue>,
    outgoing: Arc<RetryQueue>,
    dispatcher: Dispatcher,
    topic_create_failures: AtomicU32,
    metrics: Arc<Metrics>,
    lifecycle: Arc<Lifecycle>,
}

impl BridgeEngine {
    pub fn new(
        config: BridgeConfig,
        producer: Arc<dyn BrokerProducer>,
        consumer: Option<Arc<dyn BrokerConsumer>>,
        device: Arc<dyn DeviceClient>,
        metrics: Arc<Metrics>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        let translator = TopicTranslator::new(config.topic_prefix.clone());
        let incoming = Arc::new(RetryQueue::bounded(
            config.queue.capacity,
            config.queue.overflow,
        ));
        let outgoing = Arc::new(RetryQueue::bounded(
            config.queue.capacity,
            config.queue.overflow,
        ));
        let dispatcher = Dispatcher::new(
            config.max_in_flight,
            translator.clone(),
            outgoing.clone(),
            metrics.clone(),
            lifecycle.clone(),
        );

        Self {
            config,
            translator,
            producer,
            consumer,
            device,
            incoming,
            outgoing,
            dispatcher,
            topic_create_failures: AtomicU32::new(0),
            metrics,
            lifecycle,
        }
    }

    pub fn translator(&self) -> &TopicTranslator {
        &self.translator
    }

    /// Queue of device messages waiting for the broker
    pub fn incoming(&self) -> &RetryQueue {
        &self.incoming
    }

    /// Queue of broker messages waiting for the device transport
    pub fn outgoing(&self) -> &RetryQueue {
        &self.outgoing
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Consecutive topic-creation failures so far
    pub fn topic_create_failures(&self) -> u32 {
        self.topic_create_failures.load(Ordering::Relaxed)
    }

    /// Subscribe both transports. Any failure is fatal at startup.
    pub async fn subscribe(&self) -> Result<(), TransportError> {
        self.device.subscribe(&self.config.mqtt_listen_topic).await?;
        info!(
            "Bridge: subscribed to MQTT '{}'",
            self.config.mqtt_listen_topic
        );

        match (&self.config.kafka_listen_topic, &self.consumer) {
            (Some(topic), Some(consumer)) => {
                consumer.subscribe(topic).await?;
                info!("Bridge: subscribed to Kafka '{}'", topic);
            }
            (Some(topic), None) => {
                warn!(
                    "Bridge: Kafka listen topic '{}' set but no consumer configured",
                    topic
                );
            }
            (None, _) => info!("Bridge: Kafka -> MQTT direction disabled"),
        }
        Ok(())
    }

    /// Accept a device publish into the incoming queue.
    ///
    /// Topics that would not translate are dropped here and never queued.
    pub fn accept_device_message(&self, message: DeviceMessage) -> bool {
        if !self.translator.is_valid_mqtt_topic(&message.topic) {
            trace!("Bridge: ignoring MQTT topic {}", message.topic);
            self.metrics.dropped("invalid_topic");
            return false;
        }

        match self.incoming.enqueue(message.topic, message.payload) {
            Ok(evicted) => {
                if let Some(evicted) = evicted {
                    warn!(
                        "Bridge: incoming queue full, dropped oldest message for '{}'",
                        evicted.topic
                    );
                    self.metrics.dropped("overflow");
                }
                self.metrics.set_queue_depth("incoming", self.incoming.len());
                true
            }
            Err(e) => {
                warn!("Bridge: {}", e);
                self.metrics.dropped("overflow");
                false
            }
        }
    }

    /// Forward the head of the incoming queue to the broker
    pub async fn step_mqtt_to_kafka(&self) -> Step {
        let Some(message) = self.incoming.dequeue() else {
            return Step::Idle;
        };

        let Some(topic) = self.translator.mqtt_to_kafka(&message.topic) else {
            trace!("Bridge: dropping untranslatable topic {}", message.topic);
            self.metrics.dropped("invalid_topic");
            return Step::Dropped;
        };

        if let Err(e) = self.producer.ensure_topic(&topic).await {
            let failures = self.topic_create_failures.fetch_add(1, Ordering::Relaxed) + 1;
            self.metrics.topic_create_failed();
            let threshold = self.config.topic_create_alert_threshold.max(1);
            if failures % threshold == 0 {
                error!(
                    "Bridge: creating topic {} failed {} times in a row: {}",
                    topic, failures, e
                );
            } else {
                warn!("Bridge: creating topic {} failed: {}", topic, e);
            }
            return self.requeue(&self.incoming, "incoming", MQTT_TO_KAFKA, message);
        }
        self.topic_create_failures.store(0, Ordering::Relaxed);

        match self.producer.produce(&topic, message.payload.clone()).await {
            Ok(()) => {
                trace!("Bridge: {} -> {}", message.topic, topic);
                self.metrics.forwarded(MQTT_TO_KAFKA);
                self.metrics.set_queue_depth("incoming", self.incoming.len());
                Step::Forwarded
            }
            Err(e) => {
                warn!("Bridge: producing to {} failed: {}", topic, e);
                self.requeue(&self.incoming, "incoming", MQTT_TO_KAFKA, message)
            }
        }
    }

    /// Publish the head of the outgoing queue to the device transport
    pub async fn step_mqtt_publish(&self) -> Step {
        let Some(message) = self.outgoing.dequeue() else {
            return Step::Idle;
        };

        match self
            .device
            .publish(&message.topic, message.payload.clone())
            .await
        {
            Ok(()) => {
                trace!("Bridge: published {}", message.topic);
                self.metrics.forwarded(KAFKA_TO_MQTT);
                self.metrics.set_queue_depth("outgoing", self.outgoing.len());
                Step::Forwarded
            }
            Err(e) => {
                debug!("Bridge: publishing to {} failed: {}", message.topic, e);
                self.requeue(&self.outgoing, "outgoing", KAFKA_TO_MQTT, message)
            }
        }
    }

    fn requeue(
        &self,
        queue: &RetryQueue,
        queue_name: &str,
        direction: &str,
        message: QueuedMessage,
    ) -> Step {
        self.metrics.requeued(direction);
        let step = match queue.push(message) {
            Ok(None) => Step::Requeued,
            Ok(Some(evicted)) => {
                warn!(
                    "Bridge: {} queue full, dropped oldest message for '{}'",
                    queue_name, evicted.topic
                );
                self.metrics.dropped("overflow");
                Step::Requeued
            }
            Err(e) => {
                warn!("Bridge: {}", e);
                self.metrics.dropped("overflow");
                Step::Dropped
            }
        };
        self.metrics.set_queue_depth(queue_name, queue.len());
        step
    }

    /// Device transport -> incoming queue
    pub async fn run_mqtt_ingest(&self, cancel: CancellationToken) {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = self.device.next_message() => message,
            };
            match message {
                Some(message) => {
                    self.accept_device_message(message);
                }
                None => {
                    info!("Bridge: device transport closed");
                    break;
                }
            }
        }
    }

    /// Incoming queue -> broker
    pub async fn run_mqtt_to_kafka(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let pause = match self.step_mqtt_to_kafka().await {
                Step::Idle => self.config.poll_interval,
                Step::Requeued => self.config.retry_backoff,
                Step::Forwarded | Step::Dropped => continue,
            };
            sleep_or_cancel(pause, &cancel).await;
        }
    }

    /// Broker -> dispatcher
    pub async fn run_kafka_to_mqtt(&self, cancel: CancellationToken) {
        let Some(consumer) = self.consumer.clone() else {
            return;
        };

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = consumer.poll(self.config.consume_timeout) => polled,
            };

            match polled {
                Ok(Some(message)) => {
                    let submitted = tokio::select! {
                        _ = cancel.cancelled() => break,
                        submitted = self.dispatcher.submit(message) => submitted,
                    };
                    if !submitted {
                        break;
                    }
                }
                Ok(None) | Err(TransportError::Timeout) => {}
                Err(TransportError::UnknownTopicOrPartition) => {
                    debug!("Bridge: Kafka listen topic not available yet");
                    sleep_or_cancel(self.config.error_backoff, &cancel).await;
                }
                Err(e) => {
                    warn!("Bridge: consume failed: {}", e);
                    sleep_or_cancel(self.config.error_backoff, &cancel).await;
                }
            }
        }
    }

    /// Outgoing queue -> device transport
    pub async fn run_mqtt_publish(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let pause = match self.step_mqtt_publish().await {
                Step::Idle => self.config.poll_interval,
                Step::Requeued => self.config.retry_backoff,
                Step::Forwarded | Step::Dropped => continue,
            };
            sleep_or_cancel(pause, &cancel).await;
        }
    }

    /// Spawn every loop as a lifecycle worker
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let token = self.lifecycle.token();
        let mut handles = Vec::with_capacity(4);

        let engine = self.clone();
        let cancel = token.clone();
        handles.push(self.lifecycle.spawn("mqtt-ingest", async move {
            engine.run_mqtt_ingest(cancel).await
        }));

        let engine = self.clone();
        let cancel = token.clone();
        handles.push(self.lifecycle.spawn("mqtt-to-kafka", async move {
            engine.run_mqtt_to_kafka(cancel).await
        }));

        if self.consumer.is_some() && self.config.kafka_listen_topic.is_some() {
            let engine = self.clone();
            let cancel = token.clone();
            handles.push(self.lifecycle.spawn("kafka-to-mqtt", async move {
                engine.run_kafka_to_mqtt(cancel).await
            }));

            let engine = self.clone();
            handles.push(self.lifecycle.spawn("mqtt-publish", async move {
                engine.run_mqtt_publish(token).await
            }));
        }

        info!("Bridge: started {} loop(s)", handles.len());
        handles
    }

    /// Wait for dispatched messages and report what is left behind
    pub async fn shutdown(&self) {
        self.dispatcher.close().await;
        let (incoming, outgoing) = (self.incoming.len(), self.outgoing.len());
        if incoming + outgoing > 0 {
            warn!(
                "Bridge: discarding {} incoming and {} outgoing queued message(s)",
                incoming, outgoing
            );
        }
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}
