//! Outbound dispatcher
//!
//! Broker messages bound for the device transport are handed to a bounded
//! pool of tasks instead of being processed inline, so the consume loop keeps
//! polling. Tasks are tracked so shutdown can wait for the ones in flight.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use super::{RetryQueue, TopicTranslator};
use crate::lifecycle::Lifecycle;
use crate::metrics::Metrics;
use crate::transport::BrokerMessage;

/// Bounded pool turning broker messages into outgoing queue entries
pub struct Dispatcher {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    translator: TopicTranslator,
    outgoing: Arc<RetryQueue>,
    metrics: Arc<Metrics>,
    lifecycle: Arc<Lifecycle>,
}

impl Dispatcher {
    pub fn new(
        max_in_flight: usize,
        translator: TopicTranslator,
        outgoing: Arc<RetryQueue>,
        metrics: Arc<Metrics>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            tracker: TaskTracker::new(),
            translator,
            outgoing,
            metrics,
            lifecycle,
        }
    }

    /// Hand a message to the pool. Waits only while the pool is saturated.
    ///
    /// Returns false once the dispatcher is closed.
    pub async fn submit(&self, message: BrokerMessage) -> bool {
        if self.tracker.is_closed() {
            return false;
        }
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return false,
        };

        let worker = self.lifecycle.worker();
        let translator = self.translator.clone();
        let outgoing = self.outgoing.clone();
        let metrics = self.metrics.clone();

        metrics.dispatcher_in_flight.inc();
        self.tracker.spawn(async move {
            let _permit = permit;
            let _worker = worker;
            route(&translator, &outgoing, &metrics, message);
            metrics.dispatcher_in_flight.dec();
        });
        true
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting submissions and wait for the ones in flight
    pub async fn close(&self) {
        self.tracker.close();
        self.permits.close();
        debug!("Waiting for {} dispatched message(s)", self.tracker.len());
        self.tracker.wait().await;
    }
}

/// Validate, translate and enqueue one broker message
pub(crate) fn route(
    translator: &TopicTranslator,
    outgoing: &RetryQueue,
    metrics: &Metrics,
    message: BrokerMessage,
) {
    if let Err(e) = serde_json::from_slice::<serde::de::IgnoredAny>(&message.payload) {
        warn!(
            "Dropping non-JSON payload from {}[{}]@{}: {}",
            message.topic, message.partition, message.offset, e
        );
        metrics.dropped("invalid_json");
        return;
    }

    let Some(topic) = translator.kafka_to_mqtt(&message.topic) else {
        trace!("Dropping message on untranslatable topic {}", message.topic);
        metrics.dropped("invalid_topic");
        return;
    };

    match outgoing.enqueue(topic, message.payload) {
        Ok(None) => {}
        Ok(Some(evicted)) => {
            warn!(
                "Outgoing queue full, dropped oldest message for '{}' (queued {:?})",
                evicted.topic,
                evicted.age()
            );
            metrics.dropped("overflow");
        }
        Err(e) => {
            warn!("{}", e);
            metrics.dropped("overflow");
        }
    }
    metrics.set_queue_depth("outgoing", outgoing.len());
}
