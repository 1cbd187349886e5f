//! Ingest consumer
//!
//! Pulls domain messages from Kafka and applies the putback contract:
//! committed and discarded messages advance the offset, put back messages
//! do not. A put back message is redelivered by rewinding its partition after
//! a doubling back-off.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{HandlerRegistry, ParsedMessage, Verdict};
use crate::bridge::TopicTranslator;
use crate::config::IngestConfig;
use crate::metrics::Metrics;
use crate::transport::{BrokerConsumer, BrokerMessage, TransportError};

/// Consecutive putbacks of the message at the head of a partition
#[derive(Debug, Default)]
struct PutbackTracker {
    partitions: HashMap<(String, i32), (i64, u32)>,
}

impl PutbackTracker {
    /// Record a putback and return how many times in a row this offset was put back
    fn record(&mut self, msg: &BrokerMessage) -> u32 {
        let entry = self
            .partitions
            .entry((msg.topic.clone(), msg.partition))
            .or_insert((msg.offset, 0));
        if entry.0 != msg.offset {
            *entry = (msg.offset, 0);
        }
        entry.1 += 1;
        entry.1
    }

    fn clear(&mut self, msg: &BrokerMessage) {
        self.partitions.remove(&(msg.topic.clone(), msg.partition));
    }
}

/// Back-off before the `attempt`-th redelivery: base doubled per attempt, capped
pub(crate) fn putback_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift).min(max)
}

/// Kafka -> store consumer loop
pub struct IngestConsumer {
    consumer: Arc<dyn BrokerConsumer>,
    registry: Arc<HandlerRegistry>,
    translator: TopicTranslator,
    config: IngestConfig,
    metrics: Arc<Metrics>,
}

impl IngestConsumer {
    pub fn new(
        consumer: Arc<dyn BrokerConsumer>,
        registry: Arc<HandlerRegistry>,
        translator: TopicTranslator,
        config: IngestConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            consumer,
            registry,
            translator,
            config,
            metrics,
        }
    }

    /// Subscribe to the ingest topic. Failure is fatal at startup.
    pub async fn subscribe(&self) -> Result<(), TransportError> {
        self.consumer.subscribe(&self.config.topic).await
    }

    /// Consume until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Ingest consumer started (kinds: {:?}, dry_run: {})",
            self.registry.kinds(),
            self.config.dry_run
        );

        let mut putbacks = PutbackTracker::default();

        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.consumer.poll(self.config.consume_timeout) => polled,
            };

            match polled {
                Ok(Some(msg)) => self.handle(msg, &mut putbacks, &cancel).await,
                Ok(None) | Err(TransportError::Timeout) => {}
                Err(TransportError::UnknownTopicOrPartition) => {
                    debug!("Ingest topic not available yet");
                    self.pause(self.config.error_backoff, &cancel).await;
                }
                Err(e) => {
                    warn!("Ingest consume failed: {}", e);
                    self.pause(self.config.error_backoff, &cancel).await;
                }
            }
        }

        info!("Ingest consumer stopped");
    }

    async fn handle(
        &self,
        msg: BrokerMessage,
        putbacks: &mut PutbackTracker,
        cancel: &CancellationToken,
    ) {
        let Some(parsed) = ParsedMessage::from_topic(&self.translator, &msg.topic, msg.payload.clone())
        else {
            trace!("Dropping message on unexpected topic {}", msg.topic);
            self.metrics.processed("unknown", "discarded");
            self.commit(&msg).await;
            return;
        };

        let verdict = self.registry.dispatch(&parsed).await;
        self.metrics.processed(&parsed.kind, verdict.outcome());

        match verdict {
            Verdict::Committed => {
                trace!(
                    "Processed {} at {}[{}]@{}",
                    parsed.kind,
                    msg.topic,
                    msg.partition,
                    msg.offset
                );
                putbacks.clear(&msg);
                self.commit(&msg).await;
            }
            Verdict::Discarded(reason) => {
                debug!("Discarded {}[{}]@{}: {}", msg.topic, msg.partition, msg.offset, reason);
                putbacks.clear(&msg);
                self.commit(&msg).await;
            }
            Verdict::Putback(err) => {
                let attempt = putbacks.record(&msg);
                let max_attempts = self.config.max_putback_attempts;

                if max_attempts > 0 && attempt >= max_attempts {
                    error!(
                        "Giving up on {}[{}]@{} after {} putbacks (last error: {})",
                        msg.topic,
                        msg.partition,
                        msg.offset,
                        attempt,
                        err.map(|e| e.to_string())
                            .unwrap_or_else(|| "unresolved identifier".to_string())
                    );
                    putbacks.clear(&msg);
                    self.commit(&msg).await;
                    return;
                }

                let delay = putback_delay(
                    self.config.putback_backoff,
                    self.config.max_putback_backoff,
                    attempt,
                );
                match err {
                    Some(e) => warn!(
                        "Putting back {}[{}]@{} (attempt {}, retry in {:?}): {}",
                        msg.topic, msg.partition, msg.offset, attempt, delay, e
                    ),
                    None => debug!(
                        "Putting back {}[{}]@{} (attempt {}, retry in {:?})",
                        msg.topic, msg.partition, msg.offset, attempt, delay
                    ),
                }

                self.pause(delay, cancel).await;
                if cancel.is_cancelled() {
                    // Offset stays uncommitted; the next consumer in the group redelivers
                    return;
                }
                if let Err(e) = self.consumer.seek(&msg).await {
                    warn!(
                        "Rewinding {}[{}] to {} failed: {}",
                        msg.topic, msg.partition, msg.offset, e
                    );
                }
            }
        }
    }

    async fn commit(&self, msg: &BrokerMessage) {
        if let Err(e) = self.consumer.commit(msg).await {
            warn!(
                "Committing {}[{}]@{} failed: {}",
                msg.topic, msg.partition, msg.offset, e
            );
        }
    }

    async fn pause(&self, duration: Duration, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(1, 500 ; "first attempt uses base")]
    #[test_case(2, 1_000 ; "second attempt doubles")]
    #[test_case(4, 4_000 ; "fourth attempt")]
    #[test_case(10, 60_000 ; "capped at max")]
    #[test_case(u32::MAX, 60_000 ; "huge attempt does not overflow")]
    fn test_putback_delay(attempt: u32, expected_ms: u64) {
        let delay = putback_delay(
            Duration::from_millis(500),
            Duration::from_secs(60),
            attempt,
        );
        assert_eq!(delay, Duration::from_millis(expected_ms));
    }

    #[test]
    fn test_tracker_resets_on_new_offset() {
        let mut tracker = PutbackTracker::default();
        let mut msg = BrokerMessage {
            topic: "ia.c.l.a.count".to_string(),
            partition: 0,
            offset: 7,
            payload: bytes::Bytes::new(),
        };
        assert_eq!(tracker.record(&msg), 1);
        assert_eq!(tracker.record(&msg), 2);

        msg.offset = 8;
        assert_eq!(tracker.record(&msg), 1);

        tracker.clear(&msg);
        assert_eq!(tracker.record(&msg), 1);
    }
}
