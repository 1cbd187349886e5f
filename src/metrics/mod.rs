//! Prometheus metrics for floorlink
//!
//! Exposes metrics at /metrics endpoint for monitoring and observability,
//! next to the liveness and readiness endpoints.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

mod server;

pub use server::HealthServer;

/// All floorlink metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Bridge metrics
    pub bridge_forwarded_total: IntCounterVec,
    pub bridge_requeued_total: IntCounterVec,
    pub bridge_dropped_total: IntCounterVec,
    pub bridge_queue_depth: IntGaugeVec,
    pub topic_create_failures_total: IntCounter,
    pub dispatcher_in_flight: IntGauge,

    // Ingest metrics
    pub messages_processed_total: IntCounterVec,
    pub transaction_duration: Histogram,

    // Id cache metrics
    pub cache_lookups_total: IntCounterVec,

    // Lifecycle
    pub active_workers: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let bridge_forwarded_total = IntCounterVec::new(
            Opts::new(
                "floorlink_bridge_forwarded_total",
                "Messages delivered to the target transport by direction",
            ),
            &["direction"],
        )
        .unwrap();

        let bridge_requeued_total = IntCounterVec::new(
            Opts::new(
                "floorlink_bridge_requeued_total",
                "Messages put back on a retry queue after a failed send",
            ),
            &["direction"],
        )
        .unwrap();

        let bridge_dropped_total = IntCounterVec::new(
            Opts::new(
                "floorlink_bridge_dropped_total",
                "Messages dropped by the bridge by reason",
            ),
            &["reason"],
        )
        .unwrap();

        let bridge_queue_depth = IntGaugeVec::new(
            Opts::new("floorlink_bridge_queue_depth", "Current retry queue length"),
            &["queue"],
        )
        .unwrap();

        let topic_create_failures_total = IntCounter::with_opts(Opts::new(
            "floorlink_topic_create_failures_total",
            "Failed Kafka topic creations",
        ))
        .unwrap();

        let dispatcher_in_flight = IntGauge::with_opts(Opts::new(
            "floorlink_dispatcher_in_flight",
            "Kafka -> MQTT submissions currently being handled",
        ))
        .unwrap();

        let messages_processed_total = IntCounterVec::new(
            Opts::new(
                "floorlink_messages_processed_total",
                "Ingested messages by kind and outcome",
            ),
            &["kind", "outcome"],
        )
        .unwrap();

        let transaction_duration = Histogram::with_opts(
            HistogramOpts::new(
                "floorlink_transaction_duration_seconds",
                "Time from transaction begin to commit or rollback",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
        )
        .unwrap();

        let cache_lookups_total = IntCounterVec::new(
            Opts::new(
                "floorlink_id_cache_lookups_total",
                "Id cache lookups by entity and result",
            ),
            &["entity", "result"],
        )
        .unwrap();

        let active_workers = IntGauge::with_opts(Opts::new(
            "floorlink_active_workers",
            "Currently running worker tasks",
        ))
        .unwrap();

        // Register all metrics
        registry
            .register(Box::new(bridge_forwarded_total.clone()))
            .unwrap();
        registry
            .register(Box::new(bridge_requeued_total.clone()))
            .unwrap();
        registry
            .register(Box::new(bridge_dropped_total.clone()))
            .unwrap();
        registry
            .register(Box::new(bridge_queue_depth.clone()))
            .unwrap();
        registry
            .register(Box::new(topic_create_failures_total.clone()))
            .unwrap();
        registry
            .register(Box::new(dispatcher_in_flight.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_processed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(transaction_duration.clone()))
            .unwrap();
        registry
            .register(Box::new(cache_lookups_total.clone()))
            .unwrap();
        registry.register(Box::new(active_workers.clone())).unwrap();

        Metrics {
            registry,
            bridge_forwarded_total,
            bridge_requeued_total,
            bridge_dropped_total,
            bridge_queue_depth,
            topic_create_failures_total,
            dispatcher_in_flight,
            messages_processed_total,
            transaction_duration,
            cache_lookups_total,
            active_workers,
        }
    }

    // Bridge helpers

    pub fn forwarded(&self, direction: &str) {
        self.bridge_forwarded_total
            .with_label_values(&[direction])
            .inc();
    }

    pub fn requeued(&self, direction: &str) {
        self.bridge_requeued_total
            .with_label_values(&[direction])
            .inc();
    }

    pub fn dropped(&self, reason: &str) {
        self.bridge_dropped_total.with_label_values(&[reason]).inc();
    }

    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        self.bridge_queue_depth
            .with_label_values(&[queue])
            .set(depth as i64);
    }

    pub fn topic_create_failed(&self) {
        self.topic_create_failures_total.inc();
    }

    // Ingest helpers

    pub fn processed(&self, kind: &str, outcome: &str) {
        self.messages_processed_total
            .with_label_values(&[kind, outcome])
            .inc();
    }

    pub fn observe_transaction(&self, seconds: f64) {
        self.transaction_duration.observe(seconds);
    }

    pub fn cache_lookup(&self, entity: &str, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups_total
            .with_label_values(&[entity, result])
            .inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
