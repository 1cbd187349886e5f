//! Processing framework tests

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use test_case::test_case;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::config::IngestConfig;
use crate::store::MemoryStore;
use crate::transport::{BrokerConsumer, BrokerMessage, TransportError};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Fixture {
    store: MemoryStore,
    metrics: Arc<Metrics>,
    registry: HandlerRegistry,
}

fn fixture(dry_run: bool) -> Fixture {
    fixture_with_timeout(dry_run, TIMEOUT)
}

fn fixture_with_timeout(dry_run: bool, timeout: Duration) -> Fixture {
    let store = MemoryStore::new();
    let metrics = Arc::new(Metrics::new());
    let shared: Arc<dyn Store> = Arc::new(store.clone());
    let resolver = Arc::new(IdResolver::new(shared.clone(), metrics.clone()));
    let ctx = Arc::new(HandlerContext::new(
        shared,
        resolver,
        metrics.clone(),
        dry_run,
        timeout,
    ));
    Fixture {
        store,
        metrics,
        registry: HandlerRegistry::with_defaults(ctx),
    }
}

fn message(kind: &str, payload: &str) -> ParsedMessage {
    ParsedMessage {
        customer_id: "acme".to_string(),
        location: "plant1".to_string(),
        asset_id: "press".to_string(),
        kind: kind.to_string(),
        payload: Bytes::from(payload.to_string()),
    }
}

#[test]
fn test_parsed_message_from_topic() {
    let translator = TopicTranslator::default();
    let msg = ParsedMessage::from_topic(&translator, "ia.acme.plant1.press.count", Bytes::new())
        .unwrap();
    assert_eq!(msg.customer_id, "acme");
    assert_eq!(msg.location, "plant1");
    assert_eq!(msg.asset_id, "press");
    assert_eq!(msg.kind, "count");

    assert!(ParsedMessage::from_topic(&translator, "foo.bar", Bytes::new()).is_none());
}

#[test]
fn test_registry_kinds() {
    let f = fixture(false);
    assert_eq!(
        f.registry.kinds(),
        vec!["count", "scrapUniqueProduct", "state", "uniqueProduct"]
    );
    assert!(f.registry.get("count").is_some());
    assert!(f.registry.get("processValue").is_none());
}

#[tokio::test]
async fn test_count_registered_asset_commits_row() {
    let f = fixture(false);
    let asset = f.store.register_asset("acme", "plant1", "press");

    let verdict = f
        .registry
        .dispatch(&message("count", r#"{"count":5,"scrap":1,"timestamp_ms":1000}"#))
        .await;

    assert!(matches!(verdict, Verdict::Committed));
    assert!(!verdict.putback());
    assert!(verdict.error().is_none());
    assert_eq!(
        f.store.committed_rows(),
        vec![Row::Count {
            asset_id: asset,
            count: 5,
            scrap: 1,
            timestamp_ms: 1000,
        }]
    );
}

#[tokio::test]
async fn test_count_scrap_defaults_to_zero() {
    let f = fixture(false);
    let asset = f.store.register_asset("acme", "plant1", "press");

    f.registry
        .dispatch(&message("count", r#"{"count":3,"timestamp_ms":42}"#))
        .await;

    assert_eq!(
        f.store.committed_rows(),
        vec![Row::Count {
            asset_id: asset,
            count: 3,
            scrap: 0,
            timestamp_ms: 42,
        }]
    );
}

#[tokio::test]
async fn test_unique_product_absent_end_is_null() {
    let f = fixture(false);
    let asset = f.store.register_asset("acme", "plant1", "press");
    let product = f.store.register_product("widget", asset);

    let verdict = f
        .registry
        .dispatch(&message(
            "uniqueProduct",
            r#"{"begin_timestamp_ms":1000,"product_id":"widget","is_scrap":false,"uniqueProductAlternativeID":"uid-1"}"#,
        ))
        .await;

    assert!(matches!(verdict, Verdict::Committed));
    assert_eq!(
        f.store.committed_rows(),
        vec![Row::UniqueProduct {
            asset_id: asset,
            begin_timestamp_ms: 1000,
            end_timestamp_ms: None,
            product_id: product,
            is_scrap: false,
            alternative_id: "uid-1".to_string(),
        }]
    );
}

#[tokio::test]
async fn test_unique_product_zero_end_is_kept() {
    let f = fixture(false);
    let asset = f.store.register_asset("acme", "plant1", "press");
    f.store.register_product("widget", asset);

    f.registry
        .dispatch(&message(
            "uniqueProduct",
            r#"{"begin_timestamp_ms":0,"end_timestamp_ms":0,"product_id":"widget","uniqueProductAlternativeID":"uid-0"}"#,
        ))
        .await;

    assert!(matches!(
        f.store.committed_rows()[0],
        Row::UniqueProduct {
            end_timestamp_ms: Some(0),
            ..
        }
    ));
}

#[tokio::test]
async fn test_unique_product_unknown_product_puts_back() {
    let f = fixture(false);
    f.store.register_asset("acme", "plant1", "press");

    let verdict = f
        .registry
        .dispatch(&message(
            "uniqueProduct",
            r#"{"begin_timestamp_ms":1,"product_id":"ghost","uniqueProductAlternativeID":"uid-1"}"#,
        ))
        .await;

    assert!(matches!(verdict, Verdict::Putback(None)));
    assert!(f.store.committed_rows().is_empty());
}

#[tokio::test]
async fn test_scrap_unique_product_marks_scrap() {
    let f = fixture(false);
    let asset = f.store.register_asset("acme", "plant1", "press");
    f.store.register_product("widget", asset);

    f.registry
        .dispatch(&message(
            "uniqueProduct",
            r#"{"begin_timestamp_ms":1,"product_id":"widget","uniqueProductAlternativeID":"uid-9"}"#,
        ))
        .await;
    let verdict = f
        .registry
        .dispatch(&message("scrapUniqueProduct", r#"{"UID":"uid-9"}"#))
        .await;

    assert!(matches!(verdict, Verdict::Committed));
    assert!(matches!(
        f.store.committed_rows()[0],
        Row::UniqueProduct { is_scrap: true, .. }
    ));
}

#[tokio::test]
async fn test_state_commits_row() {
    let f = fixture(false);
    let asset = f.store.register_asset("acme", "plant1", "press");

    f.registry
        .dispatch(&message("state", r#"{"timestamp_ms":5000,"state":10000}"#))
        .await;

    assert_eq!(
        f.store.committed_rows(),
        vec![Row::State {
            asset_id: asset,
            timestamp_ms: 5000,
            state: 10000,
        }]
    );
}

#[test_case("count", "not json" ; "count malformed")]
#[test_case("count", r#"{"count":-1,"timestamp_ms":1}"# ; "count negative")]
#[test_case("state", r#"["state"]"# ; "state array")]
#[tokio::test]
async fn test_malformed_is_discarded(kind: &str, payload: &str) {
    let f = fixture(false);
    f.store.register_asset("acme", "plant1", "press");

    let verdict = f.registry.dispatch(&message(kind, payload)).await;

    assert!(matches!(
        verdict,
        Verdict::Discarded(DiscardReason::Malformed(_))
    ));
    assert!(!verdict.putback());
    assert!(verdict.error().is_some());
    assert_eq!(f.store.lookup_count(), 0);
}

#[test_case("count", r#"{"scrap":1,"timestamp_ms":1}"# ; "count missing count")]
#[test_case("count", r#"{"count":1}"# ; "count missing timestamp")]
#[test_case("uniqueProduct", r#"{"product_id":"w","uniqueProductAlternativeID":"u"}"# ; "unique product missing begin")]
#[test_case("uniqueProduct", r#"{"begin_timestamp_ms":1,"product_id":"","uniqueProductAlternativeID":"u"}"# ; "unique product empty product")]
#[test_case("uniqueProduct", r#"{"begin_timestamp_ms":10,"end_timestamp_ms":5,"product_id":"w","uniqueProductAlternativeID":"u"}"# ; "unique product ends before begin")]
#[test_case("scrapUniqueProduct", r#"{}"# ; "scrap missing uid")]
#[test_case("state", r#"{"timestamp_ms":1}"# ; "state missing state")]
#[test_case("count", r#"{"count":7,"timestamp_ms":18446744073709551615}"# ; "count timestamp beyond i64")]
#[test_case("state", r#"{"timestamp_ms":9223372036854775808,"state":1}"# ; "state timestamp beyond i64")]
#[test_case("uniqueProduct", r#"{"begin_timestamp_ms":18446744073709551615,"end_timestamp_ms":5,"product_id":"w","uniqueProductAlternativeID":"u"}"# ; "unique product begin beyond i64")]
#[tokio::test]
async fn test_invalid_is_discarded(kind: &str, payload: &str) {
    let f = fixture(false);
    f.store.register_asset("acme", "plant1", "press");

    let verdict = f.registry.dispatch(&message(kind, payload)).await;

    assert!(
        matches!(verdict, Verdict::Discarded(DiscardReason::Invalid(_))),
        "{:?}",
        verdict
    );
    assert!(!verdict.putback());
    assert!(f.store.committed_rows().is_empty());
    assert_eq!(f.store.commit_count(), 0);
}

#[tokio::test]
async fn test_unknown_asset_puts_back_without_error() {
    let f = fixture(false);

    let verdict = f
        .registry
        .dispatch(&message("count", r#"{"count":5,"timestamp_ms":1000}"#))
        .await;

    assert!(matches!(verdict, Verdict::Putback(None)));
    assert!(verdict.putback());
    assert!(verdict.error().is_none());
}

#[tokio::test]
async fn test_unknown_kind_is_discarded() {
    let f = fixture(false);
    let verdict = f.registry.dispatch(&message("processValue", "{}")).await;
    assert!(matches!(
        verdict,
        Verdict::Discarded(DiscardReason::UnknownKind(ref kind)) if kind == "processValue"
    ));
}

#[tokio::test]
async fn test_putback_then_register_commits_exactly_once() {
    let f = fixture(false);
    let msg = message("count", r#"{"count":5,"scrap":1,"timestamp_ms":1000}"#);

    let first = f.registry.dispatch(&msg).await;
    assert!(first.putback());
    assert!(f.store.committed_rows().is_empty());
    assert_eq!(f.store.commit_count(), 0);

    f.store.register_asset("acme", "plant1", "press");
    let second = f.registry.dispatch(&msg).await;
    assert!(matches!(second, Verdict::Committed));

    // Redelivery after a lost acknowledgement
    let third = f.registry.dispatch(&msg).await;
    assert!(matches!(third, Verdict::Committed));

    assert_eq!(f.store.committed_rows().len(), 1);
}

#[tokio::test]
async fn test_dry_run_commits_nothing() {
    let f = fixture(true);
    f.store.register_asset("acme", "plant1", "press");

    for ts in 0..5 {
        let payload = format!(r#"{{"count":1,"timestamp_ms":{}}}"#, ts);
        let verdict = f.registry.dispatch(&message("count", &payload)).await;
        assert!(matches!(verdict, Verdict::Committed));
        assert!(verdict.error().is_none());
    }

    assert!(f.store.committed_rows().is_empty());
    assert_eq!(f.store.commit_count(), 0);
    assert_eq!(f.store.rollback_count(), 5);
}

#[tokio::test]
async fn test_execute_failure_rolls_back_and_puts_back() {
    let f = fixture(false);
    f.store.register_asset("acme", "plant1", "press");
    f.store.set_fail_execute(true);

    let verdict = f
        .registry
        .dispatch(&message("count", r#"{"count":5,"timestamp_ms":1000}"#))
        .await;

    assert!(matches!(
        verdict,
        Verdict::Putback(Some(ProcessError::Store(_)))
    ));
    assert_eq!(f.store.rollback_count(), 1);
    assert!(f.store.committed_rows().is_empty());
}

#[tokio::test]
async fn test_commit_failure_puts_back() {
    let f = fixture(false);
    f.store.register_asset("acme", "plant1", "press");
    f.store.set_fail_commit(true);

    let verdict = f
        .registry
        .dispatch(&message("count", r#"{"count":5,"timestamp_ms":1000}"#))
        .await;

    assert!(verdict.putback());
    assert!(verdict.error().is_some());
    assert!(f.store.committed_rows().is_empty());
}

#[tokio::test]
async fn test_lookup_failure_puts_back_with_error() {
    let f = fixture(false);
    f.store.set_fail_lookups(true);

    let verdict = f
        .registry
        .dispatch(&message("count", r#"{"count":5,"timestamp_ms":1000}"#))
        .await;

    assert!(matches!(verdict, Verdict::Putback(Some(_))));
}

#[tokio::test(start_paused = true)]
async fn test_execute_deadline_puts_back() {
    let f = fixture_with_timeout(false, Duration::from_millis(100));
    f.store.register_asset("acme", "plant1", "press");
    f.store.set_execute_delay(Some(Duration::from_secs(10)));

    let verdict = f
        .registry
        .dispatch(&message("count", r#"{"count":5,"timestamp_ms":1000}"#))
        .await;

    assert!(matches!(
        verdict,
        Verdict::Putback(Some(ProcessError::Timeout {
            stage: "execute",
            ..
        }))
    ));
    assert_eq!(f.store.rollback_count(), 1);
    assert!(f.store.committed_rows().is_empty());
}

/// Consumer fed from a script; rewinding puts the message back at the front
#[derive(Default)]
struct ScriptedConsumer {
    pending: Mutex<VecDeque<BrokerMessage>>,
    committed: Mutex<Vec<i64>>,
    seeks: Mutex<Vec<i64>>,
    subscribed: Mutex<Vec<String>>,
}

impl ScriptedConsumer {
    fn push(&self, topic: &str, offset: i64, payload: &str) {
        self.pending.lock().push_back(BrokerMessage {
            topic: topic.to_string(),
            partition: 0,
            offset,
            payload: Bytes::from(payload.to_string()),
        });
    }
}

#[async_trait]
impl BrokerConsumer for ScriptedConsumer {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.subscribed.lock().push(topic.to_string());
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<BrokerMessage>, TransportError> {
        let next = self.pending.lock().pop_front();
        if next.is_none() {
            tokio::time::sleep(timeout).await;
        }
        Ok(next)
    }

    async fn commit(&self, message: &BrokerMessage) -> Result<(), TransportError> {
        self.committed.lock().push(message.offset);
        Ok(())
    }

    async fn seek(&self, message: &BrokerMessage) -> Result<(), TransportError> {
        self.seeks.lock().push(message.offset);
        self.pending.lock().push_front(message.clone());
        Ok(())
    }
}

fn ingest_config() -> IngestConfig {
    IngestConfig {
        consume_timeout: Duration::from_millis(10),
        putback_backoff: Duration::from_millis(10),
        max_putback_backoff: Duration::from_millis(40),
        ..Default::default()
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_consumer_commits_discards_and_rewinds() {
    let f = fixture(false);
    let consumer = Arc::new(ScriptedConsumer::default());
    consumer.push("ia.acme.plant1.press.count", 1, "garbage");
    consumer.push("foo.bar", 2, "{}");
    consumer.push("ia.acme.plant1.press.count", 3, r#"{"count":1,"timestamp_ms":7}"#);

    let store = f.store.clone();
    let metrics = f.metrics.clone();
    let ingest = IngestConsumer::new(
        consumer.clone(),
        Arc::new(f.registry),
        TopicTranslator::default(),
        ingest_config(),
        metrics.clone(),
    );
    ingest.subscribe().await.unwrap();
    assert_eq!(consumer.subscribed.lock().len(), 1);

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(ingest.run(cancel.clone()));

    // Offset 3 is put back until the asset shows up
    wait_for(|| consumer.seeks.lock().len() >= 2).await;
    assert_eq!(*consumer.committed.lock(), vec![1, 2]);
    store.register_asset("acme", "plant1", "press");

    wait_for(|| consumer.committed.lock().contains(&3)).await;
    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(store.committed_rows().len(), 1);
    assert!(consumer.seeks.lock().iter().all(|&offset| offset == 3));
    assert!(
        metrics
            .messages_processed_total
            .with_label_values(&["count", "putback"])
            .get()
            >= 2
    );
    assert_eq!(
        metrics
            .messages_processed_total
            .with_label_values(&["count", "committed"])
            .get(),
        1
    );
}

#[tokio::test]
async fn test_consumer_gives_up_after_max_putbacks() {
    let f = fixture(false);
    let consumer = Arc::new(ScriptedConsumer::default());
    consumer.push("ia.acme.plant1.press.count", 9, r#"{"count":1,"timestamp_ms":7}"#);

    let ingest = IngestConsumer::new(
        consumer.clone(),
        Arc::new(f.registry),
        TopicTranslator::default(),
        IngestConfig {
            max_putback_attempts: 3,
            ..ingest_config()
        },
        f.metrics,
    );

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(ingest.run(cancel.clone()));

    wait_for(|| consumer.committed.lock().contains(&9)).await;
    cancel.cancel();
    handle.await.unwrap();

    assert_eq!(consumer.seeks.lock().len(), 2);
    assert!(f.store.committed_rows().is_empty());
}
