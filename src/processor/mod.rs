//! Message Processing Framework
//!
//! Consumes domain messages from Kafka and persists them to the store. Each
//! message kind has a handler implementing [`ProcessMessages`]; the
//! [`HandlerRegistry`] picks the handler from the kind encoded in the topic.
//!
//! A handler walks one message through
//! Received -> Decoded -> Validated -> IdentifiersResolved -> Committed
//! and reports a [`Verdict`]:
//! - malformed or invalid payloads are discarded and never retried
//! - unresolved identifiers and infrastructure failures are put back and
//!   redelivered later
//!
//! Writes are idempotent on natural keys, so a message redelivered after a
//! commit whose acknowledgement was lost does not create a duplicate row.

mod consumer;
mod count;
mod scrap_unique_product;
mod state;
mod unique_product;

#[cfg(test)]
mod tests;

pub use consumer::IngestConsumer;
pub use count::Count;
pub use scrap_unique_product::ScrapUniqueProduct;
pub use state::State;
pub use unique_product::UniqueProduct;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use crate::bridge::TopicTranslator;
use crate::cache::IdResolver;
use crate::metrics::Metrics;
use crate::store::{Row, Store, StoreError, Transaction};

/// A broker message with its routing metadata split out of the topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub customer_id: String,
    pub location: String,
    pub asset_id: String,
    pub kind: String,
    pub payload: Bytes,
}

impl ParsedMessage {
    /// Parse a broker topic. `None` if the topic does not follow the layout.
    pub fn from_topic(translator: &TopicTranslator, topic: &str, payload: Bytes) -> Option<Self> {
        let route = translator.parse_kafka_topic(topic)?;
        Some(Self {
            customer_id: route.customer_id,
            location: route.location,
            asset_id: route.asset_id,
            kind: route.kind,
            payload,
        })
    }
}

/// Why a message was dropped without retry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscardReason {
    /// Payload is not valid JSON for its kind
    #[error("malformed payload: {0}")]
    Malformed(String),
    /// Payload decoded but a required field is missing or out of range
    #[error("invalid payload: {0}")]
    Invalid(String),
    /// No handler for the message kind
    #[error("unknown message kind '{0}'")]
    UnknownKind(String),
}

/// Transient failure that warrants redelivery
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A transaction step exceeded its deadline
    #[error("transaction {stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },
}

/// Outcome of processing one message
#[derive(Debug)]
pub enum Verdict {
    /// Fully handled (written, or rolled back in dry-run mode)
    Committed,
    /// Dropped for good
    Discarded(DiscardReason),
    /// Redeliver later. `None` when a dependency is simply not there yet.
    Putback(Option<ProcessError>),
}

impl Verdict {
    /// Whether the message must be offered again
    pub fn putback(&self) -> bool {
        matches!(self, Verdict::Putback(_))
    }

    /// The error behind this verdict, if any
    pub fn error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Verdict::Committed => None,
            Verdict::Discarded(reason) => Some(reason),
            Verdict::Putback(Some(e)) => Some(e),
            Verdict::Putback(None) => None,
        }
    }

    /// Metric label
    pub fn outcome(&self) -> &'static str {
        match self {
            Verdict::Committed => "committed",
            Verdict::Discarded(_) => "discarded",
            Verdict::Putback(_) => "putback",
        }
    }
}

/// Contract implemented by every message kind handler
#[async_trait]
pub trait ProcessMessages: Send + Sync {
    async fn process_messages(&self, msg: &ParsedMessage) -> Verdict;
}

/// Dependencies shared by all handlers
pub struct HandlerContext {
    store: Arc<dyn Store>,
    resolver: Arc<IdResolver>,
    metrics: Arc<Metrics>,
    dry_run: bool,
    transaction_timeout: Duration,
}

impl HandlerContext {
    pub fn new(
        store: Arc<dyn Store>,
        resolver: Arc<IdResolver>,
        metrics: Arc<Metrics>,
        dry_run: bool,
        transaction_timeout: Duration,
    ) -> Self {
        Self {
            store,
            resolver,
            metrics,
            dry_run,
            transaction_timeout,
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Decode the JSON payload
    pub(crate) fn decode<T: DeserializeOwned>(&self, msg: &ParsedMessage) -> Result<T, Verdict> {
        serde_json::from_slice(&msg.payload).map_err(|e| {
            warn!(
                "Discarding malformed {} message for {}/{}/{}: {}",
                msg.kind, msg.customer_id, msg.location, msg.asset_id, e
            );
            Verdict::Discarded(DiscardReason::Malformed(e.to_string()))
        })
    }

    /// Require a payload field
    pub(crate) fn required<T>(
        &self,
        msg: &ParsedMessage,
        field: &'static str,
        value: Option<T>,
    ) -> Result<T, Verdict> {
        value.ok_or_else(|| self.invalid(msg, format!("missing '{}'", field)))
    }

    /// Require a millisecond timestamp that fits the store's signed column
    pub(crate) fn timestamp(
        &self,
        msg: &ParsedMessage,
        field: &'static str,
        value: Option<u64>,
    ) -> Result<i64, Verdict> {
        let value = self.required(msg, field, value)?;
        i64::try_from(value)
            .map_err(|_| self.invalid(msg, format!("'{}' out of range: {}", field, value)))
    }

    /// Discard a decoded payload that fails validation
    pub(crate) fn invalid(&self, msg: &ParsedMessage, reason: String) -> Verdict {
        warn!(
            "Discarding invalid {} message for {}/{}/{}: {}",
            msg.kind, msg.customer_id, msg.location, msg.asset_id, reason
        );
        Verdict::Discarded(DiscardReason::Invalid(reason))
    }

    /// Resolve the asset the message was published for
    pub(crate) async fn resolve_asset(&self, msg: &ParsedMessage) -> Result<u32, Verdict> {
        match self
            .resolver
            .resolve_asset_id(&msg.customer_id, &msg.location, &msg.asset_id)
            .await
        {
            Ok(Some(id)) => Ok(id),
            Ok(None) => {
                debug!(
                    "Asset {}/{}/{} not registered yet, putting back",
                    msg.customer_id, msg.location, msg.asset_id
                );
                Err(Verdict::Putback(None))
            }
            Err(e) => {
                warn!("Asset lookup failed: {}", e);
                Err(Verdict::Putback(Some(e.into())))
            }
        }
    }

    /// Resolve a product on an already resolved asset
    pub(crate) async fn resolve_product(&self, product: &str, asset_id: u32) -> Result<u32, Verdict> {
        match self.resolver.resolve_product_id(product, asset_id).await {
            Ok(Some(id)) => Ok(id),
            Ok(None) => {
                debug!(
                    "Product '{}' on asset {} not registered yet, putting back",
                    product, asset_id
                );
                Err(Verdict::Putback(None))
            }
            Err(e) => {
                warn!("Product lookup failed: {}", e);
                Err(Verdict::Putback(Some(e.into())))
            }
        }
    }

    /// Write one row in its own transaction.
    ///
    /// Begin, prepare, execute and commit each get the full transaction
    /// timeout. Every failure rolls back and puts the message back.
    pub(crate) async fn write(&self, row: Row) -> Verdict {
        let started = Instant::now();
        let result = self.write_row(&row).await;
        self.metrics
            .observe_transaction(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => Verdict::Committed,
            Err(e) => {
                warn!("Writing {:?} failed: {}", row.statement(), e);
                Verdict::Putback(Some(e))
            }
        }
    }

    async fn write_row(&self, row: &Row) -> Result<(), ProcessError> {
        let mut tx = self.bounded("begin", self.store.begin()).await?;

        let executed = match self.bounded("prepare", tx.prepare(row.statement())).await {
            Ok(()) => self.bounded("execute", tx.execute(row)).await.map(|_| ()),
            Err(e) => Err(e),
        };

        if let Err(e) = executed {
            self.rollback(tx).await;
            return Err(e);
        }

        if self.dry_run {
            debug!("Dry run: rolling back {:?}", row.statement());
            return self.bounded("rollback", tx.rollback()).await;
        }

        self.bounded("commit", tx.commit()).await
    }

    async fn rollback(&self, tx: Box<dyn Transaction>) {
        if let Err(e) = self.bounded("rollback", tx.rollback()).await {
            warn!("Rollback failed: {}", e);
        }
    }

    async fn bounded<T, F>(&self, stage: &'static str, step: F) -> Result<T, ProcessError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.transaction_timeout, step).await {
            Ok(result) => result.map_err(ProcessError::from),
            Err(_) => Err(ProcessError::Timeout {
                stage,
                after: self.transaction_timeout,
            }),
        }
    }
}

/// Message kind -> handler table
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ProcessMessages>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a handler for every built-in kind
    pub fn with_defaults(ctx: Arc<HandlerContext>) -> Self {
        let mut registry = Self::new();
        registry.register("count", Arc::new(Count::new(ctx.clone())));
        registry.register("uniqueProduct", Arc::new(UniqueProduct::new(ctx.clone())));
        registry.register(
            "scrapUniqueProduct",
            Arc::new(ScrapUniqueProduct::new(ctx.clone())),
        );
        registry.register("state", Arc::new(State::new(ctx)));
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn ProcessMessages>) {
        self.handlers.insert(kind.into(), handler);
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn ProcessMessages>> {
        self.handlers.get(kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Hand the message to its kind's handler. Unknown kinds are discarded.
    pub async fn dispatch(&self, msg: &ParsedMessage) -> Verdict {
        match self.handlers.get(&msg.kind) {
            Some(handler) => handler.process_messages(msg).await,
            None => Verdict::Discarded(DiscardReason::UnknownKind(msg.kind.clone())),
        }
    }
}
