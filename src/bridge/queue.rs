//! Retry Queue
//!
//! In-memory FIFO of messages that could not be forwarded yet. Each bridge
//! direction owns one queue; the failure path of a loop re-enqueues at the
//! tail while the same loop (or another task) keeps dequeuing.
//!
//! Contents are best effort: nothing is persisted and a crash loses whatever
//! is still queued.

use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_queue::{ArrayQueue, SegQueue};
use serde::Deserialize;
use thiserror::Error;

/// A message waiting to be forwarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub enqueued_at: Instant,
}

impl QueuedMessage {
    pub fn new(topic: impl Into<String>, payload: Bytes) -> Self {
        Self {
            topic: topic.into(),
            payload,
            enqueued_at: Instant::now(),
        }
    }

    /// Time spent in the queue so far
    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// What a bounded queue does when it is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued message to make room
    #[default]
    DropOldest,
    /// Refuse the incoming message
    RejectNew,
}

/// Returned when a `RejectNew` queue is full. Carries the rejected message back.
#[derive(Debug, Error)]
#[error("retry queue full, rejected message for '{}'", .0.topic)]
pub struct QueueFull(pub QueuedMessage);

enum Inner {
    Unbounded(SegQueue<QueuedMessage>),
    Bounded(ArrayQueue<QueuedMessage>, OverflowPolicy),
}

/// Concurrency-safe FIFO of pending messages
pub struct RetryQueue {
    inner: Inner,
}

impl RetryQueue {
    /// Queue without a high-water mark
    pub fn unbounded() -> Self {
        Self {
            inner: Inner::Unbounded(SegQueue::new()),
        }
    }

    /// Queue holding at most `capacity` messages. A capacity of 0 means unbounded.
    pub fn bounded(capacity: usize, policy: OverflowPolicy) -> Self {
        if capacity == 0 {
            return Self::unbounded();
        }
        Self {
            inner: Inner::Bounded(ArrayQueue::new(capacity), policy),
        }
    }

    /// Append a message at the tail.
    ///
    /// Under `DropOldest` the evicted message (if any) is returned so the
    /// caller can account for it.
    pub fn enqueue(
        &self,
        topic: impl Into<String>,
        payload: Bytes,
    ) -> Result<Option<QueuedMessage>, QueueFull> {
        self.push(QueuedMessage::new(topic, payload))
    }

    /// Re-append an already queued message. Its original enqueue time is kept.
    pub fn push(&self, message: QueuedMessage) -> Result<Option<QueuedMessage>, QueueFull> {
        match &self.inner {
            Inner::Unbounded(queue) => {
                queue.push(message);
                Ok(None)
            }
            Inner::Bounded(queue, OverflowPolicy::DropOldest) => Ok(queue.force_push(message)),
            Inner::Bounded(queue, OverflowPolicy::RejectNew) => {
                queue.push(message).map(|()| None).map_err(QueueFull)
            }
        }
    }

    /// Take the message at the head, if any
    pub fn dequeue(&self) -> Option<QueuedMessage> {
        match &self.inner {
            Inner::Unbounded(queue) => queue.pop(),
            Inner::Bounded(queue, _) => queue.pop(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.inner {
            Inner::Unbounded(queue) => queue.len(),
            Inner::Bounded(queue, _) => queue.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// High-water mark, `None` when unbounded
    pub fn capacity(&self) -> Option<usize> {
        match &self.inner {
            Inner::Unbounded(_) => None,
            Inner::Bounded(queue, _) => Some(queue.capacity()),
        }
    }
}

impl Default for RetryQueue {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl fmt::Debug for RetryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
