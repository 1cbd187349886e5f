//! Lifecycle & Health
//!
//! Owns the process-wide cancellation token, the one-way draining flag that
//! drives readiness, and the active worker count that drives liveness.
//!
//! Shutdown runs in three steps: readiness is withdrawn the instant draining
//! starts, the process keeps serving for the drain window, then the token
//! fires and every loop stops.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;

/// Shared shutdown and health state
pub struct Lifecycle {
    cancel: CancellationToken,
    draining: AtomicBool,
    active_workers: AtomicUsize,
    max_workers: usize,
    drain_window: Duration,
    metrics: Arc<Metrics>,
}

impl Lifecycle {
    pub fn new(drain_window: Duration, max_workers: usize, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            cancel: CancellationToken::new(),
            draining: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
            max_workers,
            drain_window,
            metrics,
        })
    }

    /// Token observed by every loop
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Readiness: false from the moment draining starts
    pub fn is_ready(&self) -> bool {
        !self.draining.load(Ordering::Acquire)
    }

    /// Liveness: false while more workers run than allowed
    pub fn is_live(&self) -> bool {
        let active = self.active_workers();
        if active > self.max_workers {
            warn!(
                "Liveness failing: {} active workers (max {})",
                active, self.max_workers
            );
            return false;
        }
        true
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }

    /// Count a worker until the guard is dropped
    pub fn worker(self: &Arc<Self>) -> WorkerGuard {
        let active = self.active_workers.fetch_add(1, Ordering::AcqRel) + 1;
        self.metrics.active_workers.set(active as i64);
        WorkerGuard {
            lifecycle: self.clone(),
        }
    }

    /// Spawn a task counted as a worker for its whole run
    pub fn spawn<F>(self: &Arc<Self>, name: &'static str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.worker();
        tokio::spawn(async move {
            let _guard = guard;
            debug!("Worker '{}' started", name);
            future.await;
            debug!("Worker '{}' stopped", name);
        })
    }

    /// Withdraw readiness. Returns false if draining had already started.
    pub fn begin_drain(&self) -> bool {
        let first = !self.draining.swap(true, Ordering::AcqRel);
        if first {
            info!("Draining: readiness withdrawn");
        }
        first
    }

    /// Withdraw readiness, wait out the drain window, then cancel every loop.
    ///
    /// Returns early if the token is cancelled from elsewhere.
    pub async fn drain(&self) {
        self.begin_drain();

        if !self.drain_window.is_zero() {
            info!("Waiting {:?} before shutting down", self.drain_window);
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(self.drain_window) => {}
            }
        }

        self.shutdown_now();
    }

    /// Cancel every loop immediately
    pub fn shutdown_now(&self) {
        self.draining.store(true, Ordering::Release);
        if !self.cancel.is_cancelled() {
            info!("Cancelling all workers");
            self.cancel.cancel();
        }
    }
}

/// Decrements the active worker count on drop
pub struct WorkerGuard {
    lifecycle: Arc<Lifecycle>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let active = self.lifecycle.active_workers.fetch_sub(1, Ordering::AcqRel) - 1;
        self.lifecycle.metrics.active_workers.set(active as i64);
    }
}
