//! In-memory store
//!
//! Mirrors the PostgreSQL store closely enough to drive the processing
//! framework without a database: registered assets and products, staged rows
//! that only become visible on commit, conflict-ignoring inserts, and switches
//! to inject failures or slow statements.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Row, Statement, Store, StoreError, Transaction};

#[derive(Default)]
struct Inner {
    assets: Mutex<HashMap<(String, String, String), u32>>,
    products: Mutex<HashMap<(String, u32), u32>>,
    next_id: AtomicUsize,
    rows: Mutex<Vec<Row>>,

    lookups: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,

    closed: AtomicBool,
    fail_lookups: AtomicBool,
    fail_execute: AtomicBool,
    fail_commit: AtomicBool,
    execute_delay: Mutex<Option<Duration>>,
}

impl Inner {
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("store closed".to_string()));
        }
        Ok(())
    }

    fn allocate_id(&self) -> u32 {
        (self.next_id.fetch_add(1, Ordering::Relaxed) + 1) as u32
    }
}

/// Store kept entirely in memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an asset, returning its surrogate id
    pub fn register_asset(&self, customer_id: &str, location: &str, asset_id: &str) -> u32 {
        let key = (
            customer_id.to_string(),
            location.to_string(),
            asset_id.to_string(),
        );
        *self
            .inner
            .assets
            .lock()
            .entry(key)
            .or_insert_with(|| self.inner.allocate_id())
    }

    /// Register a product on an asset, returning its surrogate id
    pub fn register_product(&self, product: &str, asset_id: u32) -> u32 {
        *self
            .inner
            .products
            .lock()
            .entry((product.to_string(), asset_id))
            .or_insert_with(|| self.inner.allocate_id())
    }

    /// Rows visible after commit, in commit order
    pub fn committed_rows(&self) -> Vec<Row> {
        self.inner.rows.lock().clone()
    }

    /// Number of asset and product lookups that reached the store
    pub fn lookup_count(&self) -> usize {
        self.inner.lookups.load(Ordering::Relaxed)
    }

    pub fn commit_count(&self) -> usize {
        self.inner.commits.load(Ordering::Relaxed)
    }

    pub fn rollback_count(&self) -> usize {
        self.inner.rollbacks.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Make lookups fail with a store error
    pub fn set_fail_lookups(&self, fail: bool) {
        self.inner.fail_lookups.store(fail, Ordering::Release);
    }

    /// Make statement execution fail
    pub fn set_fail_execute(&self, fail: bool) {
        self.inner.fail_execute.store(fail, Ordering::Release);
    }

    /// Make commit fail (staged rows are discarded)
    pub fn set_fail_commit(&self, fail: bool) {
        self.inner.fail_commit.store(fail, Ordering::Release);
    }

    /// Delay every statement execution
    pub fn set_execute_delay(&self, delay: Option<Duration>) {
        *self.inner.execute_delay.lock() = delay;
    }

    fn lookup(&self) -> Result<(), StoreError> {
        self.inner.check_open()?;
        self.inner.lookups.fetch_add(1, Ordering::Relaxed);
        if self.inner.fail_lookups.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("lookup failed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn asset_id(
        &self,
        customer_id: &str,
        location: &str,
        asset_id: &str,
    ) -> Result<Option<u32>, StoreError> {
        self.lookup()?;
        let key = (
            customer_id.to_string(),
            location.to_string(),
            asset_id.to_string(),
        );
        Ok(self.inner.assets.lock().get(&key).copied())
    }

    async fn product_id(&self, product: &str, asset_id: u32) -> Result<Option<u32>, StoreError> {
        self.lookup()?;
        Ok(self
            .inner
            .products
            .lock()
            .get(&(product.to_string(), asset_id))
            .copied())
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        self.inner.check_open()?;
        Ok(Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            staged: Vec::new(),
        }))
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

struct MemoryTransaction {
    inner: Arc<Inner>,
    staged: Vec<Row>,
}

fn same_natural_key(a: &Row, b: &Row) -> bool {
    match (a, b) {
        (
            Row::UniqueProduct {
                asset_id: a_asset,
                alternative_id: a_uid,
                ..
            },
            Row::UniqueProduct {
                asset_id: b_asset,
                alternative_id: b_uid,
                ..
            },
        ) => a_asset == b_asset && a_uid == b_uid,
        _ => a == b,
    }
}

fn apply(rows: &mut Vec<Row>, row: &Row) -> u64 {
    match row {
        Row::ScrapUniqueProduct {
            asset_id,
            alternative_id,
        } => {
            let mut affected = 0;
            for existing in rows.iter_mut() {
                if let Row::UniqueProduct {
                    asset_id: a,
                    alternative_id: uid,
                    is_scrap,
                    ..
                } = existing
                {
                    if a == asset_id && uid == alternative_id {
                        *is_scrap = true;
                        affected += 1;
                    }
                }
            }
            affected
        }
        _ => {
            if rows.iter().any(|existing| same_natural_key(existing, row)) {
                0
            } else {
                rows.push(row.clone());
                1
            }
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn prepare(&mut self, _statement: Statement) -> Result<(), StoreError> {
        self.inner.check_open()
    }

    async fn execute(&mut self, row: &Row) -> Result<u64, StoreError> {
        self.inner.check_open()?;

        let delay = *self.inner.execute_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.inner.fail_execute.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("execute failed".to_string()));
        }

        // Affected count as seen by this transaction
        let mut view = self.inner.rows.lock().clone();
        view.extend(self.staged.iter().cloned());
        let affected = apply(&mut view, row);

        self.staged.push(row.clone());
        Ok(affected)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.check_open()?;
        if self.inner.fail_commit.load(Ordering::Acquire) {
            self.inner.rollbacks.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::Unavailable("commit failed".to_string()));
        }

        let mut rows = self.inner.rows.lock();
        for row in &self.staged {
            apply(&mut rows, row);
        }
        self.inner.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
