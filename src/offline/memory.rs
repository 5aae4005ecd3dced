//! In-memory durable message store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use super::{OfflineStorer, StorageRecord};
use crate::error::DatabaseError;

#[derive(Default)]
struct Inner {
    rows: HashMap<String, StorageRecord>,
    /// Insertion order of `rows`.
    order: Vec<String>,
    batches: Vec<Vec<String>>,
}

/// Keyed by `msg_id`; a batch is applied all-or-nothing.
///
/// `fail_next(n)` makes the next `n` inserts fail, for exercising retries.
#[derive(Default)]
pub struct MemoryOfflineStore {
    inner: Mutex<Inner>,
    failures_left: AtomicU32,
    attempts: AtomicU32,
}

impl MemoryOfflineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls to `batch_insert`.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Total `batch_insert` calls, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, msg_id: &str) -> Option<StorageRecord> {
        self.lock().rows.get(msg_id).cloned()
    }

    /// Stored records in insertion order.
    pub fn records(&self) -> Vec<StorageRecord> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.rows.get(id).cloned())
            .collect()
    }

    /// Message ids of every successful batch, as submitted.
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.lock().batches.clone()
    }

    /// Drop records whose `expires_at` has passed. Returns how many.
    pub fn purge_expired(&self, now: chrono::DateTime<chrono::Utc>) -> usize {
        let mut inner = self.lock();
        let before = inner.rows.len();
        inner.rows.retain(|_, r| r.expires_at > now);
        let Inner { rows, order, .. } = &mut *inner;
        order.retain(|id| rows.contains_key(id));
        before - inner.rows.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl OfflineStorer for MemoryOfflineStore {
    async fn batch_insert(&self, records: &[StorageRecord]) -> Result<(), DatabaseError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DatabaseError::Query("injected insert failure".to_string()));
        }

        let mut inner = self.lock();
        for record in records {
            if !inner.rows.contains_key(&record.msg_id) {
                inner.order.push(record.msg_id.clone());
                inner.rows.insert(record.msg_id.clone(), record.clone());
            }
        }
        inner
            .batches
            .push(records.iter().map(|r| r.msg_id.clone()).collect());
        Ok(())
    }
}
