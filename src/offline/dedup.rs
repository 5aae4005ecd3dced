//! In-memory dedup store.
//!
//! Entries live for a fixed horizon after being marked, then are forgotten.
//! The horizon is the same for every entry, so marks expire in the order they
//! were made; each mark sweeps the expired head of that order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::DedupChecker;
use crate::error::DedupError;

/// Default time a processed id is remembered.
pub const DEFAULT_DEDUP_HORIZON: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Default)]
struct Seen {
    expiry: HashMap<String, Instant>,
    /// Marks in expiry order. An id marked twice appears twice; only the
    /// entry matching `expiry` removes it.
    order: VecDeque<(Instant, String)>,
}

impl Seen {
    fn sweep(&mut self, now: Instant) {
        while self.order.front().is_some_and(|(expires, _)| *expires <= now) {
            let Some((expires, id)) = self.order.pop_front() else {
                break;
            };
            if self.expiry.get(&id) == Some(&expires) {
                self.expiry.remove(&id);
            }
        }
    }
}

/// TTL-scoped processed-id set.
pub struct MemoryDedupStore {
    horizon: Duration,
    seen: Mutex<Seen>,
    available: AtomicBool,
}

impl MemoryDedupStore {
    pub fn new(horizon: Duration) -> Self {
        Self {
            horizon,
            seen: Mutex::new(Seen::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: every call fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Live (unexpired) entries.
    pub fn len(&self) -> usize {
        let mut seen = self.seen();
        seen.sweep(Instant::now());
        seen.expiry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn seen(&self) -> MutexGuard<'_, Seen> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), DedupError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DedupError::Unavailable("dedup store is not reachable".to_string()))
        }
    }
}

impl Default for MemoryDedupStore {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_HORIZON)
    }
}

#[async_trait]
impl DedupChecker for MemoryDedupStore {
    async fn check_duplicate(&self, msg_id: &str) -> Result<bool, DedupError> {
        self.check_available()?;
        let now = Instant::now();
        let seen = self.seen();
        Ok(seen.expiry.get(msg_id).is_some_and(|expires| *expires > now))
    }

    async fn mark_processed(&self, msg_id: &str) -> Result<(), DedupError> {
        self.check_available()?;
        let now = Instant::now();
        let expires = now + self.horizon;
        let mut seen = self.seen();
        seen.sweep(now);
        seen.expiry.insert(msg_id.to_string(), expires);
        seen.order.push_back((expires, msg_id.to_string()));
        Ok(())
    }
}
