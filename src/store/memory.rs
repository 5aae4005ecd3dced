//! In-process lease store with etcd-like semantics.
//!
//! Leases expire `ttl` after grant or last keep-alive. When a lease expires,
//! every key attached to it is removed and watchers see a Delete. Expiry is
//! applied on every access, and continuously by [`MemoryLeaseStore::spawn_reaper`].
//!
//! Time comes from `tokio::time`, so paused-clock tests control expiry.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use super::{KeyValue, LeaseId, LeaseStore, StoreEvent, StoreEventKind, WatchStream};
use crate::error::StoreError;

/// Events buffered per watcher before it is treated as too slow and cut off.
const WATCH_BUFFER: usize = 1024;

/// How long a lapsed lease is remembered. Renewals within this window get
/// `LeaseExpired`; later ones get `LeaseNotFound`.
const EXPIRED_RETENTION: Duration = Duration::from_secs(10 * 60);

struct LeaseState {
    ttl: Duration,
    expires_at: Instant,
    keys: HashSet<String>,
}

struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::Sender<Result<StoreEvent, StoreError>>,
}

struct State {
    next_lease: LeaseId,
    leases: HashMap<LeaseId, LeaseState>,
    /// Recently lapsed leases, so renewal can report `LeaseExpired` rather
    /// than `LeaseNotFound`.
    expired: HashSet<LeaseId>,
    /// `expired` in lapse order, for aging out.
    expired_order: VecDeque<(Instant, LeaseId)>,
    entries: BTreeMap<String, Entry>,
    watchers: Vec<Watcher>,
    available: bool,
    closed: bool,
}

impl State {
    fn check_usable(&self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        if !self.available {
            return Err(StoreError::Unavailable(
                "lease store is not reachable".to_string(),
            ));
        }
        Ok(())
    }

    /// Drop every lease whose deadline has passed, along with its keys.
    fn purge_expired(&mut self, now: Instant) -> usize {
        while self
            .expired_order
            .front()
            .is_some_and(|(lapsed, _)| now.duration_since(*lapsed) >= EXPIRED_RETENTION)
        {
            if let Some((_, id)) = self.expired_order.pop_front() {
                self.expired.remove(&id);
            }
        }

        let lapsed: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut removed = 0;
        for id in lapsed {
            let Some(lease) = self.leases.remove(&id) else {
                continue;
            };
            self.expired.insert(id);
            self.expired_order.push_back((now, id));
            for key in lease.keys {
                let attached = self.entries.get(&key).is_some_and(|e| e.lease == Some(id));
                if attached {
                    self.entries.remove(&key);
                    removed += 1;
                    self.emit(StoreEvent {
                        kind: StoreEventKind::Delete,
                        key,
                        value: String::new(),
                    });
                }
            }
            tracing::debug!(lease_id = id, "Lease expired");
        }
        removed
    }

    fn lease_error(&self, id: LeaseId) -> StoreError {
        if self.expired.contains(&id) {
            StoreError::LeaseExpired { lease_id: id }
        } else {
            StoreError::LeaseNotFound { lease_id: id }
        }
    }

    fn detach(&mut self, key: &str, lease: Option<LeaseId>) {
        if let Some(id) = lease
            && let Some(state) = self.leases.get_mut(&id)
        {
            state.keys.remove(key);
        }
    }

    /// Fan an event out to matching watchers. A watcher whose buffer is full
    /// or whose receiver is gone is dropped, which ends its stream.
    fn emit(&mut self, event: StoreEvent) {
        self.watchers.retain(|w| {
            if !event.key.starts_with(&w.prefix) {
                return !w.tx.is_closed();
            }
            match w.tx.try_send(Ok(event.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(prefix = %w.prefix, "Watcher fell behind, cancelling stream");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// In-memory [`LeaseStore`].
pub struct MemoryLeaseStore {
    state: Mutex<State>,
}

impl MemoryLeaseStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_lease: 1,
                leases: HashMap::new(),
                expired: HashSet::new(),
                expired_order: VecDeque::new(),
                entries: BTreeMap::new(),
                watchers: Vec::new(),
                available: true,
                closed: false,
            }),
        }
    }

    /// Apply lease expiry now. Returns the number of keys removed.
    pub async fn purge_expired(&self) -> usize {
        self.state.lock().await.purge_expired(Instant::now())
    }

    /// Periodically apply lease expiry so watchers see TTL deletions without
    /// any other traffic. The task ends once the store is closed.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                timer.tick().await;
                let mut state = store.state.lock().await;
                if state.closed {
                    break;
                }
                let removed = state.purge_expired(Instant::now());
                if removed > 0 {
                    tracing::debug!(removed, "Reaped expired keys");
                }
            }
        })
    }

    /// Sever every open watch stream, as a network partition would.
    pub async fn disconnect_watchers(&self) {
        self.state.lock().await.watchers.clear();
    }

    /// Number of open watch subscriptions.
    pub async fn watcher_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state.watchers.retain(|w| !w.tx.is_closed());
        state.watchers.len()
    }

    /// Simulate an outage: while unavailable, every call fails with
    /// [`StoreError::Unavailable`] and open watch streams are severed.
    pub async fn set_available(&self, available: bool) {
        let mut state = self.state.lock().await;
        state.available = available;
        if !available {
            state.watchers.clear();
        }
    }
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        let mut state = self.state.lock().await;
        state.check_usable()?;
        let now = Instant::now();
        state.purge_expired(now);

        let id = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(
            id,
            LeaseState {
                ttl,
                expires_at: now + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_usable()?;
        let now = Instant::now();
        state.purge_expired(now);

        match state.leases.get_mut(&lease) {
            Some(l) => {
                l.expires_at = now + l.ttl;
                Ok(())
            }
            None => Err(state.lease_error(lease)),
        }
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_usable()?;
        state.purge_expired(Instant::now());

        if let Some(id) = lease
            && !state.leases.contains_key(&id)
        {
            return Err(state.lease_error(id));
        }

        let previous = state.entries.get(key).and_then(|e| e.lease);
        if previous != lease {
            state.detach(key, previous);
        }
        if let Some(id) = lease
            && let Some(l) = state.leases.get_mut(&id)
        {
            l.keys.insert(key.to_string());
        }

        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease,
            },
        );
        state.emit(StoreEvent {
            kind: StoreEventKind::Put,
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        let mut state = self.state.lock().await;
        state.check_usable()?;
        state.purge_expired(Instant::now());

        Ok(state.entries.get(key).map(|e| KeyValue {
            key: key.to_string(),
            value: e.value.clone(),
            lease: e.lease,
        }))
    }

    async fn prefix_get(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        let mut state = self.state.lock().await;
        state.check_usable()?;
        state.purge_expired(Instant::now());

        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
                lease: e.lease,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.check_usable()?;
        state.purge_expired(Instant::now());

        match state.entries.remove(key) {
            Some(entry) => {
                state.detach(key, entry.lease);
                state.emit(StoreEvent {
                    kind: StoreEventKind::Delete,
                    key: key.to_string(),
                    value: String::new(),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_if_lease(&self, key: &str, lease: LeaseId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.check_usable()?;
        state.purge_expired(Instant::now());

        if !state.entries.get(key).is_some_and(|e| e.lease == Some(lease)) {
            return Ok(false);
        }
        state.entries.remove(key);
        state.detach(key, Some(lease));
        state.emit(StoreEvent {
            kind: StoreEventKind::Delete,
            key: key.to_string(),
            value: String::new(),
        });
        Ok(true)
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        let mut state = self.state.lock().await;
        state.check_usable()?;

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        state.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.watchers.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_test::{assert_err, assert_ok};

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_removes_attached_keys() {
        let store = MemoryLeaseStore::new();
        let lease = store.grant_lease(Duration::from_secs(10)).await.unwrap();
        store.put("/a/1", "v1", Some(lease)).await.unwrap();
        store.put("/a/2", "v2", None).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(store.get("/a/1").await.unwrap().is_none());
        assert!(store.get("/a/2").await.unwrap().is_some());
        assert_eq!(
            store.keep_alive_once(lease).await,
            Err(StoreError::LeaseExpired { lease_id: lease })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_extends_deadline() {
        let store = MemoryLeaseStore::new();
        let lease = store.grant_lease(Duration::from_secs(10)).await.unwrap();
        store.put("/k", "v", Some(lease)).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_ok!(store.keep_alive_once(lease).await);

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.get("/k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.get("/k").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapsed_lease_tombstones_age_out() {
        let store = MemoryLeaseStore::new();
        for _ in 0..5_000 {
            store.grant_lease(Duration::from_secs(1)).await.unwrap();
        }
        let last = store.grant_lease(Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        store.purge_expired().await;
        assert_eq!(store.state.lock().await.expired.len(), 5_001);
        assert_eq!(
            store.keep_alive_once(last).await,
            Err(StoreError::LeaseExpired { lease_id: last })
        );

        tokio::time::advance(EXPIRED_RETENTION).await;
        store.purge_expired().await;
        {
            let state = store.state.lock().await;
            assert!(state.expired.is_empty());
            assert!(state.expired_order.is_empty());
            assert!(state.leases.is_empty());
        }
        assert_eq!(
            store.keep_alive_once(last).await,
            Err(StoreError::LeaseNotFound { lease_id: last })
        );
    }

    #[tokio::test]
    async fn test_unknown_lease() {
        let store = MemoryLeaseStore::new();
        assert_eq!(
            store.keep_alive_once(42).await,
            Err(StoreError::LeaseNotFound { lease_id: 42 })
        );
        assert_err!(store.put("/k", "v", Some(42)).await);
    }

    #[tokio::test]
    async fn test_prefix_get_is_bounded() {
        let store = MemoryLeaseStore::new();
        store.put("/users/u1/d1", "a", None).await.unwrap();
        store.put("/users/u1/d2", "b", None).await.unwrap();
        store.put("/users/u10/d1", "c", None).await.unwrap();
        store.put("/users/u2/d1", "d", None).await.unwrap();

        let found = store.prefix_get("/users/u1/").await.unwrap();
        let keys: Vec<&str> = found.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/users/u1/d1", "/users/u1/d2"]);
    }

    #[tokio::test]
    async fn test_rebinding_key_moves_it_to_new_lease() {
        let store = MemoryLeaseStore::new();
        let first = store.grant_lease(Duration::from_secs(10)).await.unwrap();
        let second = store.grant_lease(Duration::from_secs(10)).await.unwrap();
        store.put("/k", "v1", Some(first)).await.unwrap();
        store.put("/k", "v2", Some(second)).await.unwrap();

        let kv = store.get("/k").await.unwrap().expect("key should exist");
        assert_eq!(kv.value, "v2");
        assert_eq!(kv.lease, Some(second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_lease_expiry_does_not_remove_rebound_key() {
        let store = MemoryLeaseStore::new();
        let first = store.grant_lease(Duration::from_secs(5)).await.unwrap();
        store.put("/k", "v1", Some(first)).await.unwrap();
        let second = store.grant_lease(Duration::from_secs(60)).await.unwrap();
        store.put("/k", "v2", Some(second)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.get("/k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_watch_receives_put_and_delete() {
        let store = MemoryLeaseStore::new();
        let mut stream = store.watch("/users/").await.unwrap();

        store.put("/users/u1/d1", "gw|1", None).await.unwrap();
        store.put("/other/x", "ignored", None).await.unwrap();
        store.delete("/users/u1/d1").await.unwrap();

        let put = stream.next().await.unwrap().unwrap();
        assert_eq!(put.kind, StoreEventKind::Put);
        assert_eq!(put.value, "gw|1");

        let del = stream.next().await.unwrap().unwrap();
        assert_eq!(del.kind, StoreEventKind::Delete);
        assert_eq!(del.key, "/users/u1/d1");
        assert!(del.value.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_sees_expiry_delete() {
        let store = MemoryLeaseStore::new();
        let lease = store.grant_lease(Duration::from_secs(1)).await.unwrap();
        store.put("/users/u1/d1", "gw|1", Some(lease)).await.unwrap();
        let mut stream = store.watch("/users/").await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired().await, 1);

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.kind, StoreEventKind::Delete);
    }

    #[tokio::test]
    async fn test_disconnect_ends_streams() {
        let store = MemoryLeaseStore::new();
        let mut stream = store.watch("/").await.unwrap();
        assert_eq!(store.watcher_count().await, 1);

        store.disconnect_watchers().await;
        assert!(stream.next().await.is_none());
        assert_eq!(store.watcher_count().await, 0);
    }

    #[tokio::test]
    async fn test_unavailable_and_closed() {
        let store = MemoryLeaseStore::new();
        store.set_available(false).await;
        assert!(matches!(
            store.prefix_get("/").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_available(true).await;
        assert_ok!(store.prefix_get("/").await);

        store.close().await.unwrap();
        assert_eq!(store.delete("/k").await, Err(StoreError::Closed));
    }

    #[tokio::test]
    async fn test_delete_if_lease_spares_rebound_key() {
        let store = MemoryLeaseStore::new();
        let old = store.grant_lease(Duration::from_secs(10)).await.unwrap();
        let new = store.grant_lease(Duration::from_secs(10)).await.unwrap();
        store.put("/k", "gw-1|1", Some(old)).await.unwrap();
        store.put("/k", "gw-2|2", Some(new)).await.unwrap();

        assert!(!store.delete_if_lease("/k", old).await.unwrap());
        assert_eq!(store.get("/k").await.unwrap().unwrap().value, "gw-2|2");

        assert!(store.delete_if_lease("/k", new).await.unwrap());
        assert!(store.get("/k").await.unwrap().is_none());
        assert!(!store.delete_if_lease("/k", new).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_absent_key() {
        let store = MemoryLeaseStore::new();
        assert!(!store.delete("/missing").await.unwrap());
    }
}
