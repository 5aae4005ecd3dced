//! Lease store abstraction.
//!
//! The presence registry only needs an etcd-like subset: TTL leases attached
//! to keys, keep-alive, prefix scan, and a prefix watch stream. Backends
//! implement [`LeaseStore`]; [`memory::MemoryLeaseStore`] is the in-process one.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use memory::MemoryLeaseStore;

/// Lease identifier issued by the store. Valid ids are positive.
pub type LeaseId = i64;

/// A stored key and its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Lease the key is attached to, if any.
    pub lease: Option<LeaseId>,
}

/// Kind of mutation reported by a watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreEventKind {
    Put,
    Delete,
}

/// A raw change event from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEvent {
    pub kind: StoreEventKind,
    pub key: String,
    /// Empty for deletes.
    pub value: String,
}

/// Stream of change events for a watched prefix. The stream ending, or
/// yielding an error, means the subscription is gone.
pub type WatchStream = BoxStream<'static, Result<StoreEvent, StoreError>>;

/// Strongly consistent key-value store with TTL leases.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Grant a lease that expires after `ttl` unless renewed.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, StoreError>;

    /// Renew a lease once, resetting its expiry to now + TTL.
    async fn keep_alive_once(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// Write `value` under `key`, attached to `lease` when given.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<(), StoreError>;

    /// Read a single key.
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError>;

    /// Read every key starting with `prefix`.
    async fn prefix_get(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete a key only while it is still attached to `lease`, in one
    /// atomic step (an etcd transaction comparing the key's lease).
    /// Returns whether it was deleted.
    async fn delete_if_lease(&self, key: &str, lease: LeaseId) -> Result<bool, StoreError>;

    /// Subscribe to changes under `prefix` from the current revision on.
    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError>;

    /// Release the connection. Later calls fail with [`StoreError::Closed`].
    async fn close(&self) -> Result<(), StoreError>;
}
