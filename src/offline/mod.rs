//! Offline message pipeline.
//!
//! Messages for users without a live connection are produced onto a
//! partitioned log. [`OfflineWorker`] consumes them in batches, filters out
//! messages already handled through the ack path, persists the rest in one
//! atomic write, and only then commits the log offset.
//!
//! The storage, dedup and dead-letter collaborators are narrow traits so any
//! backend can be plugged in; memory implementations live alongside.

pub mod dead_letter;
pub mod dedup;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod retry;
pub mod worker;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DatabaseError, DedupError};
use crate::log::Record;

pub use dead_letter::MemoryDeadLetterSink;
pub use dedup::MemoryDedupStore;
pub use memory::MemoryOfflineStore;
pub use worker::{OfflineWorker, WorkerStats};

/// Kind of conversation a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Private,
    Group,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationType::Private => "private",
            ConversationType::Group => "group",
        }
    }
}

impl std::fmt::Display for ConversationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConversationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(ConversationType::Private),
            "group" => Ok(ConversationType::Group),
            other => Err(format!("unknown conversation type '{}'", other)),
        }
    }
}

/// A message awaiting offline delivery, as carried on the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineMessageEvent {
    pub msg_id: String,
    /// Recipient.
    pub user_id: String,
    pub sender_id: String,
    pub conversation_id: String,
    pub conversation_type: ConversationType,
    pub content: String,
    /// Per-conversation sequence for client-side ordering. Passed through.
    pub sequence: i64,
    /// Send time, Unix milliseconds.
    pub timestamp: i64,
}

impl OfflineMessageEvent {
    /// Decode a log payload. Missing ids count as malformed.
    pub fn decode(payload: &[u8]) -> Result<Self, String> {
        let event: Self = serde_json::from_slice(payload).map_err(|e| e.to_string())?;
        if event.msg_id.trim().is_empty() {
            return Err("msg_id is empty".to_string());
        }
        if event.user_id.trim().is_empty() {
            return Err("user_id is empty".to_string());
        }
        Ok(event)
    }

    pub fn encode(&self) -> Vec<u8> {
        // Serializing plain strings and integers cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Storage form of this event, expiring `ttl` after `now`.
    pub fn into_record(self, now: DateTime<Utc>, ttl: Duration) -> StorageRecord {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        StorageRecord {
            msg_id: self.msg_id,
            user_id: self.user_id,
            sender_id: self.sender_id,
            conversation_id: self.conversation_id,
            conversation_type: self.conversation_type,
            content: self.content,
            sequence: self.sequence,
            timestamp: self.timestamp,
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

/// Row written to the durable message store. `msg_id` is the primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRecord {
    pub msg_id: String,
    pub user_id: String,
    pub sender_id: String,
    pub conversation_id: String,
    pub conversation_type: ConversationType,
    pub content: String,
    pub sequence: i64,
    pub timestamp: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Durable message store.
#[async_trait]
pub trait OfflineStorer: Send + Sync {
    /// Persist every record or none of them. Records whose `msg_id` is
    /// already stored are skipped without failing the batch.
    async fn batch_insert(&self, records: &[StorageRecord]) -> Result<(), DatabaseError>;
}

/// Fast TTL-scoped check-and-mark cache shared with the ack path.
#[async_trait]
pub trait DedupChecker: Send + Sync {
    /// Whether `msg_id` was already handled.
    async fn check_duplicate(&self, msg_id: &str) -> Result<bool, DedupError>;

    /// Record `msg_id` as handled.
    async fn mark_processed(&self, msg_id: &str) -> Result<(), DedupError>;
}

/// Destination for payloads the worker cannot decode.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, record: &Record, reason: &str) -> Result<(), String>;
}
