//! Partitioned log consumer-group abstraction.
//!
//! Mirrors the Kafka consumer-group model:
//!
//! ```text
//! ConsumerGroup::consume(topics, handler)      one call = one session
//!   ├─ handler.setup(session)
//!   ├─ handler.consume_claim(session, claim)    one task per partition
//!   │     claim.next() ─► record ─► session.mark_offset() ─► session.commit()
//!   └─ handler.cleanup(session)
//! ```
//!
//! Offsets are committed manually. A session ends on shutdown, on rebalance,
//! or when a claim fails; the next session resumes from the last commit.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::error::{Error, LogError};

pub use memory::{MemoryConsumerGroup, MemoryLog};

/// One record read from a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// A consumer-group session shared by all claims of one generation.
#[async_trait]
pub trait GroupSession: Send + Sync {
    /// Member id assigned to this consumer.
    fn member_id(&self) -> &str;

    /// Generation number of this session.
    fn generation(&self) -> i32;

    /// Record `next_offset` as the position to resume `topic/partition` from.
    /// Marks only move forward and take effect on the next [`commit`].
    ///
    /// [`commit`]: GroupSession::commit
    fn mark_offset(&self, topic: &str, partition: i32, next_offset: i64);

    /// Synchronously commit all marked offsets.
    async fn commit(&self) -> Result<(), LogError>;

    /// Receiver that flips to `true` when the session is ending.
    fn cancelled(&self) -> watch::Receiver<bool>;
}

/// Mark a record as consumed.
pub fn mark_record(session: &dyn GroupSession, record: &Record) {
    session.mark_offset(&record.topic, record.partition, record.offset + 1);
}

/// Records of one partition assigned to this member for one session.
pub struct Claim {
    topic: String,
    partition: i32,
    initial_offset: i64,
    messages: mpsc::Receiver<Record>,
}

impl Claim {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        initial_offset: i64,
        messages: mpsc::Receiver<Record>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            initial_offset,
            messages,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Offset the claim started consuming from.
    pub fn initial_offset(&self) -> i64 {
        self.initial_offset
    }

    /// Next record, or `None` once the claim is revoked.
    pub async fn next(&mut self) -> Option<Record> {
        self.messages.recv().await
    }
}

/// Callbacks driven by a consumer group for each session.
#[async_trait]
pub trait ConsumerGroupHandler: Send + Sync {
    /// Runs before any claim is consumed.
    async fn setup(&self, _session: &dyn GroupSession) -> Result<(), Error> {
        Ok(())
    }

    /// Runs after every claim has returned.
    async fn cleanup(&self, _session: &dyn GroupSession) -> Result<(), Error> {
        Ok(())
    }

    /// Consume one partition until the claim ends or the session is cancelled.
    /// Returning an error ends the session without further commits.
    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        claim: Claim,
    ) -> Result<(), Error>;
}

/// A consumer-group client.
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Join the group and run one session over `topics`, returning when the
    /// session ends. Callers loop on this to survive rebalances.
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ConsumerGroupHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), Error>;

    /// Leave the group.
    async fn close(&self) -> Result<(), LogError>;
}
