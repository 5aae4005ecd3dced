//! In-memory dead-letter sink.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::DeadLetterSink;
use crate::log::Record;

/// A payload the worker gave up on.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
    pub reason: String,
    pub received_at: DateTime<Utc>,
}

/// Keeps dead letters in memory for inspection.
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn send(&self, record: &Record, reason: &str) -> Result<(), String> {
        tracing::warn!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            reason = %reason,
            "Payload dead-lettered"
        );
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(DeadLetter {
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
                payload: record.payload.clone(),
                reason: reason.to_string(),
                received_at: Utc::now(),
            });
        Ok(())
    }
}
