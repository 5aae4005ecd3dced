//! Offline message worker.
//!
//! Each claimed partition runs its own consume loop with a private batch:
//!
//! ```text
//! Accumulating ──(batch_size reached | batch_timeout | cancel)──► Flushing
//!      ▲                                                           │
//!      └──────────────── Committed ◄── insert ok ─────────────────┤
//!                                                                  ▼
//!                                      Failed (retries exhausted, no commit,
//!                                      session ends, log redelivers)
//! ```
//!
//! Offsets are marked only after the batch holding them is durable, so a
//! crash or failed flush never loses a message. Duplicates introduced by
//! redelivery are filtered by the dedup check and by the store's primary key.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::retry::{RetryOutcome, RetryPolicy};
use super::{DeadLetterSink, DedupChecker, OfflineMessageEvent, OfflineStorer, StorageRecord};
use crate::config::WorkerConfig;
use crate::error::{ConfigError, Error, WorkerError};
use crate::log::{Claim, ConsumerGroup, ConsumerGroupHandler, GroupSession, Record, mark_record};
use crate::shutdown::wait_cancelled;

/// Pause before re-joining the group after a failed session.
const REJOIN_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on how long `stop` waits for in-flight work.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Snapshot of worker activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStats {
    /// Decoded events that reached a flush.
    pub messages_processed: u64,
    /// Events dropped because the dedup store had already seen them.
    pub messages_deduplicated: u64,
    /// Events written by successful batch inserts.
    pub messages_persisted: u64,
    /// Successful batch inserts.
    pub batch_writes: u64,
    /// Failed flushes (retries exhausted, interrupted, or commit failed).
    pub errors: u64,
    /// Payloads that could not be decoded.
    pub malformed: u64,
    /// Malformed payloads accepted by the dead-letter sink.
    pub dead_lettered: u64,
    /// `messages_persisted / batch_writes`.
    pub avg_batch_size: f64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: u64,
    deduplicated: u64,
    persisted: u64,
    batch_writes: u64,
    errors: u64,
    malformed: u64,
    dead_lettered: u64,
}

impl Counters {
    fn snapshot(&self) -> WorkerStats {
        let avg_batch_size = if self.batch_writes > 0 {
            self.persisted as f64 / self.batch_writes as f64
        } else {
            0.0
        };
        WorkerStats {
            messages_processed: self.processed,
            messages_deduplicated: self.deduplicated,
            messages_persisted: self.persisted,
            batch_writes: self.batch_writes,
            errors: self.errors,
            malformed: self.malformed,
            dead_lettered: self.dead_lettered,
            avg_batch_size,
        }
    }
}

/// Events accumulated from one partition, awaiting a single write.
#[derive(Debug)]
pub struct Batch {
    topic: String,
    partition: i32,
    events: Vec<OfflineMessageEvent>,
    /// Highest offset covered by this batch, malformed records included.
    high_water: Option<i64>,
}

impl Batch {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
            events: Vec::new(),
            high_water: None,
        }
    }

    /// Append an event read at `offset`.
    pub fn push(&mut self, offset: i64, event: OfflineMessageEvent) {
        self.events.push(event);
        self.cover(offset);
    }

    /// Extend the committed range to `offset` without adding an event.
    fn cover(&mut self, offset: i64) {
        self.high_water = Some(self.high_water.map_or(offset, |hw| hw.max(offset)));
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[OfflineMessageEvent] {
        &self.events
    }

    fn reset(&mut self) {
        self.events.clear();
        self.high_water = None;
    }
}

/// The consumer-group handler: owns collaborators and counters.
struct Pipeline {
    config: WorkerConfig,
    retry: RetryPolicy,
    store: Arc<dyn OfflineStorer>,
    dedup: Arc<dyn DedupChecker>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    counters: Mutex<Counters>,
}

impl Pipeline {
    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dedup, persist with retry, mark processed, then commit.
    async fn process_batch(
        &self,
        session: &dyn GroupSession,
        batch: &Batch,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), WorkerError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.counters().processed += batch.len() as u64;

        let mut unique = Vec::with_capacity(batch.len());
        let mut duplicates = 0u64;
        for event in batch.events() {
            match self.dedup.check_duplicate(&event.msg_id).await {
                Ok(true) => duplicates += 1,
                Ok(false) => unique.push(event.clone()),
                Err(e) => {
                    tracing::warn!(
                        msg_id = %event.msg_id,
                        error = %WorkerError::from(e),
                        "Dedup check failed, keeping message"
                    );
                    unique.push(event.clone());
                }
            }
        }
        if duplicates > 0 {
            self.counters().deduplicated += duplicates;
        }

        if unique.is_empty() {
            tracing::debug!(
                topic = %batch.topic,
                partition = batch.partition,
                size = batch.len(),
                "Batch was entirely duplicates, committing without write"
            );
            return self.commit(session, batch).await;
        }

        let now = Utc::now();
        let records: Vec<StorageRecord> = unique
            .into_iter()
            .map(|event| event.into_record(now, self.config.message_ttl))
            .collect();

        let outcome = self
            .retry
            .run(cancel, || self.store.batch_insert(&records))
            .await;
        match outcome {
            RetryOutcome::Succeeded { attempts } => {
                {
                    let mut counters = self.counters();
                    counters.batch_writes += 1;
                    counters.persisted += records.len() as u64;
                }
                tracing::debug!(
                    topic = %batch.topic,
                    partition = batch.partition,
                    persisted = records.len(),
                    attempts,
                    "Batch persisted"
                );
            }
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                self.counters().errors += 1;
                tracing::error!(
                    topic = %batch.topic,
                    partition = batch.partition,
                    size = records.len(),
                    attempts,
                    error = %last_error,
                    "Batch insert failed, leaving offsets uncommitted"
                );
                return Err(WorkerError::BatchPersistFailure {
                    size: records.len(),
                    attempts,
                    reason: last_error,
                });
            }
            RetryOutcome::Interrupted { attempts, last_error } => {
                self.counters().errors += 1;
                tracing::warn!(
                    topic = %batch.topic,
                    partition = batch.partition,
                    attempts,
                    error = %last_error,
                    "Batch insert abandoned on shutdown"
                );
                return Err(WorkerError::Interrupted { attempts });
            }
        }

        for record in &records {
            if let Err(e) = self.dedup.mark_processed(&record.msg_id).await {
                tracing::warn!(msg_id = %record.msg_id, error = %e, "Failed to mark message processed");
            }
        }

        self.commit(session, batch).await
    }

    async fn commit(&self, session: &dyn GroupSession, batch: &Batch) -> Result<(), WorkerError> {
        if let Some(offset) = batch.high_water {
            session.mark_offset(&batch.topic, batch.partition, offset + 1);
        }
        if let Err(e) = session.commit().await {
            self.counters().errors += 1;
            return Err(e.into());
        }
        Ok(())
    }

    /// Handle an undecodable record: dead-letter it if a sink is installed,
    /// and make sure its offset gets committed.
    async fn reject(
        &self,
        session: &dyn GroupSession,
        batch: &mut Batch,
        record: &Record,
        reason: String,
    ) {
        let err = WorkerError::MalformedPayload {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            reason,
        };
        tracing::warn!(error = %err, "Dropping malformed payload");
        self.counters().malformed += 1;

        if let Some(sink) = &self.dead_letter {
            match sink.send(record, &err.to_string()).await {
                Ok(()) => self.counters().dead_lettered += 1,
                Err(e) => tracing::warn!(offset = record.offset, error = %e, "Dead-letter send failed"),
            }
        }

        if batch.is_empty() {
            mark_record(session, record);
            if let Err(e) = session.commit().await {
                tracing::warn!(offset = record.offset, error = %e, "Commit after malformed payload failed");
            }
        } else {
            // Committed together with the events ahead of it.
            batch.cover(record.offset);
        }
    }
}

#[async_trait]
impl ConsumerGroupHandler for Pipeline {
    async fn setup(&self, session: &dyn GroupSession) -> Result<(), Error> {
        tracing::info!(
            member_id = %session.member_id(),
            generation = session.generation(),
            "Offline worker joined consumer group"
        );
        Ok(())
    }

    async fn cleanup(&self, session: &dyn GroupSession) -> Result<(), Error> {
        tracing::info!(
            member_id = %session.member_id(),
            generation = session.generation(),
            "Offline worker session ended"
        );
        Ok(())
    }

    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        mut claim: Claim,
    ) -> Result<(), Error> {
        tracing::debug!(
            topic = %claim.topic(),
            partition = claim.partition(),
            offset = claim.initial_offset(),
            "Consuming partition"
        );

        let mut cancel = session.cancelled();
        let mut batch = Batch::new(claim.topic(), claim.partition());
        let timeout = self.config.batch_timeout;
        let timer = tokio::time::sleep(timeout);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = wait_cancelled(&mut cancel) => break,
                _ = &mut timer => {
                    if !batch.is_empty() {
                        self.process_batch(session.as_ref(), &batch, &mut cancel).await?;
                        batch.reset();
                    }
                    timer.as_mut().reset(Instant::now() + timeout);
                }
                record = claim.next() => {
                    let Some(record) = record else { break };
                    match OfflineMessageEvent::decode(&record.payload) {
                        Ok(event) => batch.push(record.offset, event),
                        Err(reason) => {
                            self.reject(session.as_ref(), &mut batch, &record, reason).await;
                            continue;
                        }
                    }
                    if batch.len() >= self.config.batch_size {
                        self.process_batch(session.as_ref(), &batch, &mut cancel).await?;
                        batch.reset();
                        timer.as_mut().reset(Instant::now() + timeout);
                    }
                }
            }
        }

        // Final flush on revoke or shutdown. A failure leaves the offsets
        // uncommitted for the next owner.
        if !batch.is_empty()
            && let Err(e) = self
                .process_batch(session.as_ref(), &batch, &mut cancel)
                .await
        {
            tracing::warn!(
                topic = %claim.topic(),
                partition = claim.partition(),
                pending = batch.len(),
                error = %e,
                "Final flush failed"
            );
        }
        Ok(())
    }
}

enum WorkerState {
    Idle,
    Running(JoinHandle<()>),
    Stopped,
}

/// Consumes offline messages from a consumer group into durable storage.
pub struct OfflineWorker {
    consumer: Arc<dyn ConsumerGroup>,
    pipeline: Arc<Pipeline>,
    shutdown: watch::Sender<bool>,
    state: Mutex<WorkerState>,
}

impl OfflineWorker {
    /// Build a worker. Nothing is consumed until [`start`](Self::start).
    pub fn new(
        config: WorkerConfig,
        consumer: Arc<dyn ConsumerGroup>,
        store: Arc<dyn OfflineStorer>,
        dedup: Arc<dyn DedupChecker>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            consumer,
            pipeline: Arc::new(Pipeline {
                retry: RetryPolicy::from_config(&config),
                config,
                store,
                dedup,
                dead_letter: None,
                counters: Mutex::new(Counters::default()),
            }),
            shutdown,
            state: Mutex::new(WorkerState::Idle),
        })
    }

    /// Send malformed payloads to `sink` before dropping them. Fails with
    /// `AlreadyStarted` once [`start`](Self::start) has been called.
    pub fn with_dead_letter(mut self, sink: Arc<dyn DeadLetterSink>) -> Result<Self, WorkerError> {
        if !matches!(*self.state(), WorkerState::Idle) {
            return Err(WorkerError::AlreadyStarted);
        }
        let pipeline = Arc::get_mut(&mut self.pipeline).ok_or(WorkerError::AlreadyStarted)?;
        pipeline.dead_letter = Some(sink);
        Ok(self)
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.pipeline.config
    }

    fn state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state(), WorkerState::Running(_))
    }

    /// Join the consumer group and consume in the background. Sessions that
    /// end in error are re-joined after a short pause. A worker runs once.
    pub fn start(&self) -> Result<(), WorkerError> {
        let mut state = self.state();
        if !matches!(*state, WorkerState::Idle) {
            return Err(WorkerError::AlreadyStarted);
        }

        let consumer = Arc::clone(&self.consumer);
        let handler: Arc<dyn ConsumerGroupHandler> = self.pipeline.clone();
        let topics = self.pipeline.config.topics.clone();
        let group_id = self.pipeline.config.group_id.clone();
        let mut shutdown = self.shutdown.subscribe();

        let task = tokio::spawn(async move {
            tracing::info!(group_id = %group_id, topics = ?topics, "Offline worker started");
            while !*shutdown.borrow() {
                match consumer
                    .consume(&topics, Arc::clone(&handler), shutdown.clone())
                    .await
                {
                    Ok(()) => tracing::debug!(group_id = %group_id, "Consumer session finished"),
                    Err(e) => {
                        tracing::warn!(group_id = %group_id, error = %e, "Consumer session failed, re-joining");
                        tokio::select! {
                            _ = wait_cancelled(&mut shutdown) => break,
                            _ = tokio::time::sleep(REJOIN_DELAY) => {}
                        }
                    }
                }
            }
            tracing::info!(group_id = %group_id, "Offline worker loop exited");
        });

        *state = WorkerState::Running(task);
        Ok(())
    }

    /// Signal shutdown, wait for every claim to finish its final flush, then
    /// leave the consumer group.
    pub async fn stop(&self) -> Result<(), WorkerError> {
        let task = {
            let mut state = self.state();
            match std::mem::replace(&mut *state, WorkerState::Stopped) {
                WorkerState::Running(task) => task,
                previous => {
                    *state = previous;
                    return Err(WorkerError::NotRunning);
                }
            }
        };

        self.shutdown.send_replace(true);
        let joined = tokio::time::timeout(STOP_TIMEOUT, task).await;

        self.consumer.close().await?;

        match joined {
            Ok(Ok(())) => {
                tracing::info!("Offline worker stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Offline worker task ended abnormally");
                Ok(())
            }
            Err(_) => Err(WorkerError::StopTimeout {
                timeout: STOP_TIMEOUT,
            }),
        }
    }

    /// Flush one batch through the full dedup / persist / commit path.
    pub async fn process_batch(
        &self,
        session: &dyn GroupSession,
        batch: &Batch,
    ) -> Result<(), WorkerError> {
        let mut cancel = session.cancelled();
        self.pipeline.process_batch(session, batch, &mut cancel).await
    }

    pub fn stats(&self) -> WorkerStats {
        self.pipeline.counters().snapshot()
    }
}

impl Drop for OfflineWorker {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
