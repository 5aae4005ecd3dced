//! In-process partitioned log with consumer-group offset tracking.
//!
//! Each [`ConsumerGroup::consume`] call is one session in which this member
//! claims every partition of the requested topics. Records are fed from the
//! group's committed offset, so anything not committed before a session ends
//! is delivered again in the next one.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use uuid::Uuid;

use super::{Claim, ConsumerGroup, ConsumerGroupHandler, GroupSession, Record};
use crate::error::{Error, LogError};
use crate::shutdown::wait_cancelled;

/// Records buffered between a partition feeder and its claim.
const CLAIM_BUFFER: usize = 256;

/// Records read from a partition per lock acquisition.
const FEED_CHUNK: usize = 64;

#[derive(Default)]
struct LogState {
    topics: HashMap<String, Vec<Vec<Record>>>,
    /// (group, topic, partition) -> next offset to consume.
    committed: HashMap<(String, String, i32), i64>,
}

struct LogInner {
    state: Mutex<LogState>,
    /// Bumped on every append so idle feeders wake up.
    head: watch::Sender<u64>,
    round_robin: AtomicU64,
}

/// An ordered, partitioned, replayable log.
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<LogInner>,
}

impl MemoryLog {
    pub fn new() -> Self {
        let (head, _) = watch::channel(0);
        Self {
            inner: Arc::new(LogInner {
                state: Mutex::new(LogState::default()),
                head,
                round_robin: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a topic with `partitions` partitions. Existing topics are kept.
    pub fn create_topic(&self, name: &str, partitions: usize) {
        let mut state = self.lock();
        state
            .topics
            .entry(name.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1)]);
    }

    /// Append a record. Keyed records always land on the same partition;
    /// unkeyed ones are spread round-robin. Returns `(partition, offset)`.
    pub fn produce(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(i32, i64), LogError> {
        let partitions = self.partition_count(topic)?;
        let partition = match key {
            Some(k) => {
                let mut hasher = DefaultHasher::new();
                k.hash(&mut hasher);
                (hasher.finish() % partitions as u64) as i32
            }
            None => {
                (self.inner.round_robin.fetch_add(1, Ordering::Relaxed) % partitions as u64) as i32
            }
        };
        self.produce_to(topic, partition, key, payload)
    }

    /// Append a record to a specific partition.
    pub fn produce_to(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(i32, i64), LogError> {
        let offset = {
            let mut state = self.lock();
            let records = state
                .topics
                .get_mut(topic)
                .and_then(|parts| parts.get_mut(partition as usize))
                .ok_or_else(|| LogError::UnknownTopic(format!("{}/{}", topic, partition)))?;
            let offset = records.len() as i64;
            records.push(Record {
                topic: topic.to_string(),
                partition,
                offset,
                key: key.map(<[u8]>::to_vec),
                payload: payload.into(),
                timestamp: Utc::now(),
            });
            offset
        };
        self.inner.head.send_modify(|v| *v += 1);
        Ok((partition, offset))
    }

    /// Number of partitions in `topic`.
    pub fn partition_count(&self, topic: &str) -> Result<usize, LogError> {
        self.lock()
            .topics
            .get(topic)
            .map(Vec::len)
            .ok_or_else(|| LogError::UnknownTopic(topic.to_string()))
    }

    /// Offset one past the last record of a partition.
    pub fn end_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.lock()
            .topics
            .get(topic)
            .and_then(|parts| parts.get(partition as usize))
            .map(|records| records.len() as i64)
    }

    /// Next offset `group` will consume from `topic/partition`, if it has
    /// ever committed.
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// A consumer-group member bound to this log.
    pub fn consumer_group(&self, group_id: &str) -> MemoryConsumerGroup {
        MemoryConsumerGroup {
            log: self.clone(),
            group_id: group_id.to_string(),
            member_id: format!("{}-{}", group_id, Uuid::new_v4()),
            generation: AtomicI32::new(0),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn read_from(&self, topic: &str, partition: i32, from: i64, max: usize) -> Vec<Record> {
        let state = self.lock();
        state
            .topics
            .get(topic)
            .and_then(|parts| parts.get(partition as usize))
            .map(|records| {
                records
                    .iter()
                    .skip(from.max(0) as usize)
                    .take(max)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn commit(&self, group: &str, marks: &HashMap<(String, i32), i64>) {
        let mut state = self.lock();
        for ((topic, partition), next) in marks {
            let slot = state
                .committed
                .entry((group.to_string(), topic.clone(), *partition))
                .or_insert(0);
            if *next > *slot {
                *slot = *next;
            }
        }
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

struct MemorySession {
    log: MemoryLog,
    group_id: String,
    member_id: String,
    generation: i32,
    marks: Mutex<HashMap<(String, i32), i64>>,
    cancel: watch::Receiver<bool>,
    group_closed: Arc<AtomicBool>,
}

#[async_trait]
impl GroupSession for MemorySession {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    fn generation(&self) -> i32 {
        self.generation
    }

    fn mark_offset(&self, topic: &str, partition: i32, next_offset: i64) {
        let mut marks = self.marks.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = marks.entry((topic.to_string(), partition)).or_insert(0);
        if next_offset > *slot {
            *slot = next_offset;
        }
    }

    async fn commit(&self) -> Result<(), LogError> {
        if self.group_closed.load(Ordering::SeqCst) {
            return Err(LogError::Closed {
                group: self.group_id.clone(),
            });
        }
        let marks = self
            .marks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        self.log.commit(&self.group_id, &marks);
        Ok(())
    }

    fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel.clone()
    }
}

/// A single member of a consumer group on a [`MemoryLog`].
pub struct MemoryConsumerGroup {
    log: MemoryLog,
    group_id: String,
    member_id: String,
    generation: AtomicI32,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl ConsumerGroup for MemoryConsumerGroup {
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ConsumerGroupHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LogError::Closed {
                group: self.group_id.clone(),
            }
            .into());
        }

        let mut assignments = Vec::new();
        for topic in topics {
            let partitions = self.log.partition_count(topic)?;
            for partition in 0..partitions as i32 {
                let start = self
                    .log
                    .committed_offset(&self.group_id, topic, partition)
                    .unwrap_or(0);
                assignments.push((topic.clone(), partition, start));
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let session = Arc::new(MemorySession {
            log: self.log.clone(),
            group_id: self.group_id.clone(),
            member_id: self.member_id.clone(),
            generation,
            marks: Mutex::new(HashMap::new()),
            cancel: cancel_rx.clone(),
            group_closed: Arc::clone(&self.closed),
        });

        tracing::debug!(
            group = %self.group_id,
            generation,
            claims = assignments.len(),
            "Consumer group session starting"
        );
        handler.setup(session.as_ref()).await?;

        let mut feeders = JoinSet::new();
        let mut claims = JoinSet::new();
        for (topic, partition, start) in assignments {
            let (tx, rx) = mpsc::channel(CLAIM_BUFFER);
            feeders.spawn(feed_partition(
                self.log.clone(),
                topic.clone(),
                partition,
                start,
                tx,
                cancel_rx.clone(),
            ));

            let handler = Arc::clone(&handler);
            let session: Arc<dyn GroupSession> = session.clone();
            let claim = Claim::new(topic.clone(), partition, start, rx);
            claims.spawn(async move {
                let result = handler.consume_claim(session, claim).await;
                (topic, partition, result)
            });
        }

        let mut failure: Option<LogError> = None;
        loop {
            tokio::select! {
                _ = wait_cancelled(&mut shutdown), if !*cancel_tx.borrow() => {
                    cancel_tx.send_replace(true);
                }
                joined = claims.join_next() => match joined {
                    None => break,
                    Some(Ok((_, _, Ok(())))) => {}
                    Some(Ok((topic, partition, Err(e)))) => {
                        tracing::warn!(
                            topic = %topic,
                            partition,
                            error = %e,
                            "Claim failed, ending session"
                        );
                        failure.get_or_insert(LogError::ClaimFailed {
                            topic,
                            partition,
                            reason: e.to_string(),
                        });
                        cancel_tx.send_replace(true);
                    }
                    Some(Err(join_err)) => {
                        tracing::error!(error = %join_err, "Claim task aborted");
                        failure.get_or_insert(LogError::ClaimFailed {
                            topic: String::new(),
                            partition: -1,
                            reason: join_err.to_string(),
                        });
                        cancel_tx.send_replace(true);
                    }
                }
            }
        }

        cancel_tx.send_replace(true);
        while feeders.join_next().await.is_some() {}

        handler.cleanup(session.as_ref()).await?;
        tracing::debug!(group = %self.group_id, generation, "Consumer group session ended");

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), LogError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

async fn feed_partition(
    log: MemoryLog,
    topic: String,
    partition: i32,
    mut next: i64,
    tx: mpsc::Sender<Record>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut head = log.inner.head.subscribe();
    loop {
        head.borrow_and_update();
        let records = log.read_from(&topic, partition, next, FEED_CHUNK);

        if records.is_empty() {
            tokio::select! {
                _ = wait_cancelled(&mut cancel) => return,
                changed = head.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            continue;
        }

        for record in records {
            next = record.offset + 1;
            tokio::select! {
                _ = wait_cancelled(&mut cancel) => return,
                sent = tx.send(record) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
