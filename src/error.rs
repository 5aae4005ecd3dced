//! Error types for the presence registry and offline message worker.

use std::time::Duration;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Lease store error: {0}")]
    Store(#[from] StoreError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Log error: {0}")]
    Log(#[from] LogError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Dedup error: {0}")]
    Dedup(#[from] DedupError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Errors surfaced by a lease store backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Lease store unavailable: {0}")]
    Unavailable(String),

    #[error("Lease {lease_id} not found")]
    LeaseNotFound { lease_id: i64 },

    #[error("Lease {lease_id} expired")]
    LeaseExpired { lease_id: i64 },

    #[error("Lease store connection closed")]
    Closed,
}

/// Presence registry errors.
///
/// `StoreUnavailable` is never retried internally; heartbeat callers retry on
/// their own cadence.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("User {user_id} already has the maximum of {max} connected devices")]
    CapacityExceeded { user_id: String, max: usize },

    #[error("Lease {lease_id} not found; re-register the device")]
    LeaseNotFound { lease_id: i64 },

    #[error("Lease {lease_id} expired; re-register the device")]
    LeaseExpired { lease_id: i64 },

    #[error("Lease store unavailable: {0}")]
    StoreUnavailable(String),
}

impl RegistryError {
    /// Whether the caller should re-register instead of retrying renewal.
    pub fn lease_lost(&self) -> bool {
        matches!(
            self,
            RegistryError::LeaseNotFound { .. } | RegistryError::LeaseExpired { .. }
        )
    }
}

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LeaseNotFound { lease_id } => RegistryError::LeaseNotFound { lease_id },
            StoreError::LeaseExpired { lease_id } => RegistryError::LeaseExpired { lease_id },
            other => RegistryError::StoreUnavailable(other.to_string()),
        }
    }
}

/// Partitioned log / consumer-group errors.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Consumer group {group} is closed")]
    Closed { group: String },

    #[error("Offset commit failed: {0}")]
    CommitFailed(String),

    #[error("Claim {topic}/{partition} failed: {reason}")]
    ClaimFailed {
        topic: String,
        partition: i32,
        reason: String,
    },
}

/// Durable message store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[cfg(feature = "postgres")]
    #[error("Pool build error: {0}")]
    PoolBuild(#[from] deadpool_postgres::CreatePoolError),

    #[cfg(feature = "postgres")]
    #[error("Pool runtime error: {0}")]
    PoolRuntime(#[from] deadpool_postgres::PoolError),
}

/// Deduplication store errors. Always non-fatal to the worker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DedupError {
    #[error("Dedup store unavailable: {0}")]
    Unavailable(String),
}

/// Offline message worker errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker already started")]
    AlreadyStarted,

    #[error("Worker not running")]
    NotRunning,

    #[error("Batch of {size} records failed after {attempts} attempts: {reason}")]
    BatchPersistFailure {
        size: usize,
        attempts: u32,
        reason: String,
    },

    #[error("Batch persist aborted by shutdown after {attempts} attempts")]
    Interrupted { attempts: u32 },

    #[error("Dedup store unavailable: {0}")]
    DedupUnavailable(#[from] DedupError),

    #[error("Malformed payload at {topic}/{partition}@{offset}: {reason}")]
    MalformedPayload {
        topic: String,
        partition: i32,
        offset: i64,
        reason: String,
    },

    #[error("Worker task did not stop within {timeout:?}")]
    StopTimeout { timeout: Duration },

    #[error("Log error: {0}")]
    Log(#[from] LogError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
