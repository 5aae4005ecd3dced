//! Configuration for the presence registry, offline worker and database.
//!
//! Every value has a default matching production behaviour. Overrides come
//! from environment variables, optionally loaded from a `.env` file first.
//!
//! ```text
//! REGISTRY_LEASE_TTL_SECS=90        OFFLINE_BATCH_SIZE=100
//! REGISTRY_MAX_DEVICES_PER_USER=5   OFFLINE_RETRY_BACKOFF_SECS=1,2,4,8,16
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root key under which presence entries are stored.
pub const DEFAULT_KEY_PREFIX: &str = "/registry/";

/// Default lease TTL; gateways renew at a third of this.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(90);

/// Default cap on simultaneously connected devices per user.
pub const DEFAULT_MAX_DEVICES_PER_USER: usize = 5;

/// Sleep between watch re-subscriptions.
pub const DEFAULT_WATCH_BACKOFF: Duration = Duration::from_secs(1);

/// Presence registry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Root prefix for all registry keys (e.g. `/registry/`).
    pub key_prefix: String,
    /// Lease TTL granted on each registration.
    pub lease_ttl: Duration,
    /// Maximum live devices per user.
    pub max_devices_per_user: usize,
    /// Delay before a failed watch stream is re-subscribed.
    pub watch_backoff: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            lease_ttl: DEFAULT_LEASE_TTL,
            max_devices_per_user: DEFAULT_MAX_DEVICES_PER_USER,
            watch_backoff: DEFAULT_WATCH_BACKOFF,
        }
    }
}

impl RegistryConfig {
    /// Recommended heartbeat interval (a third of the TTL).
    pub fn renew_interval(&self) -> Duration {
        self.lease_ttl / 3
    }

    fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let mut key_prefix = lookup("REGISTRY_KEY_PREFIX").unwrap_or(defaults.key_prefix);
        if !key_prefix.ends_with('/') {
            key_prefix.push('/');
        }

        let config = Self {
            key_prefix,
            lease_ttl: Duration::from_secs(parse_var(
                lookup,
                "REGISTRY_LEASE_TTL_SECS",
                defaults.lease_ttl.as_secs(),
            )?),
            max_devices_per_user: parse_var(
                lookup,
                "REGISTRY_MAX_DEVICES_PER_USER",
                defaults.max_devices_per_user,
            )?,
            watch_backoff: Duration::from_millis(parse_var(
                lookup,
                "REGISTRY_WATCH_BACKOFF_MS",
                defaults.watch_backoff.as_millis() as u64,
            )?),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the registry cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_ttl.as_secs() == 0 {
            return Err(ConfigError::InvalidValue {
                key: "REGISTRY_LEASE_TTL_SECS".to_string(),
                message: "lease TTL must be at least one second".to_string(),
            });
        }
        if self.max_devices_per_user == 0 {
            return Err(ConfigError::InvalidValue {
                key: "REGISTRY_MAX_DEVICES_PER_USER".to_string(),
                message: "must allow at least one device".to_string(),
            });
        }
        Ok(())
    }
}

/// Offline message worker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Consumer group id.
    pub group_id: String,
    /// Topics carrying offline-routed messages.
    pub topics: Vec<String>,
    /// Flush once this many events are buffered.
    pub batch_size: usize,
    /// Flush a non-empty buffer after this long without a size trigger.
    pub batch_timeout: Duration,
    /// Retries after the first failed batch insert.
    pub max_retries: u32,
    /// Delay before each retry; the last entry repeats when exhausted.
    pub retry_backoff: Vec<Duration>,
    /// Lifetime of a persisted offline message.
    pub message_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            group_id: "offline-message-worker".to_string(),
            topics: vec!["offline-messages".to_string()],
            batch_size: 100,
            batch_timeout: Duration::from_secs(5),
            max_retries: 5,
            retry_backoff: [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec(),
            message_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl WorkerConfig {
    fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let retry_backoff = match lookup("OFFLINE_RETRY_BACKOFF_SECS") {
            Some(raw) => split_list(&raw)
                .into_iter()
                .map(|s| {
                    s.parse::<u64>()
                        .map(Duration::from_secs)
                        .map_err(|e| ConfigError::InvalidValue {
                            key: "OFFLINE_RETRY_BACKOFF_SECS".to_string(),
                            message: format!("'{}': {}", s, e),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => defaults.retry_backoff,
        };

        let config = Self {
            group_id: lookup("OFFLINE_GROUP_ID").unwrap_or(defaults.group_id),
            topics: lookup("OFFLINE_TOPICS")
                .map(|raw| split_list(&raw))
                .unwrap_or(defaults.topics),
            batch_size: parse_var(lookup, "OFFLINE_BATCH_SIZE", defaults.batch_size)?,
            batch_timeout: Duration::from_millis(parse_var(
                lookup,
                "OFFLINE_BATCH_TIMEOUT_MS",
                defaults.batch_timeout.as_millis() as u64,
            )?),
            max_retries: parse_var(lookup, "OFFLINE_MAX_RETRIES", defaults.max_retries)?,
            retry_backoff,
            message_ttl: Duration::from_secs(parse_var(
                lookup,
                "OFFLINE_MESSAGE_TTL_SECS",
                defaults.message_ttl.as_secs(),
            )?),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the worker cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "OFFLINE_BATCH_SIZE".to_string(),
                message: "batch size must be positive".to_string(),
            });
        }
        if self.batch_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "OFFLINE_BATCH_TIMEOUT_MS".to_string(),
                message: "batch timeout must be positive".to_string(),
            });
        }
        if self.topics.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "OFFLINE_TOPICS".to_string(),
                hint: "Set at least one topic to consume".to_string(),
            });
        }
        if self.group_id.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "OFFLINE_GROUP_ID".to_string(),
                hint: "Set the consumer group id".to_string(),
            });
        }
        Ok(())
    }
}

/// Durable message store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. `None` selects the in-memory store.
    pub url: Option<String>,
    /// Maximum pooled connections.
    pub pool_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool_size: 10,
        }
    }
}

impl DatabaseConfig {
    fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            url: lookup("DATABASE_URL").filter(|u| !u.is_empty()),
            pool_size: parse_var(lookup, "DATABASE_POOL_SIZE", defaults.pool_size)?,
        })
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub registry: RegistryConfig,
    pub worker: WorkerConfig,
    pub database: DatabaseConfig,
}

impl Config {
    /// Load from the process environment, reading `./.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Load from an explicit `.env` file. Process environment variables take
    /// precedence over values in the file.
    pub fn from_env_file(path: &Path) -> Result<Self, ConfigError> {
        let iter = dotenvy::from_path_iter(path)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;

        let mut file_vars = HashMap::new();
        for item in iter {
            let (key, value) =
                item.map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;
            file_vars.insert(key, value);
        }

        Self::from_lookup(&|key| {
            std::env::var(key)
                .ok()
                .or_else(|| file_vars.get(key).cloned())
        })
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            registry: RegistryConfig::from_lookup(lookup)?,
            worker: WorkerConfig::from_lookup(lookup)?,
            database: DatabaseConfig::from_lookup(lookup)?,
        })
    }
}

fn parse_var<T>(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{}': {}", raw, e),
            }),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(&|_| None).expect("defaults should load");
        assert_eq!(config, Config::default());
        assert_eq!(config.registry.lease_ttl, Duration::from_secs(90));
        assert_eq!(config.registry.renew_interval(), Duration::from_secs(30));
        assert_eq!(config.registry.max_devices_per_user, 5);
        assert_eq!(config.worker.batch_size, 100);
        assert_eq!(config.worker.batch_timeout, Duration::from_secs(5));
        assert_eq!(config.worker.max_retries, 5);
        assert_eq!(config.worker.message_ttl, Duration::from_secs(604_800));
        assert!(config.database.url.is_none());
    }

    #[test]
    fn test_overrides() {
        let lookup = lookup_from(&[
            ("REGISTRY_KEY_PREFIX", "/presence"),
            ("REGISTRY_LEASE_TTL_SECS", "30"),
            ("OFFLINE_TOPICS", "offline-a, offline-b"),
            ("OFFLINE_BATCH_SIZE", "10"),
            ("OFFLINE_RETRY_BACKOFF_SECS", "1,3"),
            ("DATABASE_URL", "postgres://localhost/im"),
        ]);
        let config = Config::from_lookup(&lookup).expect("overrides should load");

        assert_eq!(config.registry.key_prefix, "/presence/");
        assert_eq!(config.registry.lease_ttl, Duration::from_secs(30));
        assert_eq!(config.worker.topics, vec!["offline-a", "offline-b"]);
        assert_eq!(config.worker.batch_size, 10);
        assert_eq!(
            config.worker.retry_backoff,
            vec![Duration::from_secs(1), Duration::from_secs(3)]
        );
        assert_eq!(
            config.database.url.as_deref(),
            Some("postgres://localhost/im")
        );
    }

    #[test]
    fn test_invalid_number_names_the_key() {
        let lookup = lookup_from(&[("OFFLINE_BATCH_SIZE", "lots")]);
        match Config::from_lookup(&lookup) {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "OFFLINE_BATCH_SIZE"),
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let lookup = lookup_from(&[("OFFLINE_BATCH_SIZE", "0")]);
        assert!(Config::from_lookup(&lookup).is_err());
    }

    #[test]
    fn test_empty_topics_rejected() {
        let lookup = lookup_from(&[("OFFLINE_TOPICS", " , ")]);
        assert!(matches!(
            Config::from_lookup(&lookup),
            Err(ConfigError::MissingRequired { .. })
        ));
    }

    #[test]
    fn test_from_env_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "OFFLINE_GROUP_ID=file-group-for-test\nREGISTRY_WATCH_BACKOFF_MS=250\n",
        )
        .unwrap();

        let config = Config::from_env_file(&path).expect("env file should load");
        assert_eq!(config.worker.group_id, "file-group-for-test");
        assert_eq!(config.registry.watch_backoff, Duration::from_millis(250));
    }

    #[test]
    fn test_from_env_file_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("missing.env");
        assert!(matches!(
            Config::from_env_file(&path),
            Err(ConfigError::ParseError(_))
        ));
    }
}
