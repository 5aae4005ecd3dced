//! Presence registry: which gateway node serves each connected device.
//!
//! Every live connection is a leased key in the lease store:
//!
//! ```text
//! /registry/users/{user_id}/{device_id}  ->  "{gateway_node}|{connected_at}"
//! ```
//!
//! Gateways renew the lease every TTL/3 (see [`LeaseKeeper`]). A device that
//! stops renewing disappears when its lease lapses. Other nodes keep a local
//! view current through [`PresenceRegistry::watch`] (see [`PresenceCache`]).

pub mod cache;
pub mod keeper;
mod stats;
pub mod watch;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::RegistryConfig;
use crate::error::{ConfigError, RegistryError};
use crate::store::{LeaseId, LeaseStore};

pub use cache::PresenceCache;
pub use keeper::LeaseKeeper;
pub use stats::RegistryStats;
pub use watch::{WatchCallback, WatchEvent, WatchEventType};

use stats::RegistryCounters;
use watch::WatchLoop;

/// Where one of a user's devices is connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayLocation {
    /// Network address of the serving gateway.
    pub gateway_node: String,
    pub device_id: String,
    /// Unix seconds of the latest (re)registration.
    pub connected_at: i64,
}

/// Key layout under the registry root.
#[derive(Debug, Clone)]
pub(crate) struct KeyLayout {
    root: String,
    users_root: String,
}

impl KeyLayout {
    pub(crate) fn new(root: &str) -> Self {
        let mut root = root.to_string();
        if !root.ends_with('/') {
            root.push('/');
        }
        let users_root = format!("{}users/", root);
        Self { root, users_root }
    }

    fn user_prefix(&self, user_id: &str) -> String {
        format!("{}{}/", self.users_root, user_id)
    }

    fn device_key(&self, user_id: &str, device_id: &str) -> String {
        format!("{}{}/{}", self.users_root, user_id, device_id)
    }

    /// Split a device key into `(user_id, device_id)`.
    pub(crate) fn parse_key(&self, key: &str) -> Option<(String, String)> {
        let rest = key.strip_prefix(&self.users_root)?;
        let (user_id, device_id) = rest.split_once('/')?;
        if user_id.is_empty() || device_id.is_empty() || device_id.contains('/') {
            return None;
        }
        Some((user_id.to_string(), device_id.to_string()))
    }
}

/// Encode a registry value.
pub fn encode_value(gateway_node: &str, connected_at: i64) -> String {
    format!("{}|{}", gateway_node, connected_at)
}

/// Decode a registry value into `(gateway_node, connected_at)`.
///
/// The timestamp is the text after the last `|`, so gateway addresses may
/// themselves contain `|`.
pub fn decode_value(value: &str) -> Option<(String, i64)> {
    let (gateway, connected_at) = value.rsplit_once('|')?;
    if gateway.is_empty() {
        return None;
    }
    let connected_at = connected_at.parse::<i64>().ok()?;
    Some((gateway.to_string(), connected_at))
}

fn require(field: &str, value: &str) -> Result<(), RegistryError> {
    if value.trim().is_empty() {
        return Err(RegistryError::InvalidArgument(format!(
            "{} must not be empty",
            field
        )));
    }
    Ok(())
}

/// Identifiers become key segments, so they cannot contain the separator.
fn require_segment(field: &str, value: &str) -> Result<(), RegistryError> {
    require(field, value)?;
    if value.contains('/') {
        return Err(RegistryError::InvalidArgument(format!(
            "{} must not contain '/'",
            field
        )));
    }
    Ok(())
}

struct WatchHandle {
    stop: tokio::sync::watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Lease-backed presence registry.
///
/// Operations block on one round trip to the lease store and surface store
/// failures immediately; callers that heartbeat already retry on their own
/// cadence.
pub struct PresenceRegistry {
    store: Arc<dyn LeaseStore>,
    config: RegistryConfig,
    layout: KeyLayout,
    counters: Arc<Mutex<RegistryCounters>>,
    watchers: Mutex<HashMap<String, WatchHandle>>,
    closed_tx: tokio::sync::watch::Sender<bool>,
    closed: AtomicBool,
}

impl PresenceRegistry {
    /// Create a registry over `store`.
    pub fn new(store: Arc<dyn LeaseStore>, config: RegistryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (closed_tx, _) = tokio::sync::watch::channel(false);
        Ok(Self {
            store,
            layout: KeyLayout::new(&config.key_prefix),
            config,
            counters: Arc::new(Mutex::new(RegistryCounters::default())),
            watchers: Mutex::new(HashMap::new()),
            closed_tx,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn counters(&self) -> MutexGuard<'_, RegistryCounters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watchers(&self) -> MutexGuard<'_, HashMap<String, WatchHandle>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), RegistryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::StoreUnavailable(
                "registry is closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Register (or rebind) a device on a gateway node.
    ///
    /// A new device is refused with `CapacityExceeded` once the user already
    /// has `max_devices_per_user` entries. Re-registering a known device
    /// replaces its value and lease. The count and the write are separate
    /// store calls, so concurrent registrations for one user can overshoot
    /// the cap by the number of racing callers.
    pub async fn register_user(
        &self,
        user_id: &str,
        device_id: &str,
        gateway_node: &str,
    ) -> Result<LeaseId, RegistryError> {
        self.ensure_open()?;
        require_segment("user_id", user_id)?;
        require_segment("device_id", device_id)?;
        require("gateway_node", gateway_node)?;

        let key = self.layout.device_key(user_id, device_id);
        let existing = self
            .store
            .prefix_get(&self.layout.user_prefix(user_id))
            .await?;
        let rebind = existing.iter().any(|kv| kv.key == key);

        if !rebind && existing.len() >= self.config.max_devices_per_user {
            self.counters().rejected_registrations += 1;
            tracing::warn!(
                user_id = %user_id,
                device_id = %device_id,
                devices = existing.len(),
                "Device limit reached, refusing registration"
            );
            return Err(RegistryError::CapacityExceeded {
                user_id: user_id.to_string(),
                max: self.config.max_devices_per_user,
            });
        }

        let lease = self.store.grant_lease(self.config.lease_ttl).await?;
        let value = encode_value(gateway_node, Utc::now().timestamp());
        self.store.put(&key, &value, Some(lease)).await?;

        self.counters().registrations += 1;
        tracing::debug!(
            user_id = %user_id,
            device_id = %device_id,
            gateway = %gateway_node,
            lease_id = lease,
            rebind,
            "Registered device"
        );
        Ok(lease)
    }

    /// Remove a device. Removing an absent device is not an error.
    pub async fn unregister_user(&self, user_id: &str, device_id: &str) -> Result<(), RegistryError> {
        self.ensure_open()?;
        require_segment("user_id", user_id)?;
        require_segment("device_id", device_id)?;

        let existed = self
            .store
            .delete(&self.layout.device_key(user_id, device_id))
            .await?;

        self.counters().unregistrations += 1;
        tracing::debug!(user_id = %user_id, device_id = %device_id, existed, "Unregistered device");
        Ok(())
    }

    /// Remove a device only if its entry is still backed by `lease_id`.
    ///
    /// A gateway cleaning up a dead connection uses this so it cannot remove
    /// an entry the device has since re-registered elsewhere. Returns whether
    /// the entry was removed.
    pub async fn unregister_if_lease(
        &self,
        user_id: &str,
        device_id: &str,
        lease_id: LeaseId,
    ) -> Result<bool, RegistryError> {
        self.ensure_open()?;
        require_segment("user_id", user_id)?;
        require_segment("device_id", device_id)?;

        let removed = self
            .store
            .delete_if_lease(&self.layout.device_key(user_id, device_id), lease_id)
            .await?;

        if removed {
            self.counters().unregistrations += 1;
        }
        tracing::debug!(
            user_id = %user_id,
            device_id = %device_id,
            lease_id,
            removed,
            "Conditional unregister"
        );
        Ok(removed)
    }

    /// All live locations of a user. Empty means the user is offline.
    /// Entries whose value does not decode are skipped.
    pub async fn lookup_user(&self, user_id: &str) -> Result<Vec<GatewayLocation>, RegistryError> {
        self.ensure_open()?;
        require_segment("user_id", user_id)?;

        let entries = self
            .store
            .prefix_get(&self.layout.user_prefix(user_id))
            .await?;
        self.counters().lookups += 1;

        let mut locations = Vec::with_capacity(entries.len());
        for kv in entries {
            let Some((_, device_id)) = self.layout.parse_key(&kv.key) else {
                tracing::warn!(key = %kv.key, "Skipping registry key with unexpected layout");
                continue;
            };
            let Some((gateway_node, connected_at)) = decode_value(&kv.value) else {
                tracing::warn!(key = %kv.key, value = %kv.value, "Skipping malformed registry value");
                continue;
            };
            locations.push(GatewayLocation {
                gateway_node,
                device_id,
                connected_at,
            });
        }
        Ok(locations)
    }

    /// Extend a lease by one TTL. On `LeaseNotFound`/`LeaseExpired` the
    /// caller should register again rather than retry.
    pub async fn renew_lease(&self, lease_id: LeaseId) -> Result<(), RegistryError> {
        self.ensure_open()?;
        if lease_id <= 0 {
            return Err(RegistryError::InvalidArgument(format!(
                "lease_id must be positive, got {}",
                lease_id
            )));
        }

        match self.store.keep_alive_once(lease_id).await {
            Ok(()) => {
                self.counters().renewals += 1;
                Ok(())
            }
            Err(e) => {
                self.counters().renewal_failures += 1;
                tracing::debug!(lease_id, error = %e, "Lease renewal rejected");
                Err(e.into())
            }
        }
    }

    /// Watch registry changes under `prefix`, relative to the registry root
    /// (`"users/"` for everyone, `"users/{user_id}/"` for one user).
    ///
    /// The first subscription is made before returning, so events after this
    /// call are observed. Later stream failures are retried after
    /// `watch_backoff` until [`stop_watch`](Self::stop_watch) or
    /// [`close`](Self::close). Watching a prefix again replaces the previous
    /// callback.
    pub async fn watch<F>(&self, prefix: &str, callback: F) -> Result<(), RegistryError>
    where
        F: Fn(WatchEvent) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        require("prefix", prefix)?;

        // Subscribe before touching any existing loop, so a failed call
        // leaves the current watch on this prefix running.
        let full_prefix = format!("{}{}", self.layout.root, prefix.trim_start_matches('/'));
        let initial = self.store.watch(&full_prefix).await?;

        let (stop, stop_rx) = tokio::sync::watch::channel(false);
        let watch_loop = WatchLoop {
            store: Arc::clone(&self.store),
            prefix: full_prefix.clone(),
            initial,
            layout: self.layout.clone(),
            callback: Arc::new(callback),
            backoff: self.config.watch_backoff,
            counters: Arc::clone(&self.counters),
            closed: self.closed_tx.subscribe(),
            stop: stop_rx,
        };
        let task = tokio::spawn(watch_loop.run());

        let replaced = self
            .watchers()
            .insert(prefix.to_string(), WatchHandle { stop, task });
        if let Some(previous) = replaced {
            previous.stop.send_replace(true);
            if let Err(e) = previous.task.await {
                tracing::warn!(prefix = %prefix, error = %e, "Watch task ended abnormally");
            }
        }

        tracing::info!(prefix = %full_prefix, "Watching registry prefix");
        Ok(())
    }

    /// Stop the watch on `prefix`. Returns whether one was running.
    pub async fn stop_watch(&self, prefix: &str) -> bool {
        let handle = self.watchers().remove(prefix);
        match handle {
            Some(handle) => {
                handle.stop.send_replace(true);
                if let Err(e) = handle.task.await {
                    tracing::warn!(prefix = %prefix, error = %e, "Watch task ended abnormally");
                }
                true
            }
            None => false,
        }
    }

    /// Prefixes currently being watched.
    pub fn watched_prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self.watchers().keys().cloned().collect();
        prefixes.sort();
        prefixes
    }

    /// Snapshot of registry counters.
    pub fn stats(&self) -> RegistryStats {
        let active = self.watchers().len();
        self.counters().snapshot(active)
    }

    /// Stop every watch loop, then release the store connection.
    /// Later calls fail with `StoreUnavailable`.
    pub async fn close(&self) -> Result<(), RegistryError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closed_tx.send_replace(true);

        let handles: Vec<(String, WatchHandle)> = self.watchers().drain().collect();
        for (prefix, handle) in handles {
            handle.stop.send_replace(true);
            if let Err(e) = handle.task.await {
                tracing::warn!(prefix = %prefix, error = %e, "Watch task ended abnormally");
            }
        }

        self.store.close().await?;
        tracing::info!("Presence registry closed");
        Ok(())
    }
}

impl Drop for PresenceRegistry {
    fn drop(&mut self) {
        self.closed_tx.send_replace(true);
    }
}
