//! Local presence view fed by a registry watch.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::{GatewayLocation, PresenceRegistry, WatchEvent, WatchEventType, decode_value};
use crate::error::RegistryError;

/// Read-mostly map of user -> device -> location.
///
/// Lookups never touch the lease store. The view is eventually consistent:
/// events missed while a watch reconnects are not replayed.
#[derive(Clone, Default)]
pub struct PresenceCache {
    users: Arc<RwLock<HashMap<String, HashMap<String, GatewayLocation>>>>,
}

impl PresenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one watch event.
    pub fn apply(&self, event: &WatchEvent) {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        match event.event_type {
            WatchEventType::Put => {
                let Some((gateway_node, connected_at)) = decode_value(&event.value) else {
                    tracing::warn!(key = %event.key, "Ignoring malformed presence value");
                    return;
                };
                users.entry(event.user_id.clone()).or_default().insert(
                    event.device_id.clone(),
                    GatewayLocation {
                        gateway_node,
                        device_id: event.device_id.clone(),
                        connected_at,
                    },
                );
            }
            WatchEventType::Delete => {
                if let Some(devices) = users.get_mut(&event.user_id) {
                    devices.remove(&event.device_id);
                    if devices.is_empty() {
                        users.remove(&event.user_id);
                    }
                }
            }
        }
    }

    /// Cached locations of a user, ordered by device id.
    pub fn lookup(&self, user_id: &str) -> Vec<GatewayLocation> {
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        let mut locations: Vec<GatewayLocation> = users
            .get(user_id)
            .map(|devices| devices.values().cloned().collect())
            .unwrap_or_default();
        locations.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        locations
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(user_id)
    }

    /// Users with at least one cached device.
    pub fn user_count(&self) -> usize {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Subscribe this cache to `prefix` on `registry`.
    pub async fn attach(
        &self,
        registry: &PresenceRegistry,
        prefix: &str,
    ) -> Result<(), RegistryError> {
        let cache = self.clone();
        registry
            .watch(prefix, move |event| cache.apply(&event))
            .await
    }
}
