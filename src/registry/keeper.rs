//! Background lease renewal for one connected device.
//!
//! A gateway starts one keeper per connection. The keeper renews the lease
//! every TTL/3. If the store reports the lease gone (expired during a store
//! outage, say) the device is registered again under a fresh lease. The
//! keeper gives up only when re-registration is refused by the device cap.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::PresenceRegistry;
use crate::error::RegistryError;
use crate::shutdown::wait_cancelled;
use crate::store::LeaseId;

/// Keeps one device's registry entry alive until stopped.
pub struct LeaseKeeper {
    registry: Arc<PresenceRegistry>,
    user_id: String,
    device_id: String,
    lease: Arc<AtomicI64>,
    running: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

struct Renewal {
    registry: Arc<PresenceRegistry>,
    user_id: String,
    device_id: String,
    gateway_node: String,
    lease: Arc<AtomicI64>,
    running: Arc<AtomicBool>,
    interval: Duration,
}

impl Renewal {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(self.interval);
        // The first tick completes immediately; the lease is fresh.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = wait_cancelled(&mut stop) => break,
                _ = timer.tick() => {}
            }
            if !self.renew_once().await {
                break;
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::debug!(user_id = %self.user_id, device_id = %self.device_id, "Lease keeper stopped");
    }

    /// One renewal attempt. Returns false when the keeper should stop.
    async fn renew_once(&self) -> bool {
        let lease = self.lease.load(Ordering::SeqCst);
        let err = match self.registry.renew_lease(lease).await {
            Ok(()) => return true,
            Err(e) => e,
        };

        if !err.lease_lost() {
            tracing::warn!(
                user_id = %self.user_id,
                device_id = %self.device_id,
                lease_id = lease,
                error = %err,
                "Lease renewal failed, retrying next interval"
            );
            return true;
        }

        tracing::info!(
            user_id = %self.user_id,
            device_id = %self.device_id,
            lease_id = lease,
            "Lease lost, registering again"
        );
        match self
            .registry
            .register_user(&self.user_id, &self.device_id, &self.gateway_node)
            .await
        {
            Ok(fresh) => {
                self.lease.store(fresh, Ordering::SeqCst);
                true
            }
            Err(e @ RegistryError::CapacityExceeded { .. }) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    device_id = %self.device_id,
                    error = %e,
                    "Re-registration refused, giving up"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    device_id = %self.device_id,
                    error = %e,
                    "Re-registration failed, retrying next interval"
                );
                true
            }
        }
    }
}

impl LeaseKeeper {
    /// Register the device and start renewing its lease.
    pub async fn start(
        registry: Arc<PresenceRegistry>,
        user_id: &str,
        device_id: &str,
        gateway_node: &str,
    ) -> Result<Self, RegistryError> {
        let lease_id = registry
            .register_user(user_id, device_id, gateway_node)
            .await?;

        let lease = Arc::new(AtomicI64::new(lease_id));
        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = watch::channel(false);

        let renewal = Renewal {
            registry: Arc::clone(&registry),
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            gateway_node: gateway_node.to_string(),
            lease: Arc::clone(&lease),
            running: Arc::clone(&running),
            interval: registry.config().renew_interval(),
        };
        let task = tokio::spawn(renewal.run(stop_rx));

        Ok(Self {
            registry,
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            lease,
            running,
            stop_tx,
            task: Some(task),
        })
    }

    /// Lease currently backing the entry. Changes after a re-registration.
    pub fn lease_id(&self) -> LeaseId {
        self.lease.load(Ordering::SeqCst)
    }

    /// False once the keeper has given up or been stopped.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop renewing. With `unregister`, the entry is removed right away
    /// instead of lingering until its lease lapses, unless the device has
    /// registered again under another lease in the meantime.
    pub async fn stop(mut self, unregister: bool) -> Result<(), RegistryError> {
        self.stop_tx.send_replace(true);
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::warn!(error = %e, "Lease keeper task ended abnormally");
        }
        if unregister {
            let lease = self.lease_id();
            let removed = self
                .registry
                .unregister_if_lease(&self.user_id, &self.device_id, lease)
                .await?;
            if !removed {
                tracing::debug!(
                    user_id = %self.user_id,
                    device_id = %self.device_id,
                    lease_id = lease,
                    "Entry now owned by a newer registration, left in place"
                );
            }
        }
        Ok(())
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::RegistryConfig;
    use crate::store::{LeaseStore, MemoryLeaseStore};

    fn setup(max_devices: usize) -> (Arc<MemoryLeaseStore>, Arc<PresenceRegistry>) {
        let store = Arc::new(MemoryLeaseStore::new());
        let config = RegistryConfig {
            max_devices_per_user: max_devices,
            ..RegistryConfig::default()
        };
        let registry = PresenceRegistry::new(store.clone(), config).unwrap();
        (store, Arc::new(registry))
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeper_outlives_ttl() {
        let (_store, registry) = setup(5);
        let keeper = LeaseKeeper::start(registry.clone(), "user001", "deviceA", "gw-1")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(300)).await;

        assert!(keeper.is_running());
        assert_eq!(registry.lookup_user("user001").await.unwrap().len(), 1);
        assert!(registry.stats().renewals >= 9);

        keeper.stop(false).await.unwrap();
        // Without unregistering, the entry survives until its lease lapses.
        assert_eq!(registry.lookup_user("user001").await.unwrap().len(), 1);
        tokio::time::sleep(Duration::from_secs(91)).await;
        assert!(registry.lookup_user("user001").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeper_reregisters_after_outage() {
        let (store, registry) = setup(5);
        let keeper = LeaseKeeper::start(registry.clone(), "user001", "deviceA", "gw-1")
            .await
            .unwrap();
        let first_lease = keeper.lease_id();

        store.set_available(false).await;
        tokio::time::sleep(Duration::from_secs(100)).await;
        store.set_available(true).await;
        // Next tick finds the lease expired and registers again.
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert!(keeper.is_running());
        assert_ne!(keeper.lease_id(), first_lease);
        let locations = registry.lookup_user("user001").await.unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].gateway_node, "gw-1");

        keeper.stop(true).await.unwrap();
        assert!(registry.lookup_user("user001").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeper_gives_up_when_capacity_taken() {
        let (store, registry) = setup(1);
        let keeper = LeaseKeeper::start(registry.clone(), "user001", "deviceA", "gw-1")
            .await
            .unwrap();

        // Lose the lease, and let another device take the only slot.
        store.set_available(false).await;
        tokio::time::sleep(Duration::from_secs(100)).await;
        store.set_available(true).await;
        registry
            .register_user("user001", "deviceB", "gw-2")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!keeper.is_running());
        let locations = registry.lookup_user("user001").await.unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].device_id, "deviceB");
        assert!(store.get("/registry/users/user001/deviceA").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_keeper_stop_keeps_newer_registration() {
        let (_store, registry) = setup(5);
        let old = LeaseKeeper::start(registry.clone(), "user001", "phone", "gateway-1:8080")
            .await
            .unwrap();
        // The phone reconnects through another gateway before the first one
        // notices its socket is dead.
        let new = LeaseKeeper::start(registry.clone(), "user001", "phone", "gateway-2:8080")
            .await
            .unwrap();
        assert_ne!(old.lease_id(), new.lease_id());

        old.stop(true).await.unwrap();

        let locations = registry.lookup_user("user001").await.unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].gateway_node, "gateway-2:8080");

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(new.is_running());
        assert_eq!(registry.lookup_user("user001").await.unwrap().len(), 1);

        new.stop(true).await.unwrap();
        assert!(registry.lookup_user("user001").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_propagates_registration_errors() {
        let (_store, registry) = setup(5);
        let result = LeaseKeeper::start(registry, "", "deviceA", "gw-1").await;
        assert!(matches!(result, Err(RegistryError::InvalidArgument(_))));
    }
}
