//! Integration tests from a gateway operator's perspective.
//!
//! These exercise the registry and the offline pipeline end to end on the
//! in-memory backends: devices connecting and heartbeating, gateways
//! crashing, other nodes following presence through watches, and offline
//! messages flowing from the log into storage through failures and
//! redelivery.
//!
//! Run: `cargo test --test presence_pipeline_integration`

use std::time::Duration;

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

// ============================================================================
// 1. Device Connection Journey
// ============================================================================
mod device_connection {
    use std::sync::Arc;
    use std::time::Duration;

    use im_presence::config::RegistryConfig;
    use im_presence::error::RegistryError;
    use im_presence::registry::{LeaseKeeper, PresenceCache, PresenceRegistry};
    use im_presence::store::MemoryLeaseStore;

    use super::wait_for;

    #[tokio::test(start_paused = true)]
    async fn test_heartbeating_device_stays_visible_to_other_nodes() {
        let store = Arc::new(MemoryLeaseStore::new());
        let gateway = Arc::new(
            PresenceRegistry::new(store.clone(), RegistryConfig::default()).unwrap(),
        );
        let router = PresenceRegistry::new(store.clone(), RegistryConfig::default()).unwrap();
        let cache = PresenceCache::new();
        cache.attach(&router, "users/").await.unwrap();

        let keeper = LeaseKeeper::start(gateway.clone(), "user001", "phone", "gateway-1:8080")
            .await
            .unwrap();
        wait_for(|| cache.is_online("user001")).await;

        // Ten minutes of heartbeats: far beyond the 90s TTL.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(keeper.is_running());
        assert!(cache.is_online("user001"));
        let locations = router.lookup_user("user001").await.unwrap();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].gateway_node, "gateway-1:8080");

        // Clean disconnect.
        keeper.stop(true).await.unwrap();
        wait_for(|| !cache.is_online("user001")).await;
        assert!(router.lookup_user("user001").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sixth_device_refused_but_reconnect_allowed() {
        let store = Arc::new(MemoryLeaseStore::new());
        let registry = PresenceRegistry::new(store, RegistryConfig::default()).unwrap();

        for device in ["phone", "tablet", "laptop", "desktop", "watch"] {
            registry
                .register_user("user001", device, "gateway-1:8080")
                .await
                .unwrap();
        }

        let refused = registry
            .register_user("user001", "tv", "gateway-1:8080")
            .await;
        assert!(matches!(
            refused,
            Err(RegistryError::CapacityExceeded { max: 5, .. })
        ));

        // The phone reconnects through another gateway.
        registry
            .register_user("user001", "phone", "gateway-2:8080")
            .await
            .unwrap();
        let phone = registry
            .lookup_user("user001")
            .await
            .unwrap()
            .into_iter()
            .find(|l| l.device_id == "phone")
            .unwrap();
        assert_eq!(phone.gateway_node, "gateway-2:8080");
    }
}

// ============================================================================
// 2. Gateway Failure Journey
// ============================================================================
mod gateway_failure {
    use std::sync::Arc;
    use std::time::Duration;

    use im_presence::config::RegistryConfig;
    use im_presence::registry::{PresenceCache, PresenceRegistry};
    use im_presence::store::MemoryLeaseStore;

    use super::wait_for;

    #[tokio::test(start_paused = true)]
    async fn test_crashed_gateway_ages_out_of_every_view() {
        let store = Arc::new(MemoryLeaseStore::new());
        let _reaper = store.spawn_reaper(Duration::from_secs(1));

        let gateway = PresenceRegistry::new(store.clone(), RegistryConfig::default()).unwrap();
        let router = PresenceRegistry::new(store.clone(), RegistryConfig::default()).unwrap();
        let cache = PresenceCache::new();
        cache.attach(&router, "users/").await.unwrap();

        gateway
            .register_user("user001", "deviceA", "gateway-1:8080")
            .await
            .unwrap();
        wait_for(|| cache.is_online("user001")).await;

        // The gateway dies without unregistering or renewing.
        drop(gateway);
        tokio::time::sleep(Duration::from_secs(89)).await;
        assert!(cache.is_online("user001"));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!cache.is_online("user001"));
        assert!(router.lookup_user("user001").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_recovers_after_store_outage() {
        let store = Arc::new(MemoryLeaseStore::new());
        let registry = PresenceRegistry::new(store.clone(), RegistryConfig::default()).unwrap();
        let cache = PresenceCache::new();
        cache.attach(&registry, "users/").await.unwrap();

        store.set_available(false).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        store.set_available(true).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        registry
            .register_user("user002", "deviceA", "gateway-3:8080")
            .await
            .unwrap();
        wait_for(|| cache.is_online("user002")).await;
        assert!(registry.stats().watch_reconnects >= 1);
    }
}

// ============================================================================
// 3. Offline Delivery Journey
// ============================================================================
mod offline_delivery {
    use std::sync::Arc;
    use std::time::Duration;

    use im_presence::config::WorkerConfig;
    use im_presence::log::MemoryLog;
    use im_presence::offline::{
        ConversationType, DedupChecker, MemoryDedupStore, MemoryOfflineStore,
        OfflineMessageEvent, OfflineWorker,
    };

    use super::wait_for;

    const TOPIC: &str = "offline-messages";
    const GROUP: &str = "offline-message-worker";

    fn message(msg_id: &str, user_id: &str, sequence: i64) -> OfflineMessageEvent {
        OfflineMessageEvent {
            msg_id: msg_id.to_string(),
            user_id: user_id.to_string(),
            sender_id: "sender".to_string(),
            conversation_id: format!("conv-{}", user_id),
            conversation_type: ConversationType::Group,
            content: format!("content {}", msg_id),
            sequence,
            timestamp: 1_700_000_000_000 + sequence,
        }
    }

    fn produce(log: &MemoryLog, event: &OfflineMessageEvent) {
        log.produce(TOPIC, Some(event.user_id.as_bytes()), event.encode())
            .unwrap();
    }

    fn start_worker(
        log: &MemoryLog,
        config: WorkerConfig,
        store: Arc<MemoryOfflineStore>,
        dedup: Arc<MemoryDedupStore>,
    ) -> OfflineWorker {
        let dedup: Arc<dyn DedupChecker> = dedup;
        let worker =
            OfflineWorker::new(config, Arc::new(log.consumer_group(GROUP)), store, dedup).unwrap();
        worker.start().unwrap();
        worker
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_is_redelivered_and_persisted_once() {
        let log = MemoryLog::new();
        log.create_topic(TOPIC, 1);
        produce(&log, &message("m1", "user001", 1));
        produce(&log, &message("m2", "user001", 2));

        let store = Arc::new(MemoryOfflineStore::new());
        store.fail_next(1);
        let worker = start_worker(
            &log,
            WorkerConfig {
                batch_size: 2,
                max_retries: 0,
                ..WorkerConfig::default()
            },
            store.clone(),
            Arc::new(MemoryDedupStore::default()),
        );

        wait_for(|| log.committed_offset(GROUP, TOPIC, 0) == Some(2)).await;
        worker.stop().await.unwrap();

        assert_eq!(store.attempts(), 2);
        assert_eq!(store.len(), 2);
        let stats = worker.stats();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.batch_writes, 1);
        assert_eq!(stats.messages_persisted, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_acked_before_worker_is_never_stored() {
        let log = MemoryLog::new();
        log.create_topic(TOPIC, 1);
        produce(&log, &message("m1", "user001", 1));
        produce(&log, &message("m2", "user001", 2));

        let dedup = Arc::new(MemoryDedupStore::default());
        // The recipient came online and read m1 before the worker got to it.
        dedup.mark_processed("m1").await.unwrap();

        let store = Arc::new(MemoryOfflineStore::new());
        let worker = start_worker(
            &log,
            WorkerConfig {
                batch_size: 2,
                ..WorkerConfig::default()
            },
            store.clone(),
            dedup,
        );

        wait_for(|| log.committed_offset(GROUP, TOPIC, 0) == Some(2)).await;
        worker.stop().await.unwrap();

        assert!(store.get("m1").is_none());
        assert!(store.get("m2").is_some());
        assert_eq!(worker.stats().messages_deduplicated, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partitions_flush_independently_and_keep_order() {
        let log = MemoryLog::new();
        log.create_topic(TOPIC, 3);
        let users = ["alice", "bob", "carol"];
        for seq in 1..=3 {
            for user in users {
                produce(&log, &message(&format!("{}-{}", user, seq), user, seq));
            }
        }

        let store = Arc::new(MemoryOfflineStore::new());
        let worker = start_worker(
            &log,
            WorkerConfig::default(),
            store.clone(),
            Arc::new(MemoryDedupStore::default()),
        );

        // Nothing reaches the batch size of 100; the 5s timer flushes.
        tokio::time::sleep(Duration::from_secs(6)).await;
        for partition in 0..3 {
            assert_eq!(
                log.committed_offset(GROUP, TOPIC, partition).unwrap_or(0),
                log.end_offset(TOPIC, partition).unwrap(),
            );
        }
        worker.stop().await.unwrap();

        let records = store.records();
        assert_eq!(records.len(), 9);
        for user in users {
            let sequences: Vec<i64> = records
                .iter()
                .filter(|r| r.user_id == user)
                .map(|r| r.sequence)
                .collect();
            assert_eq!(sequences, vec![1, 2, 3], "order for {}", user);
        }
    }
}

// ============================================================================
// 4. Configuration Journey
// ============================================================================
mod configuration {
    use std::collections::HashMap;
    use std::time::Duration;

    use im_presence::config::Config;
    use im_presence::offline::retry::RetryPolicy;

    #[test]
    fn test_operator_overrides_from_environment() {
        let vars: HashMap<&str, &str> = [
            ("REGISTRY_LEASE_TTL_SECS", "30"),
            ("OFFLINE_BATCH_SIZE", "250"),
            ("OFFLINE_RETRY_BACKOFF_SECS", "1, 5"),
            ("OFFLINE_TOPICS", "offline-a,offline-b"),
        ]
        .into_iter()
        .collect();

        let config = Config::from_lookup(&|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.registry.lease_ttl, Duration::from_secs(30));
        assert_eq!(config.registry.renew_interval(), Duration::from_secs(10));
        assert_eq!(config.worker.batch_size, 250);
        assert_eq!(
            RetryPolicy::from_config(&config.worker).delay_for(7),
            Duration::from_secs(5)
        );
        assert_eq!(config.worker.topics, vec!["offline-a", "offline-b"]);
        assert_eq!(config.registry.max_devices_per_user, 5);
    }

    #[test]
    fn test_bad_value_names_the_variable() {
        let err = Config::from_lookup(&|k| (k == "OFFLINE_BATCH_SIZE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("OFFLINE_BATCH_SIZE"));
    }
}
