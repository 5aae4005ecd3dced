//! End-to-end demo on the in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::{RegistryConfig, WorkerConfig};
use crate::log::MemoryLog;
use crate::offline::{
    ConversationType, DedupChecker, MemoryDedupStore, MemoryOfflineStore, OfflineMessageEvent,
    OfflineWorker, WorkerStats,
};
use crate::registry::{GatewayLocation, PresenceCache, PresenceRegistry, RegistryStats};
use crate::store::MemoryLeaseStore;

const DEMO_TOPIC: &str = "offline-messages";
const DEMO_GROUP: &str = "offline-message-worker";

/// What the demo observed.
#[derive(Debug, Serialize)]
pub struct DemoReport {
    pub lookup_before_unregister: Vec<GatewayLocation>,
    pub lookup_after_unregister: Vec<GatewayLocation>,
    pub cache_after_unregister: Vec<GatewayLocation>,
    pub registry: RegistryStats,
    pub persisted_msg_ids: Vec<String>,
    pub committed_offset: Option<i64>,
    pub worker: WorkerStats,
}

/// Run the demo and print the report.
pub async fn run_demo_command(json: bool) -> anyhow::Result<()> {
    let report = run_demo().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Presence registry");
    println!("  Before unregister:");
    for loc in &report.lookup_before_unregister {
        println!("    {} -> {}", loc.device_id, loc.gateway_node);
    }
    println!("  After unregister:");
    for loc in &report.lookup_after_unregister {
        println!("    {} -> {}", loc.device_id, loc.gateway_node);
    }
    println!("  Cache entries: {}", report.cache_after_unregister.len());
    println!();
    println!("Offline worker");
    println!("  Persisted:     {}", report.persisted_msg_ids.join(", "));
    println!("  Deduplicated:  {}", report.worker.messages_deduplicated);
    println!("  Batch writes:  {}", report.worker.batch_writes);
    println!(
        "  Committed:     {}",
        report
            .committed_offset
            .map(|o| o.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    Ok(())
}

/// Both example flows: a two-device user losing one device, and a
/// three-message batch in which one message was already acknowledged.
pub async fn run_demo() -> anyhow::Result<DemoReport> {
    let store = Arc::new(MemoryLeaseStore::new());
    let registry = PresenceRegistry::new(store, RegistryConfig::default())?;
    let cache = PresenceCache::new();
    cache.attach(&registry, "users/").await?;

    registry
        .register_user("user001", "deviceA", "gateway-1:8080")
        .await?;
    registry
        .register_user("user001", "deviceB", "gateway-2:8080")
        .await?;
    let mut lookup_before_unregister = registry.lookup_user("user001").await?;
    lookup_before_unregister.sort_by(|a, b| a.device_id.cmp(&b.device_id));

    registry.unregister_user("user001", "deviceA").await?;
    let lookup_after_unregister = registry.lookup_user("user001").await?;

    wait_until(|| cache.lookup("user001").len() == 1).await?;
    let cache_after_unregister = cache.lookup("user001");
    let registry_stats = registry.stats();
    registry.close().await?;

    let log = MemoryLog::new();
    log.create_topic(DEMO_TOPIC, 1);
    for (seq, msg_id) in ["m1", "m2", "m3"].iter().enumerate() {
        let event = OfflineMessageEvent {
            msg_id: msg_id.to_string(),
            user_id: "user001".to_string(),
            sender_id: "user002".to_string(),
            conversation_id: "conv-demo".to_string(),
            conversation_type: ConversationType::Private,
            content: format!("message {}", msg_id),
            sequence: seq as i64 + 1,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        log.produce(DEMO_TOPIC, Some(event.user_id.as_bytes()), event.encode())?;
    }

    let dedup = Arc::new(MemoryDedupStore::default());
    // m2 was acknowledged through the read-receipt path first.
    dedup.mark_processed("m2").await?;
    let messages = Arc::new(MemoryOfflineStore::new());

    let config = WorkerConfig {
        group_id: DEMO_GROUP.to_string(),
        topics: vec![DEMO_TOPIC.to_string()],
        batch_size: 3,
        ..WorkerConfig::default()
    };
    let dedup_checker: Arc<dyn DedupChecker> = dedup;
    let worker = OfflineWorker::new(
        config,
        Arc::new(log.consumer_group(DEMO_GROUP)),
        messages.clone(),
        dedup_checker,
    )?;
    worker.start()?;
    wait_until(|| log.committed_offset(DEMO_GROUP, DEMO_TOPIC, 0) == Some(3)).await?;
    worker.stop().await?;

    Ok(DemoReport {
        lookup_before_unregister,
        lookup_after_unregister,
        cache_after_unregister,
        registry: registry_stats,
        persisted_msg_ids: messages.records().into_iter().map(|r| r.msg_id).collect(),
        committed_offset: log.committed_offset(DEMO_GROUP, DEMO_TOPIC, 0),
        worker: worker.stats(),
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("demo timed out waiting for the pipeline");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demo_reproduces_both_scenarios() {
        let report = run_demo().await.unwrap();

        assert_eq!(report.lookup_before_unregister.len(), 2);
        assert_eq!(report.lookup_after_unregister.len(), 1);
        assert_eq!(report.lookup_after_unregister[0].device_id, "deviceB");
        assert_eq!(report.lookup_after_unregister[0].gateway_node, "gateway-2:8080");
        assert_eq!(report.cache_after_unregister, report.lookup_after_unregister);

        assert_eq!(report.persisted_msg_ids, vec!["m1", "m3"]);
        assert_eq!(report.worker.messages_deduplicated, 1);
        assert_eq!(report.worker.messages_persisted, 2);
        assert_eq!(report.committed_offset, Some(3));
    }
}
