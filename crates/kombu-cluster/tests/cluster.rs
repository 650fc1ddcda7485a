//! End-to-end cluster behavior: routing, replication, read repair, restart.

use bytes::Bytes;
use kombu_cluster::{Cluster, ClusterConfig, EvictionKind, PartitionManager};
use kombu_observe::NoopMeter;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn config(dir: &TempDir, partitions: u32, replication_factor: usize) -> ClusterConfig {
    ClusterConfig {
        data_dir: dir.path().to_path_buf(),
        partitions,
        replication_factor,
        virtual_nodes: 32,
        capacity_bytes: 1024 * 1024,
        eviction: EvictionKind::Lru,
        replica_timeout_ms: 250,
        journal_rotate_bytes: 8 * 1024 * 1024,
        journal_rotate_min_interval_ms: 30_000,
        notification_capacity: 256,
    }
}

async fn start(cfg: &ClusterConfig) -> Cluster {
    Cluster::start(cfg.clone(), Arc::new(NoopMeter)).await.unwrap()
}

/// Replication is fire-and-forget, so tests poll for convergence.
async fn wait_for_replica(cluster: &Cluster, partition: &str, key: &str) {
    let handle = cluster.manager().get(partition).await.unwrap();
    for _ in 0..100 {
        if handle.get_replica(key.to_string()).await.unwrap().is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("key {key} never reached replica {partition}");
}

#[tokio::test]
async fn test_put_then_get_roundtrip() {
    let dir = TempDir::new().unwrap();
    let cluster = start(&config(&dir, 4, 2)).await;

    assert!(cluster
        .put("session:1", 911, None, Bytes::from_static(b"Payload"))
        .await
        .unwrap());

    let value = cluster.get("session:1").await.unwrap().unwrap();
    assert_eq!(value.flags, 911);
    assert_eq!(value.data, Bytes::from_static(b"Payload"));

    assert!(cluster.get("missing").await.unwrap().is_none());
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_write_fans_out_to_whole_replica_set() {
    let dir = TempDir::new().unwrap();
    let cluster = start(&config(&dir, 3, 3)).await;

    cluster
        .put("fanned", 1, None, Bytes::from_static(b"v"))
        .await
        .unwrap();

    let replicas = cluster.replica_set("fanned");
    assert_eq!(replicas.len(), 3);
    for partition in &replicas {
        wait_for_replica(&cluster, partition, "fanned").await;
    }
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_get_on_stale_replica_returns_and_repairs() {
    let dir = TempDir::new().unwrap();
    let cluster = start(&config(&dir, 3, 3)).await;

    cluster
        .put("repairable", 42, None, Bytes::from_static(b"survivor"))
        .await
        .unwrap();
    let replicas = cluster.replica_set("repairable");
    for partition in &replicas {
        wait_for_replica(&cluster, partition, "repairable").await;
    }

    // Make one replica stale: drop its copy through the terminal
    // replica-side command so nothing fans out.
    let stale = cluster.manager().get(&replicas[1]).await.unwrap();
    assert!(stale.remove_replica("repairable".to_string()).await.unwrap());
    assert!(stale
        .get_replica("repairable".to_string())
        .await
        .unwrap()
        .is_none());

    // A routed get against the stale replica comes back with the value...
    let value = stale.get("repairable".to_string()).await.unwrap().unwrap();
    assert_eq!(value.flags, 42);
    assert_eq!(value.data, Bytes::from_static(b"survivor"));

    // ...and the replica holds it locally again.
    let repaired = stale
        .get_replica("repairable".to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(repaired.data, Bytes::from_static(b"survivor"));

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_get_skips_failed_replica() {
    let dir = TempDir::new().unwrap();
    let cluster = start(&config(&dir, 3, 3)).await;

    cluster
        .put("resilient", 5, None, Bytes::from_static(b"kept"))
        .await
        .unwrap();
    let replicas = cluster.replica_set("resilient");
    for partition in &replicas {
        wait_for_replica(&cluster, partition, "resilient").await;
    }

    // Drop the primary's copy, then take down the replica it would consult
    // first. The read has to move on to the last replica in ring order.
    let primary = cluster.manager().get(&replicas[0]).await.unwrap();
    assert!(primary.remove_replica("resilient".to_string()).await.unwrap());
    cluster.manager().deactivate(&replicas[1]).await.unwrap();

    let value = cluster.get("resilient").await.unwrap().unwrap();
    assert_eq!(value.flags, 5);
    assert_eq!(value.data, Bytes::from_static(b"kept"));

    // The primary repaired itself from the surviving replica.
    let repaired = primary
        .get_replica("resilient".to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(repaired.data, Bytes::from_static(b"kept"));

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remove_fans_out_to_whole_replica_set() {
    let dir = TempDir::new().unwrap();
    let cluster = start(&config(&dir, 3, 3)).await;

    cluster
        .put("doomed", 0, None, Bytes::from_static(b"v"))
        .await
        .unwrap();
    let replicas = cluster.replica_set("doomed");
    for partition in &replicas {
        wait_for_replica(&cluster, partition, "doomed").await;
    }

    assert!(cluster.remove("doomed").await.unwrap());

    for partition in &replicas {
        let handle = cluster.manager().get(partition).await.unwrap();
        let mut gone = false;
        for _ in 0..100 {
            if handle
                .get_replica("doomed".to_string())
                .await
                .unwrap()
                .is_none()
            {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(gone, "key still present on {partition}");
    }
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_restores_from_journal() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir, 2, 1);

    let cluster = start(&cfg).await;
    cluster
        .put("durable", 911, None, Bytes::from_static(b"Payload"))
        .await
        .unwrap();
    cluster.shutdown().await.unwrap();

    let cluster = start(&cfg).await;
    let value = cluster.get("durable").await.unwrap().unwrap();
    assert_eq!(value.flags, 911);
    assert_eq!(value.data, Bytes::from_static(b"Payload"));
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_watch_sees_existing_then_new_mutations() {
    let dir = TempDir::new().unwrap();
    let cluster = start(&config(&dir, 1, 1)).await;

    cluster
        .put("early", 0, None, Bytes::from_static(b"1"))
        .await
        .unwrap();

    let mut stream = cluster.watch(0).await.unwrap();

    cluster
        .put("late", 0, None, Bytes::from_static(b"2"))
        .await
        .unwrap();

    let mut keys = Vec::new();
    for _ in 0..2 {
        let note = tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .unwrap()
            .unwrap();
        keys.push(note.key().unwrap_or_default().to_string());
    }
    assert_eq!(keys, vec!["early".to_string(), "late".to_string()]);

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_replica_set_stable_across_instances() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir, 5, 3);

    let first = start(&cfg).await;
    let set = first.replica_set("pinned");
    first.shutdown().await.unwrap();

    let second = start(&cfg).await;
    assert_eq!(second.replica_set("pinned"), set);
    assert!(set.iter().all(|n| PartitionManager::partition_index(n).is_some()));
    second.shutdown().await.unwrap();
}
