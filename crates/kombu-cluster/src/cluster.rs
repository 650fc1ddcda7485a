//! The cluster facade: wires ring, transport, and partition manager
//! together, and routes client calls to each key's primary partition.

use crate::config::ClusterConfig;
use crate::manager::PartitionManager;
use crate::transport::{partition_table, InMemoryTransport, Router};
use crate::ClusterError;
use bytes::Bytes;
use kombu_engine::CacheValue;
use kombu_events::Notification;
use kombu_observe::Meter;
use kombu_ring::HashRing;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;

/// A single-process cluster: every partition lives here, and replica traffic
/// goes over the in-memory transport. Writes land on the key's primary and
/// fan out from there; reads hit the primary and fall back to its replicas
/// with read repair. Replication is fire-and-forget, so the cluster is
/// eventually consistent by design.
pub struct Cluster {
    router: Arc<Router>,
    manager: Arc<PartitionManager>,
}

impl Cluster {
    /// Validates the configuration, activates every partition (replaying
    /// journals), and builds the ring over them.
    pub async fn start(config: ClusterConfig, meter: Arc<dyn Meter>) -> Result<Self, ClusterError> {
        config.validate()?;

        let table = partition_table();
        let ring = HashRing::new(
            (0..config.partitions).map(PartitionManager::partition_name),
            config.virtual_nodes,
        );
        let router = Arc::new(Router {
            ring: Arc::new(parking_lot::RwLock::new(ring)),
            transport: Arc::new(InMemoryTransport::new(table.clone())),
            replication_factor: config.replication_factor,
            replica_timeout: config.replica_timeout(),
            meter: meter.clone(),
        });

        let partitions = config.partitions;
        let manager = Arc::new(PartitionManager::new(config, table, router.clone(), meter));
        for index in 0..partitions {
            manager.activate(index).await?;
        }

        Ok(Self { router, manager })
    }

    /// The partitions holding `key`, primary first.
    pub fn replica_set(&self, key: &str) -> Vec<String> {
        self.router.replica_set(key)
    }

    pub fn manager(&self) -> &Arc<PartitionManager> {
        &self.manager
    }

    /// Stores via the key's primary partition; the primary fans the write
    /// out to the replicas. Returns the primary's verdict.
    pub async fn put(
        &self,
        key: &str,
        flags: u64,
        expiry: Option<SystemTime>,
        data: Bytes,
    ) -> Result<bool, ClusterError> {
        self.primary(key).await?.put(key.to_string(), flags, expiry, data).await
    }

    /// Reads via the key's primary partition, which consults its replicas
    /// and repairs itself on a local miss.
    pub async fn get(&self, key: &str) -> Result<Option<CacheValue>, ClusterError> {
        self.primary(key).await?.get(key.to_string()).await
    }

    /// Removes via the key's primary partition, fanning out to the replicas.
    pub async fn remove(&self, key: &str) -> Result<bool, ClusterError> {
        self.primary(key).await?.remove(key.to_string()).await
    }

    /// Snapshot-then-live notification stream for one partition.
    pub async fn watch(&self, partition: u32) -> Result<mpsc::Receiver<Notification>, ClusterError> {
        let handle = self
            .manager
            .get(&PartitionManager::partition_name(partition))
            .await?;
        handle.watch().await
    }

    /// Flushes and stops every partition.
    pub async fn shutdown(&self) -> Result<(), ClusterError> {
        self.manager.shutdown().await
    }

    async fn primary(&self, key: &str) -> Result<crate::PartitionHandle, ClusterError> {
        let replicas = self.router.replica_set(key);
        let primary = replicas.first().ok_or(ClusterError::EmptyRing)?;
        self.manager.get(primary).await
    }
}
