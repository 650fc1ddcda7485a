//! Transport abstraction for replica traffic.
//!
//! Partition actors talk to their replicas through [`ReplicaTransport`], so
//! the same fan-out and repair logic runs over local channels in tests and
//! could run over a network transport without changes. Only the in-process
//! implementation lives here. Replica-side calls are terminal: they apply
//! locally on the target and never fan out again.

use crate::actor::PartitionHandle;
use crate::ClusterError;
use async_trait::async_trait;
use bytes::Bytes;
use kombu_engine::CacheValue;
use kombu_observe::Meter;
use kombu_ring::HashRing;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

/// Live partition actors on this process, shared between the manager (which
/// populates it) and the in-memory transport (which routes through it).
pub type PartitionTable = Arc<RwLock<HashMap<String, PartitionHandle>>>;

pub fn partition_table() -> PartitionTable {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Routing state shared by every partition actor: the ring, the transport,
/// and the replication policy knobs. The ring lock is read-mostly; it is
/// never held across an await.
pub struct Router {
    pub ring: Arc<parking_lot::RwLock<HashRing>>,
    pub transport: Arc<dyn ReplicaTransport>,
    pub replication_factor: usize,
    pub replica_timeout: Duration,
    pub meter: Arc<dyn Meter>,
}

impl Router {
    /// The partitions holding `key`, primary first.
    pub fn replica_set(&self, key: &str) -> Vec<String> {
        self.ring.read().nodes_for(key, self.replication_factor)
    }
}

/// Replica-side operations, addressed by partition name.
#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    /// Applies a write on the target replica, locally only.
    async fn put_replica(
        &self,
        target: &str,
        key: &str,
        flags: u64,
        expiry: Option<SystemTime>,
        data: Bytes,
    ) -> Result<bool, ClusterError>;

    /// Reads from the target replica without triggering its repair path.
    async fn get_replica(&self, target: &str, key: &str)
        -> Result<Option<CacheValue>, ClusterError>;

    /// Removes a key on the target replica, locally only.
    async fn remove_replica(&self, target: &str, key: &str) -> Result<bool, ClusterError>;
}

/// Routes replica calls straight to this process's partition actors.
pub struct InMemoryTransport {
    partitions: PartitionTable,
}

impl InMemoryTransport {
    pub fn new(partitions: PartitionTable) -> Self {
        Self { partitions }
    }

    async fn lookup(&self, target: &str) -> Result<PartitionHandle, ClusterError> {
        self.partitions
            .read()
            .await
            .get(target)
            .cloned()
            .ok_or_else(|| ClusterError::NotActive(target.to_string()))
    }
}

#[async_trait]
impl ReplicaTransport for InMemoryTransport {
    async fn put_replica(
        &self,
        target: &str,
        key: &str,
        flags: u64,
        expiry: Option<SystemTime>,
        data: Bytes,
    ) -> Result<bool, ClusterError> {
        let handle = self.lookup(target).await?;
        handle.put_replica(key.to_string(), flags, expiry, data).await
    }

    async fn get_replica(
        &self,
        target: &str,
        key: &str,
    ) -> Result<Option<CacheValue>, ClusterError> {
        let handle = self.lookup(target).await?;
        handle.get_replica(key.to_string()).await
    }

    async fn remove_replica(&self, target: &str, key: &str) -> Result<bool, ClusterError> {
        let handle = self.lookup(target).await?;
        handle.remove_replica(key.to_string()).await
    }
}
