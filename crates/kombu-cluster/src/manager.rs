//! Partition lifecycle: activation, lookup, deactivation.

use crate::actor::{PartitionActor, PartitionHandle};
use crate::config::ClusterConfig;
use crate::transport::{PartitionTable, Router};
use crate::ClusterError;
use kombu_observe::Meter;
use std::sync::Arc;

/// Supervises the partition actors on this process. The table of
/// name → handle is shared with the in-memory transport, so a partition
/// becomes reachable for replica traffic the moment it is activated.
pub struct PartitionManager {
    config: ClusterConfig,
    router: Arc<Router>,
    meter: Arc<dyn Meter>,
    partitions: PartitionTable,
}

impl PartitionManager {
    pub fn new(
        config: ClusterConfig,
        partitions: PartitionTable,
        router: Arc<Router>,
        meter: Arc<dyn Meter>,
    ) -> Self {
        Self {
            config,
            router,
            meter,
            partitions,
        }
    }

    /// Canonical name for partition `index`; also its ring node id and
    /// journal subdirectory.
    pub fn partition_name(index: u32) -> String {
        format!("partition-{index}")
    }

    /// Parses the index back out of a partition name.
    pub fn partition_index(name: &str) -> Option<u32> {
        name.strip_prefix("partition-")?.parse().ok()
    }

    /// Activates partition `index`: journal replay, archiver start, actor
    /// spawn. Fails if it is already active.
    pub async fn activate(&self, index: u32) -> Result<PartitionHandle, ClusterError> {
        let name = Self::partition_name(index);
        {
            let partitions = self.partitions.read().await;
            if partitions.contains_key(&name) {
                return Err(ClusterError::AlreadyActive(name));
            }
        }

        let handle = PartitionActor::spawn(
            &self.config,
            name.clone(),
            index,
            self.router.clone(),
            self.meter.clone(),
        )
        .await?;
        self.partitions.write().await.insert(name, handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, name: &str) -> Result<PartitionHandle, ClusterError> {
        self.partitions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotActive(name.to_string()))
    }

    /// Looks up partition `index`, activating it first if needed.
    pub async fn get_or_activate(&self, index: u32) -> Result<PartitionHandle, ClusterError> {
        let name = Self::partition_name(index);
        if let Ok(handle) = self.get(&name).await {
            return Ok(handle);
        }
        match self.activate(index).await {
            Ok(handle) => Ok(handle),
            // Lost the race to another activation; the table has it now.
            Err(ClusterError::AlreadyActive(_)) => self.get(&name).await,
            Err(e) => Err(e),
        }
    }

    pub async fn active(&self) -> Vec<String> {
        self.partitions.read().await.keys().cloned().collect()
    }

    pub async fn partition_count(&self) -> usize {
        self.partitions.read().await.len()
    }

    /// Stops one partition, flushing its journal. Further commands through
    /// outstanding handles fail with `PartitionGone`.
    pub async fn deactivate(&self, name: &str) -> Result<(), ClusterError> {
        let handle = self
            .partitions
            .write()
            .await
            .remove(name)
            .ok_or_else(|| ClusterError::NotActive(name.to_string()))?;
        handle.shutdown().await
    }

    /// Stops every partition. The first journal-flush failure is returned,
    /// but all partitions are shut down regardless.
    pub async fn shutdown(&self) -> Result<(), ClusterError> {
        let handles: Vec<PartitionHandle> =
            self.partitions.write().await.drain().map(|(_, h)| h).collect();

        let mut first_error = None;
        for handle in handles {
            if let Err(e) = handle.shutdown().await {
                tracing::warn!(partition = handle.name(), error = %e, "partition shutdown failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
