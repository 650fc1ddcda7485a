//! Partitioned, replicated cache layer.
//!
//! Each partition is an actor owning one [`kombu_engine::CacheEngine`], its
//! notification hub, and its journal archiver; all access goes through the
//! actor's command queue. The [`Cluster`] facade routes keys over a
//! virtual-node hash ring, writes to the primary partition, fans writes out
//! to the replica set without waiting for acknowledgement, and repairs stale
//! replicas on read.

pub mod actor;
pub mod cluster;
pub mod config;
pub mod manager;
pub mod transport;

pub use actor::{PartitionActor, PartitionHandle};
pub use cluster::Cluster;
pub use config::{ClusterConfig, ConfigError, EvictionKind};
pub use manager::PartitionManager;
pub use transport::{InMemoryTransport, PartitionTable, ReplicaTransport, Router};

use kombu_journal::JournalError;

/// Errors from partition lifecycle and routing.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("partition {0} is not active")]
    NotActive(String),

    #[error("partition {0} is already active")]
    AlreadyActive(String),

    #[error("partition {0} stopped accepting commands")]
    PartitionGone(String),

    #[error("no partitions on the ring")]
    EmptyRing,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("transport error: {0}")]
    Transport(String),
}
