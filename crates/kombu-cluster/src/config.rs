//! Cluster configuration.
//!
//! Loaded from YAML or built in code. Everything except `data_dir` has a
//! default, so a minimal config file is one line.

use kombu_engine::{EvictionStrategy, LruEviction, NullEviction, RandomEviction};
use kombu_journal::ArchiveConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Cluster configuration.
///
/// Example YAML:
/// ```yaml
/// data_dir: "/var/lib/kombukv"
/// partitions: 8
/// replication_factor: 3
/// capacity_bytes: 67108864
/// eviction: lru
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Root directory for journal persistence; each partition gets a
    /// subdirectory.
    pub data_dir: PathBuf,

    /// Number of partitions, each a separate cache instance.
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Copies of every key, including the primary.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Virtual ring positions per partition.
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: u32,

    /// Byte budget per partition engine.
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: u64,

    /// Eviction strategy for over-budget engines.
    #[serde(default)]
    pub eviction: EvictionKind,

    /// Budget for a replica call before the caller moves on.
    #[serde(default = "default_replica_timeout_ms")]
    pub replica_timeout_ms: u64,

    /// Journal file rotation threshold in bytes.
    #[serde(default = "default_journal_rotate_bytes")]
    pub journal_rotate_bytes: u64,

    /// Minimum interval between journal rotations.
    #[serde(default = "default_journal_rotate_min_interval_ms")]
    pub journal_rotate_min_interval_ms: u64,

    /// Per-partition broadcast channel depth for notification subscribers.
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

/// Which eviction strategy each partition engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EvictionKind {
    #[default]
    Lru,
    Random,
    None,
}

impl EvictionKind {
    pub fn strategy(self) -> Arc<dyn EvictionStrategy> {
        match self {
            EvictionKind::Lru => Arc::new(LruEviction::new()),
            EvictionKind::Random => Arc::new(RandomEviction),
            EvictionKind::None => Arc::new(NullEviction),
        }
    }
}

fn default_partitions() -> u32 {
    8
}

fn default_replication_factor() -> usize {
    3
}

fn default_virtual_nodes() -> u32 {
    kombu_ring::DEFAULT_VIRTUAL_NODES
}

fn default_capacity_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_replica_timeout_ms() -> u64 {
    250
}

fn default_journal_rotate_bytes() -> u64 {
    8 * 1024 * 1024
}

fn default_journal_rotate_min_interval_ms() -> u64 {
    30_000
}

fn default_notification_capacity() -> usize {
    1024
}

impl ClusterConfig {
    /// Loads and validates configuration from a YAML file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("failed to read config file: {e}")))?;

        let config: ClusterConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("failed to parse YAML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partitions == 0 {
            return Err(ConfigError::InvalidField("partitions must be > 0".into()));
        }
        if self.replication_factor == 0 {
            return Err(ConfigError::InvalidField(
                "replication_factor must be > 0".into(),
            ));
        }
        if self.capacity_bytes == 0 {
            return Err(ConfigError::InvalidField(
                "capacity_bytes must be > 0".into(),
            ));
        }
        if self.notification_capacity == 0 {
            return Err(ConfigError::InvalidField(
                "notification_capacity must be > 0".into(),
            ));
        }
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .map_err(|e| ConfigError::InvalidField(format!("cannot create data_dir: {e}")))?;
        } else if !self.data_dir.is_dir() {
            return Err(ConfigError::InvalidField(
                "data_dir exists but is not a directory".into(),
            ));
        }
        Ok(())
    }

    pub fn replica_timeout(&self) -> Duration {
        Duration::from_millis(self.replica_timeout_ms)
    }

    /// Journal settings for one partition, rooted in its own subdirectory.
    pub fn archive_config(&self, name: &str, partition: u32) -> ArchiveConfig {
        ArchiveConfig {
            dir: self.data_dir.join(name),
            rotate_bytes: self.journal_rotate_bytes,
            rotate_min_interval: Duration::from_millis(self.journal_rotate_min_interval_ms),
            partition,
            ..ArchiveConfig::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid field: {0}")]
    InvalidField(String),
}
