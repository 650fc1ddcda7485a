//! In-memory cache engine with atomic mutation semantics.
//!
//! [`CacheEngine`] owns the key→entry mapping and byte-budget accounting for
//! one cache instance. Every committed mutation is stamped with a strictly
//! increasing event id and published synchronously, in commit order, to the
//! instance's [`kombu_events::NotificationHub`]; persistence, replication,
//! and eviction recency all hang off that one stream.
//!
//! Eviction is pluggable (LRU, random, disabled) via [`EvictionStrategy`].

pub mod engine;
pub mod entry;
pub mod eviction;

pub use engine::{CacheEngine, EngineConfig, MutateDirection, MutateError};
pub use entry::CacheValue;
pub use eviction::{EvictionStrategy, LruEviction, NullEviction, RandomEviction};
