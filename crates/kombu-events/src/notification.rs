//! Notification types describing committed cache mutations.

use bytes::Bytes;
use std::time::SystemTime;

/// Which store-family operation produced a `Store` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

/// Immutable record of one committed mutation.
///
/// Event ids are assigned exactly once, at commit time, under the engine's
/// serialization point: for any single engine instance they are unique,
/// strictly increasing, and gapless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Store {
        event_id: u64,
        key: String,
        data: Bytes,
        operation: StoreOperation,
        flags: u64,
        /// `None` means the entry never expires.
        expiry: Option<SystemTime>,
        /// True for events synthesized by a full-state dump rather than a
        /// live mutation. Snapshot events carry the id of the mutation that
        /// last wrote the entry, so they order correctly against history.
        is_snapshot: bool,
    },
    Remove {
        event_id: u64,
        key: String,
    },
    Touch {
        event_id: u64,
        key: String,
        expiry: Option<SystemTime>,
    },
    Clear {
        event_id: u64,
    },
}

impl Notification {
    /// The per-instance sequence number of this event.
    pub fn event_id(&self) -> u64 {
        match self {
            Notification::Store { event_id, .. }
            | Notification::Remove { event_id, .. }
            | Notification::Touch { event_id, .. }
            | Notification::Clear { event_id } => *event_id,
        }
    }

    /// The key this event touches, if it is key-scoped.
    pub fn key(&self) -> Option<&str> {
        match self {
            Notification::Store { key, .. }
            | Notification::Remove { key, .. }
            | Notification::Touch { key, .. } => Some(key),
            Notification::Clear { .. } => None,
        }
    }
}
