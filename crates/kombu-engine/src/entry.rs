//! Stored entry representation.

use bytes::Bytes;
use std::time::SystemTime;

/// Value returned to readers: payload bytes plus the caller-supplied flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheValue {
    pub data: Bytes,
    pub flags: u64,
}

/// One stored key's record. Replaced wholesale on every mutation; append and
/// prepend build a fresh buffer rather than editing in place.
#[derive(Debug, Clone)]
pub(crate) struct StoredEntry {
    pub data: Bytes,
    pub flags: u64,
    /// `None` means the entry never expires.
    pub expiry: Option<SystemTime>,
    /// Event id of the mutation that last wrote this entry. Stamped onto
    /// snapshot notifications so they order correctly against history.
    pub event_id: u64,
}

impl StoredEntry {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        match self.expiry {
            Some(at) => at <= now,
            None => false,
        }
    }
}
