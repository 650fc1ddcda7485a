//! The cache engine: one instance per partition.
//!
//! All mutations serialize through a single lock so that notification
//! publication order equals commit order. The capacity/eviction check runs
//! under the same lock as the mutation that triggered it.

use crate::entry::{CacheValue, StoredEntry};
use crate::eviction::EvictionStrategy;
use bytes::{Bytes, BytesMut};
use kombu_events::{Notification, NotificationHub, StoreOperation};
use kombu_observe::{EngineEvt, EngineKind, Meter, VizEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

/// Configuration for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Byte budget for stored keys + values. Exceeding it triggers eviction.
    pub capacity_bytes: u64,
    /// Partition id, used only to label telemetry.
    pub partition: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 64 * 1024 * 1024,
            partition: 0,
        }
    }
}

/// Direction of a numeric mutate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutateDirection {
    Increment,
    Decrement,
}

/// Why a numeric mutate did not apply. Callers treat both cases as "not
/// applied"; the distinction exists for logging.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MutateError {
    #[error("key not found")]
    MissingKey,
    #[error("stored value is not an ASCII base-10 integer")]
    NotNumeric,
}

struct EngineCore {
    map: HashMap<String, StoredEntry>,
    used_bytes: u64,
    /// Next event id to assign; the first mutation gets id 1.
    next_event_id: u64,
}

impl EngineCore {
    fn next_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }
}

/// In-memory key/value store with memcached mutation semantics.
///
/// Precondition failures (add on an existing key, replace on a missing key,
/// a value larger than the whole budget, ...) are reported as boolean
/// "not applied" results and never emit a notification.
pub struct CacheEngine {
    capacity: u64,
    partition: u32,
    inner: Mutex<EngineCore>,
    hub: Arc<NotificationHub>,
    strategy: Arc<dyn EvictionStrategy>,
    meter: Arc<dyn Meter>,
}

impl CacheEngine {
    /// Creates an engine publishing to `hub`, registering the eviction
    /// strategy's bookkeeping on that hub if it has any.
    pub fn new(
        config: EngineConfig,
        hub: Arc<NotificationHub>,
        strategy: Arc<dyn EvictionStrategy>,
        meter: Arc<dyn Meter>,
    ) -> Self {
        if let Some(observer) = strategy.observer() {
            hub.add_observer(observer);
        }
        Self {
            capacity: config.capacity_bytes,
            partition: config.partition,
            inner: Mutex::new(EngineCore {
                map: HashMap::new(),
                used_bytes: 0,
                next_event_id: 1,
            }),
            hub,
            strategy,
            meter,
        }
    }

    /// Unconditional upsert. Fails only when the value alone exceeds the
    /// whole byte budget, in which case nothing is mutated.
    pub fn store(&self, key: &str, flags: u64, expiry: Option<SystemTime>, data: Bytes) -> bool {
        if self.oversized(&data) {
            return false;
        }
        let mut core = self.inner.lock();
        self.write_locked(&mut core, key, flags, expiry, data, StoreOperation::Set);
        true
    }

    /// Stores only if the key is absent (an expired entry counts as absent
    /// and is purged first).
    pub fn add(&self, key: &str, flags: u64, expiry: Option<SystemTime>, data: Bytes) -> bool {
        if self.oversized(&data) {
            return false;
        }
        let mut core = self.inner.lock();
        self.purge_if_expired(&mut core, key);
        if core.map.contains_key(key) {
            return false;
        }
        self.write_locked(&mut core, key, flags, expiry, data, StoreOperation::Add);
        true
    }

    /// Stores only if the key is present.
    pub fn replace(&self, key: &str, flags: u64, expiry: Option<SystemTime>, data: Bytes) -> bool {
        if self.oversized(&data) {
            return false;
        }
        let mut core = self.inner.lock();
        self.purge_if_expired(&mut core, key);
        if !core.map.contains_key(key) {
            return false;
        }
        self.write_locked(&mut core, key, flags, expiry, data, StoreOperation::Replace);
        true
    }

    /// Appends `data` after the existing value. The `flags` and `expiry`
    /// arguments exist for wire-protocol symmetry and are deliberately
    /// ignored: the existing entry's metadata is preserved.
    pub fn append(&self, key: &str, _flags: u64, _expiry: Option<SystemTime>, data: Bytes) -> bool {
        self.concat(key, data, StoreOperation::Append)
    }

    /// Prepends `data` before the existing value. Metadata policy matches
    /// [`CacheEngine::append`].
    pub fn prepend(&self, key: &str, _flags: u64, _expiry: Option<SystemTime>, data: Bytes) -> bool {
        self.concat(key, data, StoreOperation::Prepend)
    }

    fn concat(&self, key: &str, data: Bytes, operation: StoreOperation) -> bool {
        let mut core = self.inner.lock();
        self.purge_if_expired(&mut core, key);
        let Some(existing) = core.map.get(key) else {
            return false;
        };

        let mut buf = BytesMut::with_capacity(existing.data.len() + data.len());
        match operation {
            StoreOperation::Append => {
                buf.extend_from_slice(&existing.data);
                buf.extend_from_slice(&data);
            }
            _ => {
                buf.extend_from_slice(&data);
                buf.extend_from_slice(&existing.data);
            }
        }
        let combined = buf.freeze();
        if self.oversized(&combined) {
            return false;
        }

        let (flags, expiry) = (existing.flags, existing.expiry);
        self.write_locked(&mut core, key, flags, expiry, combined, operation);
        true
    }

    /// Interprets the stored bytes as an ASCII base-10 unsigned integer and
    /// adjusts it by `delta`, returning the new value's bytes.
    ///
    /// Overflow policy: increment wraps modulo 2^64, decrement saturates at
    /// zero. Flags and expiry of the entry are preserved.
    pub fn mutate(
        &self,
        key: &str,
        delta: u64,
        direction: MutateDirection,
    ) -> Result<Bytes, MutateError> {
        let mut core = self.inner.lock();
        self.purge_if_expired(&mut core, key);
        let result = (|| {
            let entry = core.map.get(key).ok_or(MutateError::MissingKey)?;
            let current = std::str::from_utf8(&entry.data)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or(MutateError::NotNumeric)?;
            let next = match direction {
                MutateDirection::Increment => current.wrapping_add(delta),
                MutateDirection::Decrement => current.saturating_sub(delta),
            };
            Ok((next, entry.flags, entry.expiry))
        })();

        match result {
            Ok((next, flags, expiry)) => {
                let data = Bytes::from(next.to_string());
                self.write_locked(&mut core, key, flags, expiry, data.clone(), StoreOperation::Set);
                Ok(data)
            }
            Err(e) => {
                tracing::debug!(key, error = %e, "numeric mutate not applied");
                Err(e)
            }
        }
    }

    /// Removes the key. Returns false (no notification) if it was absent.
    pub fn remove(&self, key: &str) -> bool {
        let mut core = self.inner.lock();
        self.remove_locked(&mut core, key).is_some()
    }

    /// Updates only the expiry of an existing entry.
    pub fn touch(&self, key: &str, expiry: Option<SystemTime>) -> bool {
        let mut core = self.inner.lock();
        self.purge_if_expired(&mut core, key);
        if !core.map.contains_key(key) {
            return false;
        }
        let event_id = core.next_id();
        if let Some(entry) = core.map.get_mut(key) {
            entry.expiry = expiry;
            entry.event_id = event_id;
        }
        self.hub.publish(Notification::Touch {
            event_id,
            key: key.to_string(),
            expiry,
        });
        true
    }

    /// Empties the cache and resets byte accounting, emitting one `Clear`.
    pub fn clear(&self) {
        let mut core = self.inner.lock();
        let entries = core.map.len() as u64;
        core.map.clear();
        core.used_bytes = 0;
        let event_id = core.next_id();
        self.hub.publish(Notification::Clear { event_id });
        self.meter.emit(VizEvent::Engine(EngineEvt {
            partition: self.partition,
            kind: EngineKind::Cleared { entries },
        }));
    }

    /// Looks up a key. An expired entry is lazily purged (emitting `Remove`)
    /// before reporting a miss.
    pub fn get(&self, key: &str) -> Option<CacheValue> {
        let mut core = self.inner.lock();
        self.purge_if_expired(&mut core, key);
        core.map.get(key).map(|entry| CacheValue {
            data: entry.data.clone(),
            flags: entry.flags,
        })
    }

    /// Current key set. Snapshot of a moment; used by enumeration callers.
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().map.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }

    /// Bytes currently accounted against the budget.
    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().used_bytes
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    /// Full-state dump: one snapshot-marked `Store` per live entry, stamped
    /// with the event id that last wrote it, in ascending id order.
    pub fn snapshot(&self) -> Vec<Notification> {
        let core = self.inner.lock();
        let now = SystemTime::now();
        let mut notes: Vec<Notification> = core
            .map
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| Notification::Store {
                event_id: entry.event_id,
                key: key.clone(),
                data: entry.data.clone(),
                operation: StoreOperation::Set,
                flags: entry.flags,
                expiry: entry.expiry,
                is_snapshot: true,
            })
            .collect();
        notes.sort_by_key(Notification::event_id);
        notes
    }

    /// Replay application: applies the event unconditionally (no add/replace
    /// precondition checks; they held when the event was committed), never
    /// publishes, and advances the event counter past the replayed id.
    pub fn apply(&self, note: &Notification) {
        let mut core = self.inner.lock();
        match note {
            Notification::Store {
                event_id,
                key,
                data,
                flags,
                expiry,
                ..
            } => {
                if let Some(old) = core.map.get(key) {
                    core.used_bytes -= Self::entry_size(key, &old.data);
                }
                core.used_bytes += Self::entry_size(key, data);
                core.map.insert(
                    key.clone(),
                    StoredEntry {
                        data: data.clone(),
                        flags: *flags,
                        expiry: *expiry,
                        event_id: *event_id,
                    },
                );
            }
            Notification::Remove { key, .. } => {
                if let Some(old) = core.map.remove(key) {
                    core.used_bytes -= Self::entry_size(key, &old.data);
                }
            }
            Notification::Touch {
                event_id,
                key,
                expiry,
            } => {
                if let Some(entry) = core.map.get_mut(key) {
                    entry.expiry = *expiry;
                    entry.event_id = *event_id;
                }
            }
            Notification::Clear { .. } => {
                core.map.clear();
                core.used_bytes = 0;
            }
        }
        core.next_event_id = core.next_event_id.max(note.event_id() + 1);
    }

    fn oversized(&self, data: &Bytes) -> bool {
        if data.len() as u64 > self.capacity {
            tracing::debug!(
                len = data.len(),
                capacity = self.capacity,
                "value larger than byte budget, store not applied"
            );
            return true;
        }
        false
    }

    fn entry_size(key: &str, data: &Bytes) -> u64 {
        (key.len() + data.len()) as u64
    }

    /// Commits a store-family write: accounting, id stamp, publish, evict.
    fn write_locked(
        &self,
        core: &mut EngineCore,
        key: &str,
        flags: u64,
        expiry: Option<SystemTime>,
        data: Bytes,
        operation: StoreOperation,
    ) {
        if let Some(old) = core.map.get(key) {
            core.used_bytes -= Self::entry_size(key, &old.data);
        }
        core.used_bytes += Self::entry_size(key, &data);
        let event_id = core.next_id();
        core.map.insert(
            key.to_string(),
            StoredEntry {
                data: data.clone(),
                flags,
                expiry,
                event_id,
            },
        );
        self.hub.publish(Notification::Store {
            event_id,
            key: key.to_string(),
            data,
            operation,
            flags,
            expiry,
            is_snapshot: false,
        });
        self.evict_locked(core);
    }

    /// Removes `key` and emits its `Remove`; returns the bytes freed.
    fn remove_locked(&self, core: &mut EngineCore, key: &str) -> Option<u64> {
        let entry = core.map.remove(key)?;
        let freed = Self::entry_size(key, &entry.data);
        core.used_bytes -= freed;
        let event_id = core.next_id();
        self.hub.publish(Notification::Remove {
            event_id,
            key: key.to_string(),
        });
        Some(freed)
    }

    fn purge_if_expired(&self, core: &mut EngineCore, key: &str) {
        let expired = core
            .map
            .get(key)
            .map(|entry| entry.is_expired(SystemTime::now()))
            .unwrap_or(false);
        if expired {
            self.remove_locked(core, key);
            self.meter.emit(VizEvent::Engine(EngineEvt {
                partition: self.partition,
                kind: EngineKind::Expired,
            }));
        }
    }

    /// Evicts until back under budget. Each eviction is an ordinary remove
    /// and emits its own `Remove` notification.
    fn evict_locked(&self, core: &mut EngineCore) {
        while core.used_bytes > self.capacity {
            let keys: Vec<String> = core.map.keys().cloned().collect();
            let Some(victim) = self.strategy.pick_victim(&keys) else {
                self.meter.emit(VizEvent::Engine(EngineEvt {
                    partition: self.partition,
                    kind: EngineKind::OverCapacity {
                        used: core.used_bytes,
                        budget: self.capacity,
                    },
                }));
                break;
            };
            match self.remove_locked(core, &victim) {
                Some(freed) => {
                    self.meter.emit(VizEvent::Engine(EngineEvt {
                        partition: self.partition,
                        kind: EngineKind::Evicted { bytes: freed },
                    }));
                }
                None => {
                    tracing::warn!(victim, "eviction strategy picked an absent key");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::{LruEviction, NullEviction, RandomEviction};
    use kombu_events::NotificationObserver;
    use kombu_observe::NoopMeter;
    use std::time::Duration;

    struct Recorder {
        seen: Mutex<Vec<Notification>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }

        fn ids(&self) -> Vec<u64> {
            self.seen.lock().iter().map(Notification::event_id).collect()
        }
    }

    impl NotificationObserver for Recorder {
        fn notify(&self, note: &Notification) {
            self.seen.lock().push(note.clone());
        }
    }

    fn engine_with(
        capacity: u64,
        strategy: Arc<dyn EvictionStrategy>,
    ) -> (CacheEngine, Arc<Recorder>) {
        let hub = Arc::new(NotificationHub::new(64));
        let recorder = Recorder::new();
        hub.add_observer(recorder.clone());
        let engine = CacheEngine::new(
            EngineConfig {
                capacity_bytes: capacity,
                partition: 0,
            },
            hub,
            strategy,
            Arc::new(NoopMeter),
        );
        (engine, recorder)
    }

    fn engine(capacity: u64) -> (CacheEngine, Arc<Recorder>) {
        engine_with(capacity, Arc::new(NullEviction))
    }

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_store_get_roundtrip() {
        let (engine, _) = engine(1024);
        assert!(engine.store("my_key", 911, None, b("Payload")));

        let value = engine.get("my_key").unwrap();
        assert_eq!(value.data, b("Payload"));
        assert_eq!(value.flags, 911);
    }

    #[test]
    fn test_event_ids_are_gapless_and_ordered() {
        let (engine, recorder) = engine(1024);
        engine.store("a", 0, None, b("1"));
        engine.store("b", 0, None, b("2"));
        engine.remove("a");
        engine.touch("b", None);
        engine.clear();

        assert_eq!(recorder.ids(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_add_only_when_absent() {
        let (engine, recorder) = engine(1024);
        assert!(engine.add("k", 1, None, b("v1")));
        assert!(!engine.add("k", 2, None, b("v2")));
        assert_eq!(engine.get("k").unwrap().data, b("v1"));
        // The failed add emitted nothing.
        assert_eq!(recorder.ids(), vec![1]);
    }

    #[test]
    fn test_replace_only_when_present() {
        let (engine, _) = engine(1024);
        assert!(!engine.replace("k", 0, None, b("v")));
        engine.store("k", 0, None, b("v"));
        assert!(engine.replace("k", 5, None, b("v2")));
        let value = engine.get("k").unwrap();
        assert_eq!(value.data, b("v2"));
        assert_eq!(value.flags, 5);
    }

    #[test]
    fn test_append_prepend_preserve_metadata() {
        let (engine, _) = engine(1024);
        let expiry = Some(SystemTime::now() + Duration::from_secs(3600));
        engine.store("k", 7, expiry, b("mid"));

        // Caller metadata on the concat path is ignored.
        assert!(engine.append("k", 99, None, b("-end")));
        assert!(engine.prepend("k", 99, None, b("start-")));

        let value = engine.get("k").unwrap();
        assert_eq!(value.data, b("start-mid-end"));
        assert_eq!(value.flags, 7);
    }

    #[test]
    fn test_append_requires_existing_key() {
        let (engine, recorder) = engine(1024);
        assert!(!engine.append("nope", 0, None, b("x")));
        assert!(recorder.ids().is_empty());
    }

    #[test]
    fn test_mutate_increment_and_decrement() {
        let (engine, _) = engine(1024);
        engine.store("n", 3, None, b("10"));

        let up = engine.mutate("n", 5, MutateDirection::Increment).unwrap();
        assert_eq!(up, b("15"));

        let down = engine.mutate("n", 100, MutateDirection::Decrement).unwrap();
        assert_eq!(down, b("0")); // floors at zero

        // Flags survive the rewrite.
        assert_eq!(engine.get("n").unwrap().flags, 3);
    }

    #[test]
    fn test_mutate_increment_wraps() {
        let (engine, _) = engine(1024);
        engine.store("n", 0, None, Bytes::from(u64::MAX.to_string()));
        let v = engine.mutate("n", 1, MutateDirection::Increment).unwrap();
        assert_eq!(v, b("0"));
    }

    #[test]
    fn test_mutate_failures_leave_value_untouched() {
        let (engine, _) = engine(1024);
        assert_eq!(
            engine.mutate("absent", 1, MutateDirection::Increment),
            Err(MutateError::MissingKey)
        );

        engine.store("s", 0, None, b("not a number"));
        assert_eq!(
            engine.mutate("s", 1, MutateDirection::Increment),
            Err(MutateError::NotNumeric)
        );
        assert_eq!(engine.get("s").unwrap().data, b("not a number"));
    }

    #[test]
    fn test_remove_absent_is_silent() {
        let (engine, recorder) = engine(1024);
        assert!(!engine.remove("ghost"));
        assert!(recorder.ids().is_empty());
    }

    #[test]
    fn test_expired_entry_is_lazily_purged() {
        let (engine, recorder) = engine(1024);
        let past = Some(SystemTime::now() - Duration::from_secs(1));
        engine.store("old", 0, past, b("v"));

        assert!(engine.get("old").is_none());
        // Store then lazy Remove.
        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(matches!(&seen[1], Notification::Remove { key, .. } if key == "old"));
    }

    #[test]
    fn test_touch_moves_expiry() {
        let (engine, recorder) = engine(1024);
        engine.store("k", 0, None, b("v"));
        let future = Some(SystemTime::now() + Duration::from_secs(60));
        assert!(engine.touch("k", future));
        assert!(!engine.touch("ghost", future));

        assert!(matches!(
            &recorder.seen.lock()[1],
            Notification::Touch { key, .. } if key == "k"
        ));
    }

    #[test]
    fn test_oversized_store_rejected_without_mutation() {
        let (engine, recorder) = engine(4);
        assert!(!engine.store("k", 0, None, b("too large")));
        assert_eq!(engine.len(), 0);
        assert!(recorder.ids().is_empty());
    }

    #[test]
    fn test_clear_resets_accounting() {
        let (engine, _) = engine(1024);
        engine.store("a", 0, None, b("1"));
        engine.store("b", 0, None, b("2"));
        engine.clear();
        assert_eq!(engine.len(), 0);
        assert_eq!(engine.used_bytes(), 0);
        assert!(engine.get("a").is_none());
    }

    #[test]
    fn test_lru_evicts_coldest_key() {
        // Each entry is 5 bytes (1-byte key + 4-byte value); budget fits two.
        let (engine, _) = engine_with(10, Arc::new(LruEviction::new()));
        engine.store("a", 0, None, b("aaaa"));
        engine.store("b", 0, None, b("bbbb"));
        // Re-store "a" so "b" becomes least recently used.
        engine.store("a", 0, None, b("aaaa"));
        engine.store("c", 0, None, b("cccc"));

        assert!(engine.get("b").is_none());
        assert!(engine.get("a").is_some());
        assert!(engine.get("c").is_some());
        assert!(engine.used_bytes() <= 10);
    }

    #[test]
    fn test_eviction_ids_stay_gapless() {
        let (engine, recorder) = engine_with(10, Arc::new(LruEviction::new()));
        engine.store("a", 0, None, b("aaaa"));
        engine.store("b", 0, None, b("bbbb"));
        engine.store("c", 0, None, b("cccc")); // evicts "a"

        assert_eq!(recorder.ids(), vec![1, 2, 3, 4]);
        assert!(matches!(
            &recorder.seen.lock()[3],
            Notification::Remove { key, .. } if key == "a"
        ));
    }

    #[test]
    fn test_random_eviction_keeps_budget() {
        let (engine, _) = engine_with(30, Arc::new(RandomEviction));
        for i in 0..20 {
            engine.store(&format!("key{i}"), 0, None, b("value"));
        }
        assert!(engine.used_bytes() <= 30);
        assert!(engine.len() > 0);
    }

    #[test]
    fn test_null_eviction_allows_over_budget() {
        let (engine, _) = engine_with(4, Arc::new(NullEviction));
        engine.store("a", 0, None, b("abc"));
        engine.store("b", 0, None, b("abc"));
        assert_eq!(engine.len(), 2);
        assert!(engine.used_bytes() > 4);
    }

    #[test]
    fn test_snapshot_marks_events_and_keeps_ids() {
        let (engine, _) = engine(1024);
        engine.store("a", 1, None, b("1")); // id 1
        engine.store("b", 2, None, b("2")); // id 2
        engine.store("a", 3, None, b("3")); // id 3

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].event_id(), 2); // "b"
        assert_eq!(snapshot[1].event_id(), 3); // latest write of "a"
        for note in &snapshot {
            assert!(matches!(note, Notification::Store { is_snapshot: true, .. }));
        }
    }

    #[test]
    fn test_apply_replays_without_publishing() {
        let (engine, recorder) = engine(1024);
        engine.apply(&Notification::Store {
            event_id: 7,
            key: "k".to_string(),
            data: b("v"),
            operation: StoreOperation::Add,
            flags: 9,
            expiry: None,
            is_snapshot: false,
        });

        assert!(recorder.ids().is_empty());
        assert_eq!(engine.get("k").unwrap().flags, 9);

        // The counter continues after the highest replayed id.
        engine.store("next", 0, None, b("v"));
        assert_eq!(recorder.ids(), vec![8]);
    }

    #[test]
    fn test_apply_clear_wipes_replayed_state() {
        let (engine, _) = engine(1024);
        engine.apply(&Notification::Store {
            event_id: 1,
            key: "k".to_string(),
            data: b("v"),
            operation: StoreOperation::Set,
            flags: 0,
            expiry: None,
            is_snapshot: false,
        });
        engine.apply(&Notification::Clear { event_id: 2 });
        assert_eq!(engine.len(), 0);
        assert_eq!(engine.used_bytes(), 0);
    }
}
