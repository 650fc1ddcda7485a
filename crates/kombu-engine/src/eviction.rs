//! Pluggable eviction strategies.
//!
//! A strategy never mutates the engine directly: the engine asks it for a
//! victim while holding the commit lock, performs the remove itself, and the
//! resulting `Remove` notification flows back into the strategy's
//! bookkeeping through the hub. Bookkeeping is guarded by the strategy's own
//! lock, independent of the engine's.

use kombu_events::{Notification, NotificationObserver};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::sync::Arc;

/// Selects which key to remove when the engine is over its byte budget.
pub trait EvictionStrategy: Send + Sync {
    /// Bookkeeping hook to register on the engine's notification hub, if the
    /// strategy tracks the mutation stream.
    fn observer(&self) -> Option<Arc<dyn NotificationObserver>>;

    /// Picks the next victim. `keys` is the engine's current key set; called
    /// under the engine's commit lock, so it must not block. Returning
    /// `None` ends the eviction loop.
    fn pick_victim(&self, keys: &[String]) -> Option<String>;
}

/// Recency list shared between the LRU strategy and its observer half.
#[derive(Default)]
struct LruState {
    /// Front is least recently used, back is most recently used.
    order: Mutex<VecDeque<String>>,
}

impl LruState {
    fn promote(&self, key: &str) {
        let mut order = self.order.lock();
        order.retain(|k| k != key);
        order.push_back(key.to_string());
    }

    fn forget(&self, key: &str) {
        self.order.lock().retain(|k| k != key);
    }
}

impl NotificationObserver for LruState {
    fn notify(&self, note: &Notification) {
        match note {
            Notification::Store { key, .. } | Notification::Touch { key, .. } => {
                self.promote(key);
            }
            Notification::Remove { key, .. } => self.forget(key),
            Notification::Clear { .. } => self.order.lock().clear(),
        }
    }
}

/// Evicts the key least recently touched by the mutation stream.
pub struct LruEviction {
    state: Arc<LruState>,
}

impl LruEviction {
    pub fn new() -> Self {
        Self {
            state: Arc::new(LruState::default()),
        }
    }
}

impl Default for LruEviction {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionStrategy for LruEviction {
    fn observer(&self) -> Option<Arc<dyn NotificationObserver>> {
        Some(self.state.clone())
    }

    fn pick_victim(&self, _keys: &[String]) -> Option<String> {
        self.state.order.lock().front().cloned()
    }
}

/// Evicts a uniformly random key from the engine's current key set.
#[derive(Default)]
pub struct RandomEviction;

impl EvictionStrategy for RandomEviction {
    fn observer(&self) -> Option<Arc<dyn NotificationObserver>> {
        None
    }

    fn pick_victim(&self, keys: &[String]) -> Option<String> {
        keys.choose(&mut rand::thread_rng()).cloned()
    }
}

/// Eviction disabled: the engine may exceed its byte budget.
#[derive(Default)]
pub struct NullEviction;

impl EvictionStrategy for NullEviction {
    fn observer(&self) -> Option<Arc<dyn NotificationObserver>> {
        None
    }

    fn pick_victim(&self, _keys: &[String]) -> Option<String> {
        None
    }
}
