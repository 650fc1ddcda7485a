//! Publish/subscribe fan-out for committed mutations.
//!
//! Two subscriber classes with different delivery contracts:
//! - Synchronous observers run on the committing thread, in commit order,
//!   before the mutation call returns. They must not block (no I/O, no
//!   suspension); eviction bookkeeping lives here.
//! - Asynchronous subscribers receive events over a bounded broadcast
//!   channel. A subscriber that falls more than the channel capacity behind
//!   observes `Lagged` and must treat itself as failed; the hub never blocks
//!   the committing thread on a slow consumer.

use crate::notification::Notification;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Callback invoked synchronously for every published notification.
pub trait NotificationObserver: Send + Sync {
    fn notify(&self, note: &Notification);
}

/// Fan-out point for one cache engine's notification stream.
pub struct NotificationHub {
    observers: RwLock<Vec<Arc<dyn NotificationObserver>>>,
    sender: broadcast::Sender<Notification>,
}

impl NotificationHub {
    /// Creates a hub whose async subscribers buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            observers: RwLock::new(Vec::new()),
            sender,
        }
    }

    /// Registers a synchronous observer. Observers are invoked in
    /// registration order on the committing thread.
    pub fn add_observer(&self, observer: Arc<dyn NotificationObserver>) {
        self.observers.write().push(observer);
    }

    /// Opens a new asynchronous subscription starting at the next published
    /// event.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// Delivers one notification: observers first, then the broadcast
    /// channel. Called under the engine's commit lock, so delivery order
    /// equals commit order.
    pub fn publish(&self, note: Notification) {
        for observer in self.observers.read().iter() {
            observer.notify(&note);
        }
        // Send fails only when no receiver exists, which is fine.
        let _ = self.sender.send(note);
    }

    /// Number of currently attached async subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
