//! Ordered mutation notification pipeline.
//!
//! Every committed mutation on a cache engine becomes a [`Notification`]
//! carrying a per-instance, strictly increasing event id. This crate owns:
//! - The notification types themselves
//! - [`NotificationHub`]: synchronous observers on the commit thread plus a
//!   bounded broadcast channel for asynchronous consumers
//! - [`combine`]: merging a snapshot stream with the live tail into one
//!   deduplicated, id-ordered stream
//! - [`ThresholdTrigger`]: rate-limited "enough bytes since last time" signal

pub mod combine;
pub mod hub;
pub mod notification;
pub mod trigger;

pub use combine::combine;
pub use hub::{NotificationHub, NotificationObserver};
pub use notification::{Notification, StoreOperation};
pub use trigger::ThresholdTrigger;
