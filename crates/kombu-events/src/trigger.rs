//! Threshold-based, rate-limited signal generation.
//!
//! Drives decisions like "rotate the journal file" off a stream of
//! write-size deltas without reacting to every single write.

use std::time::{Duration, Instant};

/// Accumulates deltas and fires once the running total exceeds a threshold,
/// at most once per `min_interval`.
///
/// Firing resets the accumulator and re-arms. A total that crosses the
/// threshold inside the rate-limit window is held: the trigger fires on the
/// first `offer` after the window passes.
#[derive(Debug)]
pub struct ThresholdTrigger {
    threshold: u64,
    min_interval: Duration,
    accumulated: u64,
    last_fired: Option<Instant>,
}

impl ThresholdTrigger {
    pub fn new(threshold: u64, min_interval: Duration) -> Self {
        Self {
            threshold,
            min_interval,
            accumulated: 0,
            last_fired: None,
        }
    }

    /// Adds `delta` to the running total; returns true if the trigger fires.
    pub fn offer(&mut self, delta: u64) -> bool {
        self.accumulated = self.accumulated.saturating_add(delta);
        if self.accumulated <= self.threshold {
            return false;
        }
        if let Some(last) = self.last_fired {
            if last.elapsed() < self.min_interval {
                return false; // held until the window passes
            }
        }
        self.accumulated = 0;
        self.last_fired = Some(Instant::now());
        true
    }

    /// Running total since the last firing.
    pub fn accumulated(&self) -> u64 {
        self.accumulated
    }
}
