//! Snapshot + tail stream merging.
//!
//! A new subscriber that needs full state bootstraps from a snapshot stream
//! while live mutations keep flowing. [`combine`] buffers the live side
//! until the snapshot drains, then emits the union sorted by event id with
//! duplicates removed, then switches to direct pass-through.

use crate::notification::Notification;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::{broadcast, mpsc};

/// Output channel depth for the combined stream.
const OUTPUT_DEPTH: usize = 64;

/// Merges a historic (snapshot) stream with the live tail into one ordered,
/// deduplicated stream.
///
/// While `historic` drains, live events are held in a bounded buffer of
/// `buffer_limit` events. On overflow the oldest buffered live event is
/// dropped: the oldest live events are exactly the ones most likely to also
/// appear in the snapshot, and every drop is counted and logged. Once the
/// snapshot completes, buffered historic + live events are emitted in
/// ascending event-id order (each id once), after which live events pass
/// straight through, skipping any id at or below the last emitted one.
pub fn combine(
    historic: mpsc::Receiver<Notification>,
    live: broadcast::Receiver<Notification>,
    buffer_limit: usize,
) -> mpsc::Receiver<Notification> {
    let (tx, out) = mpsc::channel(OUTPUT_DEPTH);
    tokio::spawn(run(historic, live, buffer_limit, tx));
    out
}

async fn run(
    mut historic: mpsc::Receiver<Notification>,
    mut live: broadcast::Receiver<Notification>,
    buffer_limit: usize,
    tx: mpsc::Sender<Notification>,
) {
    let mut merged: BTreeMap<u64, Notification> = BTreeMap::new();
    let mut buffered: VecDeque<Notification> = VecDeque::new();
    let mut dropped = 0u64;
    let mut live_open = true;

    // Phase 1: drain the snapshot, buffering the live tail.
    loop {
        tokio::select! {
            h = historic.recv() => match h {
                Some(note) => {
                    merged.insert(note.event_id(), note);
                }
                None => break,
            },
            l = live.recv(), if live_open => match l {
                Ok(note) => {
                    if buffered.len() >= buffer_limit {
                        buffered.pop_front();
                        dropped += 1;
                    }
                    buffered.push_back(note);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "live stream lagged during snapshot drain");
                }
                Err(broadcast::error::RecvError::Closed) => live_open = false,
            },
        }
    }

    if dropped > 0 {
        tracing::warn!(dropped, "combine buffer overflowed, oldest live events dropped");
    }

    for note in buffered {
        merged.entry(note.event_id()).or_insert(note);
    }

    let mut last_emitted = 0u64;
    for (event_id, note) in merged {
        if tx.send(note).await.is_err() {
            return;
        }
        last_emitted = event_id;
    }

    // Phase 2: pass the live tail through directly.
    while live_open {
        match live.recv().await {
            Ok(note) => {
                if note.event_id() <= last_emitted {
                    continue; // already emitted from the merge
                }
                last_emitted = note.event_id();
                if tx.send(note).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "live stream lagged in pass-through");
            }
            Err(broadcast::error::RecvError::Closed) => live_open = false,
        }
    }
}
