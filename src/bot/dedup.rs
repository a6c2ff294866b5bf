// src/bot/dedup.rs - Bounded-memory deduplication of the polled event feed

use std::collections::{HashSet, VecDeque};

use crate::types::{EventKey, RoomEvent};

/// Hard cap on remembered event fingerprints.
pub const MAX_SEEN_EVENTS: usize = 1000;
/// When the cap is exceeded, only this many most-recent fingerprints
/// survive.
pub const KEEP_SEEN_EVENTS: usize = 500;

/// Filters each polled snapshot down to events not seen before. The feed is
/// re-read in full every poll, so almost everything in a snapshot is old
/// news; this keeps a bounded, insertion-ordered set of fingerprints and
/// drops anything already in it.
pub struct EventDeduplicator {
    seen: HashSet<EventKey>,
    order: VecDeque<EventKey>,
    max_entries: usize,
    keep_entries: usize,
}

impl EventDeduplicator {
    pub fn new() -> Self {
        Self::with_limits(MAX_SEEN_EVENTS, KEEP_SEEN_EVENTS)
    }

    pub fn with_limits(max_entries: usize, keep_entries: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            max_entries,
            keep_entries,
        }
    }

    /// Keep only events whose fingerprint has not been seen, preserving the
    /// snapshot's order, and remember the new fingerprints. Truncation runs
    /// after the whole batch, so an event is never evicted before it has
    /// been returned once.
    pub fn filter_new(&mut self, events: Vec<RoomEvent>) -> Vec<RoomEvent> {
        let mut fresh = Vec::new();

        for event in events {
            let key = event.key();
            if self.seen.contains(&key) {
                continue;
            }
            self.seen.insert(key.clone());
            self.order.push_back(key);
            fresh.push(event);
        }

        if self.order.len() > self.max_entries {
            while self.order.len() > self.keep_entries {
                if let Some(oldest) = self.order.pop_front() {
                    self.seen.remove(&oldest);
                }
            }
        }

        fresh
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for EventDeduplicator {
    fn default() -> Self {
        Self::new()
    }
}
