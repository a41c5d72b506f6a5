//! Per-query event deduplication.
//!
//! Relays overlap, so one query fanned out over N relays can see the same
//! event up to N times. A deduplicator lives exactly as long as its query
//! (a channel join, a room fetch, a search) and is dropped with it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Seen-id set for one query.
#[derive(Debug, Default, Clone)]
pub struct EventDeduplicator {
    seen: HashSet<String>,
}

impl EventDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id`. Returns `true` the first time an id is seen.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }

    /// Wrap for use from subscription callbacks on several reader tasks.
    pub fn shared() -> SharedDeduplicator {
        SharedDeduplicator::default()
    }
}

/// Thread-safe handle to a deduplicator.
#[derive(Debug, Default, Clone)]
pub struct SharedDeduplicator {
    inner: Arc<Mutex<EventDeduplicator>>,
}

impl SharedDeduplicator {
    /// Same contract as [`EventDeduplicator::insert`].
    pub fn insert(&self, id: &str) -> bool {
        match self.inner.lock() {
            Ok(mut seen) => seen.insert(id),
            Err(poisoned) => poisoned.into_inner().insert(id),
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(seen) => seen.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
