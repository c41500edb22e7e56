//! In-process counter store.
//!
//! Serves as the fallback when the remote store is unreachable and as the only
//! backend for single-process deployments. State is lost on restart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::counter::CounterEntry;

/// Per-key fixed-window counters held in process memory.
///
/// Increments for the same key are serialized by the map's shard lock, so
/// concurrent requests never lose updates.
pub struct LocalCounterStore {
    entries: DashMap<String, CounterEntry>,
    clock: Arc<dyn Clock>,
    /// Soft cap; reaching it sweeps expired entries before inserting a new key
    max_entries: Option<usize>,
    /// Minimum time between capacity sweeps
    sweep_interval_ms: u64,
    /// Earliest time the next capacity sweep may run
    next_sweep_ms: AtomicU64,
}

/// Default minimum time between capacity sweeps.
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;

impl LocalCounterStore {
    /// Create a store reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            max_entries: None,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            next_sweep_ms: AtomicU64::new(0),
        }
    }

    /// Sweep expired entries when the store holds `max_entries` keys.
    ///
    /// The cap is soft: live entries are never evicted, so the map can grow
    /// past it. Each sweep walks the whole map, so sweeps run at most once
    /// per sweep interval.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    /// Minimum time between capacity sweeps.
    pub fn with_sweep_interval(mut self, sweep_interval_ms: u64) -> Self {
        self.sweep_interval_ms = sweep_interval_ms;
        self
    }

    /// The clock this store reads.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Count a request for `key` and report whether it is within `limit`.
    pub fn check_and_increment(&self, key: &str, limit: u64, window_ms: u64) -> bool {
        let now = self.clock.now_ms();

        if self.max_entries.is_some_and(|max| self.entries.len() >= max)
            && !self.entries.contains_key(key)
            && self.claim_sweep(now)
        {
            let purged = self.purge_expired_at(now);
            debug!(purged, "Local counter store at capacity, swept expired entries");
        }

        let count = match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.hit(now, window_ms);
                entry.count
            }
            Entry::Vacant(vacant) => vacant.insert(CounterEntry::fresh(now, window_ms)).count,
        };

        trace!(key, count, limit, "Local counter incremented");
        count <= limit
    }

    /// Current counter state for `key`, if any.
    pub fn get_state(&self, key: &str) -> Option<CounterEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    /// Forget the counter for `key`.
    pub fn reset(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Forget every counter.
    pub fn reset_all(&self) {
        self.entries.clear();
    }

    /// Drop counters whose window has ended. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(self.clock.now_ms())
    }

    /// Reserve the next capacity sweep for this caller if one is due.
    fn claim_sweep(&self, now: u64) -> bool {
        let due = self.next_sweep_ms.load(Ordering::Acquire);
        now >= due
            && self
                .next_sweep_ms
                .compare_exchange(
                    due,
                    now.saturating_add(self.sweep_interval_ms),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
    }

    fn purge_expired_at(&self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of tracked keys, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LocalCounterStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}
