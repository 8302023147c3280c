//! Fingerprint suppression.
//!
//! A sharded concurrent map from fingerprint to window expiry. The entry
//! API gives compare-and-swap semantics per shard: when several requests
//! race on the same expired or absent fingerprint, exactly one wins and
//! the rest are duplicates. A background sweeper evicts expired entries;
//! a hard cap bounds memory under high-cardinality attacks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

/// Interval between sweeper passes.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Suppressed {
    /// Entries carry their own expiry so per-project windows are honored.
    expires_at: DateTime<Utc>,
}

/// Sharded suppression map.
pub struct SuppressionMap {
    entries: DashMap<String, Suppressed>,
    max_entries: usize,
}

impl SuppressionMap {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    /// Admit or suppress a fingerprint. Returns `true` when this caller
    /// won the slot (the event should proceed), `false` when a live entry
    /// already covers the window.
    pub fn check_and_insert(&self, fingerprint: &str, window: Duration) -> bool {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());

        // Capacity is checked before taking the entry (its shard lock must
        // not be held while sizing the map). The cap is approximate under
        // races, which is fine for a memory bound.
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(fingerprint) {
            self.sweep();
            if self.entries.len() >= self.max_entries {
                // At capacity even after sweeping: admit without recording
                // rather than grow without bound.
                warn!(cap = self.max_entries, "suppression map at capacity");
                return true;
            }
        }

        match self.entries.entry(fingerprint.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    false
                } else {
                    // Expired slot: the entry lock makes this swap the CAS
                    // winner; losers observe the fresh expiry above.
                    occupied.insert(Suppressed { expires_at });
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Suppressed { expires_at });
                true
            }
        }
    }

    /// Drop expired entries.
    pub fn sweep(&self) {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "suppression sweep");
        }
    }

    /// Live entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn the minutely sweeper. The task runs for the process lifetime.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let map = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                map.sweep();
            }
        })
    }
}
