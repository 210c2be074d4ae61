//! Snapshot cache
//!
//! Holds the subscription set and the snapshot map under one lock so the two
//! never disagree. Records are handed out as `Arc`s and replaced wholesale on
//! every change, so a reader never sees a half-applied update.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::{MarketSnapshot, MarketUpdate};

#[derive(Debug, Default)]
struct CacheState {
    subscriptions: HashSet<String>,
    snapshots: HashMap<String, Arc<MarketSnapshot>>,
}

/// Subscription set plus last-known snapshot per subscribed instrument
#[derive(Debug, Default)]
pub struct SnapshotCache {
    state: Mutex<CacheState>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark `key` as subscribed. Returns false when it already was.
    pub fn add_subscription(&self, key: &str) -> bool {
        self.state().subscriptions.insert(key.to_string())
    }

    /// Drop the subscription and evict its snapshot. Returns false when
    /// `key` was not subscribed.
    pub fn remove_subscription(&self, key: &str) -> bool {
        let mut state = self.state();
        state.snapshots.remove(key);
        state.subscriptions.remove(key)
    }

    pub fn is_subscribed(&self, key: &str) -> bool {
        self.state().subscriptions.contains(key)
    }

    /// Currently subscribed keys, sorted
    pub fn subscriptions(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state().subscriptions.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Replace the cached record with a full snapshot.
    ///
    /// Only subscribed keys are cached; the stored record is returned.
    pub fn store_snapshot(&self, snapshot: MarketSnapshot) -> Option<Arc<MarketSnapshot>> {
        let mut state = self.state();
        if !state.subscriptions.contains(&snapshot.key) {
            debug!(key = %snapshot.key, "Snapshot for unsubscribed key not cached");
            return None;
        }
        let record = Arc::new(snapshot);
        state.snapshots.insert(record.key.clone(), record.clone());
        Some(record)
    }

    /// Clone the current record (or start a sparse one), apply `update` and
    /// swap the result in. Updates for unsubscribed keys are dropped.
    pub fn apply_update(&self, update: &MarketUpdate) -> Option<Arc<MarketSnapshot>> {
        let mut state = self.state();
        if !state.subscriptions.contains(&update.key) {
            debug!(key = %update.key, "Update for unsubscribed key dropped");
            return None;
        }

        let mut next = match state.snapshots.get(&update.key) {
            Some(current) => MarketSnapshot::clone(current),
            None => MarketSnapshot::new(&update.key),
        };
        update.apply_to(&mut next);

        let record = Arc::new(next);
        state.snapshots.insert(update.key.clone(), record.clone());
        Some(record)
    }

    pub fn get(&self, key: &str) -> Option<Arc<MarketSnapshot>> {
        self.state().snapshots.get(key).cloned()
    }

    pub fn snapshots(&self) -> Vec<Arc<MarketSnapshot>> {
        self.state().snapshots.values().cloned().collect()
    }

    /// Number of cached snapshots
    pub fn len(&self) -> usize {
        self.state().snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty both the set and the cache, returning the keys that were subscribed
    pub fn clear(&self) -> Vec<String> {
        let mut state = self.state();
        state.snapshots.clear();
        let mut keys: Vec<String> = state.subscriptions.drain().collect();
        keys.sort();
        keys
    }
}
