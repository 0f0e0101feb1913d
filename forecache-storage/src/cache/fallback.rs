//! Bounded in-process fallback store.
//!
//! Used whenever the remote tier is unavailable. Entries expire lazily on
//! read. When an insert pushes the map past its capacity, one sweep removes
//! every expired entry; unexpired entries are never evicted, so a burst of
//! long-lived entries can hold the store above its nominal bound until they
//! expire. Over-capacity is logged, not treated as an error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use forecache_core::{add_duration, Clock, SubjectScope, Timestamp};

/// A value and the instant it stops being served.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FallbackEntry {
    value: String,
    expires_at: Timestamp,
}

/// In-process key to (value, expiry) map guarded by a single mutex.
#[derive(Debug)]
pub struct FallbackStore {
    entries: Mutex<HashMap<String, FallbackEntry>>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl FallbackStore {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
            clock,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries held, including expired ones not yet reclaimed.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Return the live value for `key`, dropping it if it has expired.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if now < entry.expires_at => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                tracing::debug!(key, "fallback entry expired on read");
                None
            }
            None => None,
        }
    }

    /// Insert or overwrite `key`, expiring `ttl` from now.
    pub fn set(&self, key: impl Into<String>, value: String, ttl: Duration) {
        let expires_at = add_duration(self.clock.now(), ttl);
        let mut entries = self.lock();
        entries.insert(key.into(), FallbackEntry { value, expires_at });

        if entries.len() > self.capacity {
            let reclaimed = Self::purge_locked(&mut entries, self.clock.now());
            if entries.len() > self.capacity {
                tracing::warn!(
                    size = entries.len(),
                    capacity = self.capacity,
                    reclaimed,
                    "Fallback store above capacity with no expired entries left to reclaim"
                );
            } else {
                tracing::debug!(reclaimed, "Fallback store swept expired entries");
            }
        }
    }

    /// Remove every key in `scope`, returning how many were removed.
    pub fn invalidate(&self, scope: &SubjectScope) -> u64 {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| !scope.matches(key));
        (before - entries.len()) as u64
    }

    /// Drop `key`. True if a live entry was removed.
    pub fn remove(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.lock()
            .remove(key)
            .is_some_and(|entry| now < entry.expires_at)
    }

    /// Drop every key starting with `prefix`, returning how many live entries went.
    pub fn remove_prefix(&self, prefix: &str) -> u64 {
        let now = self.clock.now();
        let mut removed = 0;
        self.lock().retain(|key, entry| {
            if !key.starts_with(prefix) {
                return true;
            }
            if now < entry.expires_at {
                removed += 1;
            }
            false
        });
        removed
    }

    /// Live keys starting with `prefix` and their remaining lifetimes.
    pub fn live_entries(&self, prefix: &str) -> Vec<(String, Duration)> {
        let now = self.clock.now();
        self.lock()
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && now < entry.expires_at)
            .map(|(key, entry)| {
                let remaining = (entry.expires_at - now).to_std().unwrap_or(Duration::ZERO);
                (key.clone(), remaining)
            })
            .collect()
    }

    /// Remove every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        Self::purge_locked(&mut self.lock(), now)
    }

    fn purge_locked(entries: &mut HashMap<String, FallbackEntry>, now: Timestamp) -> usize {
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        before - entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, FallbackEntry>> {
        // Map operations cannot leave it half-updated, so a poisoned lock is still usable.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
