//! Periodically flushed key/value cache.
//!
//! Entries do not expire individually: once `ttl` has passed since the last
//! flush, the next read clears the whole map.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

struct Inner<K, V> {
    last_reset: DateTime<Utc>,
    entries: HashMap<K, V>,
}

/// Cache that drops every entry once per `ttl`.
pub struct StaleCache<K, V> {
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    inner: RwLock<Inner<K, V>>,
}

impl<K, V> StaleCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Creates an empty cache flushed every `ttl`.
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        let now = clock.now();
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            clock,
            inner: RwLock::new(Inner {
                last_reset: now,
                entries: HashMap::new(),
            }),
        }
    }

    /// Flushes the cache if `ttl` has elapsed since the last flush.
    ///
    /// Returns true when a flush happened.
    pub fn reset_if_stale(&self) -> bool {
        let now = self.clock.now();
        if now - self.inner.read().last_reset < self.ttl {
            return false;
        }
        let mut inner = self.inner.write();
        // Another writer may have flushed in between.
        if now - inner.last_reset < self.ttl {
            return false;
        }
        inner.entries.clear();
        inner.last_reset = now;
        true
    }

    /// Looks up `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        self.reset_if_stale();
        self.inner.read().entries.get(key).cloned()
    }

    /// Stores `value` under `key`.
    pub fn insert(&self, key: K, value: V) {
        self.inner.write().entries.insert(key, value);
    }

    /// Returns the cached value or stores the one produced by `make`.
    pub fn get_or_insert_with(&self, key: K, make: impl FnOnce() -> V) -> V {
        if let Some(value) = self.get(&key) {
            return value;
        }
        self.inner
            .write()
            .entries
            .entry(key)
            .or_insert_with(make)
            .clone()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
