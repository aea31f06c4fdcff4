//! Explicit memoisation for dashboard views.
//!
//! Entries are keyed by `(view name, parameters)` and remember the dataset
//! version they were computed from. A lookup hits only while the entry is
//! younger than the TTL and the version still matches.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub view: String,
    pub params: String,
}

impl CacheKey {
    pub fn new(view: &str, params: &str) -> Self {
        Self {
            view: view.to_string(),
            params: params.to_string(),
        }
    }
}

struct Entry<V> {
    value: V,
    version: String,
    inserted: Instant,
}

pub struct ViewCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, Entry<V>>>,
}

impl<V: Clone> ViewCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &CacheKey, version: &str) -> Option<V> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(key)?;
        if entry.version == version && entry.inserted.elapsed() < self.ttl {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    pub fn insert(&self, key: CacheKey, version: &str, value: V) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                key,
                Entry {
                    value,
                    version: version.to_string(),
                    inserted: Instant::now(),
                },
            );
        }
    }

    /// Cached value for `key`, or compute and store a fresh one.
    pub fn get_or_compute(&self, key: CacheKey, version: &str, compute: impl FnOnce() -> V) -> V {
        if let Some(hit) = self.get(&key, version) {
            return hit;
        }
        let value = compute();
        self.insert(key, version, value.clone());
        value
    }

    pub fn invalidate_all(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
