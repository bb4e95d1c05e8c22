//! Short-TTL response cache keyed by call signature.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Key prefix for anything derived from the dataset listing.
pub const DATASETS_PREFIX: &str = "datasets:";

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    created_at: Instant,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
}

pub struct ResponseCache {
    entries: Mutex<HashMap<String, Entry>>,
    default_ttl: Duration,
    max_entries: usize,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

impl ResponseCache {
    pub fn new(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
            max_entries: max_entries.max(2),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        None
    }

    /// Store a value. `None` uses the default TTL.
    pub fn insert(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let now = Instant::now();
        let entry = Entry {
            value,
            created_at: now,
            expires_at: now + ttl.unwrap_or(self.default_ttl),
        };
        self.entries.lock().insert(key.to_string(), entry);
    }

    /// Return the cached value or compute, store and return a fresh one.
    ///
    /// The lock is not held while `compute` runs; two concurrent misses may
    /// both compute, and the later insert wins.
    pub fn get_or_insert_with<F>(&self, key: &str, ttl: Option<Duration>, compute: F) -> Value
    where
        F: FnOnce() -> Value,
    {
        if let Some(hit) = self.get(key) {
            tracing::trace!(key, "Cache hit");
            return hit;
        }
        let value = compute();
        self.insert(key, value.clone(), ttl);
        value
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(prefix, removed, "Invalidated cache entries");
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drop expired entries, then if still over capacity keep only the
    /// newest `max_entries / 2`. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));

        if entries.len() > self.max_entries {
            let keep = self.max_entries / 2;
            let mut by_age: Vec<(String, Instant)> =
                entries.iter().map(|(k, e)| (k.clone(), e.created_at)).collect();
            by_age.sort_by(|a, b| b.1.cmp(&a.1));
            for (key, _) in by_age.into_iter().skip(keep) {
                entries.remove(&key);
            }
        }

        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = entries.len(), "Cache cleanup");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.entries.lock();
        let expired = entries.values().filter(|e| e.is_expired(now)).count();
        CacheStats {
            total_entries: entries.len(),
            valid_entries: entries.len() - expired,
            expired_entries: expired,
        }
    }
}
