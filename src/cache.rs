// src/cache.rs
//! Bounded response cache for the stale-while-revalidate read path.
//!
//! The cache itself only stores and classifies: `get` never fetches and `put`
//! never blocks on the network. The serve-stale-and-refresh orchestration
//! lives in the engine.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::Value;

/// A successful response payload with its absolute expiry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Value,
    expires_at: Instant,
}

impl CacheEntry {
    /// With `ttl == 0` the expiry equals the write time, so the entry is
    /// already stale on the very next read. Stale entries are still served;
    /// staleness only decides whether a background refresh is due.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

pub struct ResponseCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Lookup only; returns the entry whether fresh or stale and touches its
    /// LRU recency. Never triggers a fetch.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut entries = self.entries.lock().expect("poisoned cache lock");
        entries.get(key).cloned()
    }

    /// Whole-value replacement stamped `now + ttl`; last writer wins under
    /// concurrent refreshes of the same key. At capacity the least-recently
    /// used entry is evicted silently.
    pub fn put(&self, key: &str, value: Value) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        let mut entries = self.entries.lock().expect("poisoned cache lock");
        entries.put(key.to_string(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("poisoned cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
