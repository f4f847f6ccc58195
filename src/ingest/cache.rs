// src/ingest/cache.rs
//! Short-lived cache of parsed feed batches, keyed by source (+ limit).
//! Expiry is checked lazily on read; nothing sweeps in the background.
//! A miss only ever costs a re-fetch.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::counter;
use tokio::time::Instant;

use crate::ingest::types::Item;

pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
struct CacheEntry {
    items: Vec<Item>,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct FreshnessCache {
    default_ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl Default for FreshnessCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl FreshnessCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// `https://feed` or `https://feed#limit=5`.
    pub fn key(source: &str, limit: Option<usize>) -> String {
        match limit {
            Some(n) => format!("{source}#limit={n}"),
            None => source.to_string(),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<Vec<Item>> {
        let mut g = self.lock();
        let fresh = match g.get(key) {
            None => None,
            Some(e) if Instant::now() >= e.expires_at => {
                g.remove(key);
                None
            }
            Some(e) => Some(e.items.clone()),
        };
        if fresh.is_some() {
            counter!("cache_hits_total").increment(1);
        } else {
            counter!("cache_misses_total").increment(1);
        }
        fresh
    }

    pub fn set(&self, key: impl Into<String>, items: Vec<Item>, ttl: Duration) {
        let entry = CacheEntry {
            items,
            expires_at: Instant::now() + ttl,
        };
        self.lock().insert(key.into(), entry);
    }

    /// `set` with the cache's default TTL.
    pub fn insert(&self, key: impl Into<String>, items: Vec<Item>) {
        self.set(key, items, self.default_ttl);
    }

    pub fn invalidate(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
