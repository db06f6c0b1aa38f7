//! In-process TTL cache for fundamentals lookups
//!
//! Keyed by (ticker, session id) so a re-login naturally invalidates the
//! previous session's view. Fetch errors are never cached.

use neodip_core::models::Fundamentals;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct CacheEntry {
    value: Fundamentals,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

/// Thread-safe fundamentals cache with TTL and max-entry bounds
pub struct FundamentalsCache {
    entries: RwLock<HashMap<(String, String), CacheEntry>>,
    default_ttl: Duration,
    max_entries: usize,
}

impl FundamentalsCache {
    pub fn with_capacity(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
            max_entries,
        }
    }

    pub fn new(default_ttl: Duration) -> Self {
        Self::with_capacity(default_ttl, 500)
    }

    /// Get a cached value if present and not expired
    pub fn get(&self, ticker: &str, session_id: &str) -> Option<Fundamentals> {
        let cache = self.entries.read().ok()?;
        let entry = cache.get(&(ticker.to_string(), session_id.to_string()))?;
        if entry.is_expired() {
            None
        } else {
            Some(entry.value)
        }
    }

    /// Insert or refresh an entry. Evicts expired entries at capacity, then
    /// the oldest if still full.
    pub fn insert(&self, ticker: &str, session_id: &str, value: Fundamentals) {
        if let Ok(mut cache) = self.entries.write() {
            if cache.len() >= self.max_entries {
                cache.retain(|_, entry| !entry.is_expired());
            }
            if cache.len() >= self.max_entries {
                if let Some(oldest_key) = cache
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone())
                {
                    cache.remove(&oldest_key);
                }
            }
            cache.insert(
                (ticker.to_string(), session_id.to_string()),
                CacheEntry {
                    value,
                    inserted_at: Instant::now(),
                    ttl: self.default_ttl,
                },
            );
        }
    }

    /// Drop everything for a session (used when a token is replaced mid-day)
    pub fn invalidate_session(&self, session_id: &str) {
        if let Ok(mut cache) = self.entries.write() {
            cache.retain(|(_, sid), _| sid != session_id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FundamentalsCache {
    fn default() -> Self {
        // one trading day
        Self::with_capacity(Duration::from_secs(24 * 60 * 60), 500)
    }
}
