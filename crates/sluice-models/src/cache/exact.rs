//! L1 exact-match response cache.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use super::types::{CacheEntry, CacheKey, CacheStats};

/// Exact-match cache keyed by the SHA-256 fingerprint of a [`CacheKey`].
///
/// Lookups and stores are O(1). Safe to share across tasks; the last of two
/// concurrent stores for the same key wins.
pub struct ExactCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    stats: TierCounters,
}

#[derive(Default)]
pub(crate) struct TierCounters {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) stores: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) expirations: AtomicU64,
}

impl TierCounters {
    pub(crate) fn snapshot(&self, entries: usize) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entries,
        }
    }
}

impl ExactCache {
    /// Creates a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { entries: Mutex::new(LruCache::new(capacity)), stats: TierCounters::default() }
    }

    /// Returns the live entry for `key`, if any.
    ///
    /// An expired entry is removed and reported as a miss.
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        let fingerprint = key.fingerprint();
        let now = Utc::now();
        let mut entries = self.entries.lock();

        match entries.get_mut(&fingerprint) {
            Some(entry) if !entry.is_expired_at(now) => {
                entry.hit_count += 1;
                let hit = entry.clone();
                drop(entries);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %fingerprint, hit_count = hit.hit_count, "L1 cache hit");
                return Some(hit);
            }
            Some(_) => {
                entries.pop(&fingerprint);
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                debug!(fingerprint = %fingerprint, "L1 entry expired");
            }
            None => {}
        }
        drop(entries);

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Stores `response` under `key` for `ttl`, replacing any previous entry.
    ///
    /// A zero TTL stores nothing. Returns the stored entry.
    pub fn store(&self, key: CacheKey, response: &str, ttl: Duration) -> Option<CacheEntry> {
        let entry = CacheEntry::new(key, response, ttl)?;
        let fingerprint = entry.key.fingerprint();

        let displaced = self.entries.lock().push(fingerprint.clone(), entry.clone());
        if let Some((old_key, _)) = displaced {
            if old_key != fingerprint {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(evicted = %old_key, "L1 capacity reached, evicted least recently used entry");
            }
        }

        self.stats.stores.fetch_add(1, Ordering::Relaxed);
        debug!(fingerprint = %fingerprint, ttl_secs = ttl.as_secs(), "Stored L1 entry");
        Some(entry)
    }

    /// Removes the entry for `key`, returning it.
    pub fn invalidate(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.lock().pop(&key.fingerprint())
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Current number of entries, expired ones included until touched.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot(self.len())
    }
}

impl std::fmt::Debug for ExactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExactCache")
            .field("entries", &self.len())
            .field("capacity", &self.entries.lock().cap())
            .finish_non_exhaustive()
    }
}
