//! L2 semantic response cache.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use sluice_abstraction::Embedder;
use tracing::{debug, warn};

use super::exact::TierCounters;
use super::types::{CacheEntry, CacheKey, CacheStats};
use crate::embeddings::cosine_similarity;

/// A semantic cache hit and how close it was.
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticHit {
    /// The matched entry.
    pub entry: CacheEntry,
    /// Cosine similarity between the query and the stored prompt.
    pub similarity: f32,
}

/// Nearest-neighbour cache over prompt embeddings.
///
/// Lookups embed the query outside the lock, then scan entries sharing the
/// query's conversation scope. Only a match at or above the threshold is
/// returned; ties go to the most recently stored entry.
pub struct SemanticCache {
    embedder: Arc<dyn Embedder + Send + Sync>,
    threshold: f32,
    entries: Mutex<LruCache<u64, CacheEntry>>,
    next_id: AtomicU64,
    stats: TierCounters,
}

impl SemanticCache {
    /// Creates a cache holding at most `capacity` entries (minimum 1).
    pub fn new(embedder: Arc<dyn Embedder + Send + Sync>, threshold: f32, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            embedder,
            threshold,
            entries: Mutex::new(LruCache::new(capacity)),
            next_id: AtomicU64::new(0),
            stats: TierCounters::default(),
        }
    }

    /// Minimum similarity for a hit.
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Finds the closest stored prompt in the same scope as `key`.
    ///
    /// An unavailable embedder is a miss, never an error.
    pub async fn lookup(&self, key: &CacheKey) -> Option<SemanticHit> {
        let query = match self.embedder.embed(&key.normalized_prompt).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!(error = %e, "Embedding unavailable, skipping L2 lookup");
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let now = Utc::now();
        let mut entries = self.entries.lock();
        let mut expired = Vec::new();
        let mut best: Option<(u64, f32, DateTime<Utc>)> = None;

        for (id, entry) in entries.iter() {
            if entry.is_expired_at(now) {
                expired.push(*id);
                continue;
            }
            if entry.key.context_hash != key.context_hash {
                continue;
            }
            let Some(stored) = entry.embedding.as_deref() else {
                continue;
            };

            // NaN never clears the threshold.
            let score = cosine_similarity(&query, stored);
            if score.is_nan() || score < self.threshold {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_id, best_score, best_created)) => {
                    if (score - best_score).abs() <= f32::EPSILON {
                        (entry.created_at, *id) > (best_created, best_id)
                    } else {
                        score > best_score
                    }
                }
            };
            if better {
                best = Some((*id, score, entry.created_at));
            }
        }

        for id in &expired {
            entries.pop(id);
        }

        let hit = best.and_then(|(id, similarity, _)| {
            entries.get_mut(&id).map(|entry| {
                entry.hit_count += 1;
                SemanticHit { entry: entry.clone(), similarity }
            })
        });
        drop(entries);

        if !expired.is_empty() {
            self.stats.expirations.fetch_add(expired.len() as u64, Ordering::Relaxed);
        }
        match &hit {
            Some(hit) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!(similarity = hit.similarity, "L2 cache hit");
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
        hit
    }

    /// Embeds and stores `response` under `key` for `ttl`.
    ///
    /// Replaces any entry with an identical key. Silently stores nothing when
    /// the embedder is unavailable or the TTL is zero.
    pub async fn store(&self, key: CacheKey, response: &str, ttl: Duration) -> Option<CacheEntry> {
        let entry = CacheEntry::new(key, response, ttl)?;
        let embedding = match self.embedder.embed(&entry.key.normalized_prompt).await {
            Ok(vector) => vector,
            Err(e) => {
                debug!(error = %e, "Embedding unavailable, skipping L2 store");
                return None;
            }
        };
        let entry = entry.with_embedding(embedding);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut entries = self.entries.lock();
        let duplicates: Vec<u64> =
            entries.iter().filter(|(_, e)| e.key == entry.key).map(|(id, _)| *id).collect();
        for old in &duplicates {
            entries.pop(old);
        }
        let displaced = entries.push(id, entry.clone());
        drop(entries);

        if displaced.is_some() {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("L2 capacity reached, evicted least recently used entry");
        }
        self.stats.stores.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Current number of entries, expired ones included until scanned.
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

impl std::fmt::Debug for SemanticCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticCache")
            .field("threshold", &self.threshold)
            .field("entries", &self.len())
            .field("dimensions", &self.embedder.dimensions())
            .finish_non_exhaustive()
    }
}
