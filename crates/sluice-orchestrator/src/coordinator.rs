//! Two-tier cache coordination.
//!
//! Lookups try the exact tier first and only fall through to the semantic
//! tier on a miss. Writes go to L1 before the response is acknowledged; the
//! L2 write needs an embedding and runs in the background.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use sluice_models::{CacheConfig, CacheEntry, CacheKey, CacheTier, ExactCache, SemanticCache};
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::metrics::{MetricsCollector, Stage};

/// Result of a coordinated lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// A tier had a usable response.
    Hit {
        /// Tier that served it.
        tier: CacheTier,
        /// The stored entry.
        entry: CacheEntry,
        /// Cosine similarity, for semantic hits.
        similarity: Option<f32>,
    },
    /// Neither tier matched.
    Miss,
}

/// Fronts the exact and semantic caches with one lookup and one write path.
pub struct CacheCoordinator {
    l1: Arc<ExactCache>,
    l2: Arc<SemanticCache>,
    config: CacheConfig,
    metrics: Arc<MetricsCollector>,
    writes: TaskTracker,
}

impl fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("l1", &self.l1)
            .field("l2", &self.l2)
            .field("enabled", &self.config.enabled)
            .finish_non_exhaustive()
    }
}

impl CacheCoordinator {
    /// Creates a coordinator over both tiers.
    pub fn new(
        l1: Arc<ExactCache>,
        l2: Arc<SemanticCache>,
        config: CacheConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self { l1, l2, config, metrics, writes: TaskTracker::new() }
    }

    /// Exact tier.
    pub fn l1(&self) -> &ExactCache {
        &self.l1
    }

    /// Semantic tier.
    pub fn l2(&self) -> &SemanticCache {
        &self.l2
    }

    /// Whether caching is enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Looks `key` up in L1, then L2.
    ///
    /// An L1 hit never consults L2. An L2 hit is copied into L1 so the next
    /// identical request is served from the exact tier.
    pub async fn lookup(&self, key: &CacheKey) -> CacheLookup {
        if !self.config.enabled {
            return CacheLookup::Miss;
        }

        let started = Instant::now();
        let exact = self.l1.lookup(key);
        self.metrics.record_latency(Stage::L1Cache, started.elapsed());
        if let Some(entry) = exact {
            return CacheLookup::Hit { tier: CacheTier::L1, entry, similarity: None };
        }

        let started = Instant::now();
        let semantic = self.l2.lookup(key).await;
        self.metrics.record_latency(Stage::L2Cache, started.elapsed());
        match semantic {
            Some(hit) => {
                debug!(similarity = hit.similarity, "Promoting semantic hit into L1");
                self.l1.store(key.clone(), &hit.entry.response, self.config.l1_ttl());
                CacheLookup::Hit { tier: CacheTier::L2, entry: hit.entry, similarity: Some(hit.similarity) }
            }
            None => CacheLookup::Miss,
        }
    }

    /// Stores a freshly generated response in both tiers.
    ///
    /// The L1 write has happened when this returns; the L2 write is tracked
    /// and can be awaited with [`settle`](Self::settle).
    pub fn write_through(&self, key: CacheKey, response: &str) {
        if !self.config.enabled {
            return;
        }

        self.l1.store(key.clone(), response, self.config.l1_ttl());

        let l2 = Arc::clone(&self.l2);
        let ttl = self.config.l2_ttl();
        let response = response.to_string();
        self.writes.spawn(async move {
            l2.store(key, &response, ttl).await;
        });
    }

    /// Waits for every background L2 write started so far.
    pub async fn settle(&self) {
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
    }
}
