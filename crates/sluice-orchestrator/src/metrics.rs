//! Request metrics.
//!
//! Counters are lock-free atomics. Per-stage latencies keep a rolling window
//! of the last 1000 samples behind a short-lived lock; nothing here ever
//! waits on I/O.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use sluice_models::CacheTier;

/// Samples kept per stage.
const STAGE_WINDOW: usize = 1000;

/// Upper bounds (inclusive, milliseconds) of the latency histogram buckets.
const LATENCY_BUCKETS_MS: [u64; 10] = [50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000, 60_000];

/// A timed step of the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Exact-match lookup.
    L1Cache,
    /// Semantic lookup, embedding included.
    L2Cache,
    /// Dispatch to last token.
    Model,
    /// Request entry to completion.
    Total,
}

impl Stage {
    /// Snapshot key.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::L1Cache => "l1_cache",
            Self::L2Cache => "l2_cache",
            Self::Model => "model",
            Self::Total => "total",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One histogram bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistogramBucket {
    /// Inclusive upper bound in milliseconds; `None` is the overflow bucket.
    pub le_ms: Option<u64>,
    /// Requests that fell in this bucket.
    pub count: u64,
}

/// Point-in-time view of all metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Requests accepted for handling.
    pub total_requests: u64,
    /// Exact-match hits.
    pub cache_hits_l1: u64,
    /// Semantic hits.
    pub cache_hits_l2: u64,
    /// Lookups that found nothing.
    pub cache_misses: u64,
    /// Hits over all lookups.
    pub cache_hit_rate: f64,
    /// Tokens returned to callers.
    pub tokens_generated: u64,
    /// Tokens sent to the backend (or prompt tokens on hits).
    pub tokens_prompt: u64,
    /// Generation failures.
    pub error_count: u64,
    /// Requests turned away at admission.
    pub rejected_requests: u64,
    /// Requests cancelled by callers, timeouts or shutdown.
    pub cancelled_requests: u64,
    /// Requests answered, from cache or backend.
    pub completed_requests: u64,
    /// Rolling average of the total stage.
    pub avg_latency_ms: f64,
    /// Rolling average per stage.
    pub latencies_by_stage: BTreeMap<String, f64>,
    /// End-to-end latency distribution of completed requests.
    pub latency_histogram: Vec<HistogramBucket>,
    /// Requests waiting for the backend.
    pub queue_length: usize,
    /// Seconds since the collector was created or reset.
    pub uptime_seconds: f64,
    /// `total_requests / uptime_seconds`.
    pub requests_per_second: f64,
}

#[derive(Default)]
struct Counters {
    total_requests: AtomicU64,
    cache_hits_l1: AtomicU64,
    cache_hits_l2: AtomicU64,
    cache_misses: AtomicU64,
    tokens_generated: AtomicU64,
    tokens_prompt: AtomicU64,
    error_count: AtomicU64,
    rejected: AtomicU64,
    cancelled: AtomicU64,
    completed: AtomicU64,
    histogram: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
}

/// Thread-safe metrics aggregator shared by every component.
pub struct MetricsCollector {
    counters: Counters,
    stages: Mutex<HashMap<Stage, VecDeque<f64>>>,
    started_at: Mutex<Instant>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("total_requests", &self.counters.total_requests.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MetricsCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self {
            counters: Counters::default(),
            stages: Mutex::new(HashMap::new()),
            started_at: Mutex::new(Instant::now()),
        }
    }

    /// Counts an incoming request.
    pub fn record_request(&self) {
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a cache hit.
    pub fn record_cache_hit(&self, tier: CacheTier) {
        let counter = match tier {
            CacheTier::L1 => &self.counters.cache_hits_l1,
            CacheTier::L2 => &self.counters.cache_hits_l2,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a cache miss.
    pub fn record_cache_miss(&self) {
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a request rejected at admission.
    pub fn record_rejected(&self) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a cancelled request.
    pub fn record_cancelled(&self) {
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a generation failure.
    pub fn record_error(&self) {
        self.counters.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completed request and its end-to-end latency.
    pub fn record_completion(&self, tokens_generated: u32, tokens_prompt: u32, latency: Duration) {
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        self.counters.tokens_generated.fetch_add(u64::from(tokens_generated), Ordering::Relaxed);
        self.counters.tokens_prompt.fetch_add(u64::from(tokens_prompt), Ordering::Relaxed);

        let latency_ms = latency.as_millis() as u64;
        let bucket = LATENCY_BUCKETS_MS
            .iter()
            .position(|bound| latency_ms <= *bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.counters.histogram[bucket].fetch_add(1, Ordering::Relaxed);
        self.record_latency(Stage::Total, latency);
    }

    /// Adds a latency sample for `stage`.
    pub fn record_latency(&self, stage: Stage, latency: Duration) {
        let mut stages = self.stages.lock();
        let samples = stages.entry(stage).or_default();
        if samples.len() == STAGE_WINDOW {
            samples.pop_front();
        }
        samples.push_back(latency.as_secs_f64() * 1000.0);
    }

    /// Builds a snapshot; `queue_length` comes from the admission queue.
    pub fn snapshot(&self, queue_length: usize) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let c = &self.counters;

        let hits = load(&c.cache_hits_l1) + load(&c.cache_hits_l2);
        let lookups = hits + load(&c.cache_misses);
        let cache_hit_rate = if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 };

        let latencies_by_stage: BTreeMap<String, f64> = self
            .stages
            .lock()
            .iter()
            .map(|(stage, samples)| {
                let avg = if samples.is_empty() {
                    0.0
                } else {
                    samples.iter().sum::<f64>() / samples.len() as f64
                };
                (stage.as_str().to_string(), avg)
            })
            .collect();
        let avg_latency_ms = latencies_by_stage.get(Stage::Total.as_str()).copied().unwrap_or(0.0);

        let latency_histogram = c
            .histogram
            .iter()
            .enumerate()
            .map(|(i, count)| HistogramBucket { le_ms: LATENCY_BUCKETS_MS.get(i).copied(), count: load(count) })
            .collect();

        let total_requests = load(&c.total_requests);
        let uptime_seconds = self.started_at.lock().elapsed().as_secs_f64();
        let requests_per_second = if uptime_seconds > 0.0 { total_requests as f64 / uptime_seconds } else { 0.0 };

        MetricsSnapshot {
            total_requests,
            cache_hits_l1: load(&c.cache_hits_l1),
            cache_hits_l2: load(&c.cache_hits_l2),
            cache_misses: load(&c.cache_misses),
            cache_hit_rate,
            tokens_generated: load(&c.tokens_generated),
            tokens_prompt: load(&c.tokens_prompt),
            error_count: load(&c.error_count),
            rejected_requests: load(&c.rejected),
            cancelled_requests: load(&c.cancelled),
            completed_requests: load(&c.completed),
            avg_latency_ms,
            latencies_by_stage,
            latency_histogram,
            queue_length,
            uptime_seconds,
            requests_per_second,
        }
    }

    /// Zeroes every counter and sample and restarts the uptime clock.
    pub fn reset(&self) {
        let c = &self.counters;
        for counter in [
            &c.total_requests,
            &c.cache_hits_l1,
            &c.cache_hits_l2,
            &c.cache_misses,
            &c.tokens_generated,
            &c.tokens_prompt,
            &c.error_count,
            &c.rejected,
            &c.cancelled,
            &c.completed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for bucket in &c.histogram {
            bucket.store(0, Ordering::Relaxed);
        }
        self.stages.lock().clear();
        *self.started_at.lock() = Instant::now();
    }
}
