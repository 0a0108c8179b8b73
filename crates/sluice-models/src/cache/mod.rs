//! Response caching tiers.
//!
//! Two independent caches sit in front of the inference backend:
//! - [`ExactCache`] (L1) serves byte-identical prompts after whitespace
//!   normalization, keyed by a SHA-256 fingerprint.
//! - [`SemanticCache`] (L2) serves prompts whose embeddings are close enough
//!   to a stored prompt in the same conversation scope.
//!
//! Both tiers are bounded LRU maps with per-entry TTLs. Expired entries are
//! removed lazily when a lookup touches them.

pub mod config;
pub mod exact;
pub mod semantic;
pub mod types;

pub use config::{CacheConfig, CacheConfigError};
pub use exact::ExactCache;
pub use semantic::{SemanticCache, SemanticHit};
pub use types::{CacheEntry, CacheKey, CacheStats, CacheTier, normalize_prompt};
