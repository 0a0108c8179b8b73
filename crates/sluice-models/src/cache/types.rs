//! Core data types for response caching.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Collapses runs of whitespace to a single space and trims both ends.
///
/// Case is preserved: "Rust" and "rust" are different prompts.
pub fn normalize_prompt(prompt: &str) -> String {
    prompt.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cache key for identifying stored responses.
///
/// A response is only reusable for the same normalized prompt asked in the
/// same conversation scope, so the key pairs the prompt with a hash of that
/// scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// The whitespace-normalized prompt.
    pub normalized_prompt: String,
    /// SHA-256 hash of the conversation scope.
    pub context_hash: String,
}

impl CacheKey {
    /// Create a new cache key.
    ///
    /// # Arguments
    /// * `prompt` - The raw prompt (normalized here)
    /// * `context_hash` - Hash of the conversation scope, see [`CacheKey::hash_context`]
    pub fn new(prompt: &str, context_hash: impl Into<String>) -> Self {
        Self { normalized_prompt: normalize_prompt(prompt), context_hash: context_hash.into() }
    }

    /// Hashes the parts that define a conversation scope.
    ///
    /// Parts are length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
    pub fn hash_context<I, S>(parts: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hasher = Sha256::new();
        for part in parts {
            let part = part.as_ref();
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// SHA-256 fingerprint of the whole key, used as the exact-match map key.
    pub fn fingerprint(&self) -> String {
        Self::hash_context([self.context_hash.as_str(), self.normalized_prompt.as_str()])
    }
}

/// Which tier served a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// Exact-match tier.
    L1,
    /// Semantic tier.
    L2,
}

impl CacheTier {
    /// Lowercase wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::L1 => "l1",
            Self::L2 => "l2",
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored response with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Key the response was stored under.
    pub key: CacheKey,
    /// The generated response text.
    pub response: String,
    /// Prompt embedding (semantic tier only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
    /// When the entry stops being served. Always later than `created_at`.
    pub expires_at: DateTime<Utc>,
    /// Number of lookups this entry has served.
    pub hit_count: u64,
}

impl CacheEntry {
    /// Creates an entry valid for `ttl` from now.
    ///
    /// Returns `None` for a zero TTL, which could never satisfy `expires_at > created_at`.
    pub fn new(key: CacheKey, response: impl Into<String>, ttl: Duration) -> Option<Self> {
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        if ttl <= chrono::Duration::zero() {
            return None;
        }
        let expires_at = created_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        Some(Self { key, response: response.into(), embedding: None, created_at, expires_at, hit_count: 0 })
    }

    /// Attaches the prompt embedding.
    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Whether the entry is expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Cache statistics for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups that returned an entry.
    pub hits: u64,
    /// Lookups that returned nothing.
    pub misses: u64,
    /// Successful stores.
    pub stores: u64,
    /// Entries displaced by capacity.
    pub evictions: u64,
    /// Entries dropped because their TTL ran out.
    pub expirations: u64,
    /// Current number of entries.
    pub entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_prompt_collapses_whitespace() {
        assert_eq!(normalize_prompt("  What   is\n\tRust?  "), "What is Rust?");
    }

    #[test]
    fn test_normalize_prompt_preserves_case() {
        assert_ne!(normalize_prompt("Rust"), normalize_prompt("rust"));
    }

    #[test]
    fn test_cache_key_equality_after_normalization() {
        let a = CacheKey::new("What is  Rust?", "ctx");
        let b = CacheKey::new(" What is Rust? ", "ctx");
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_cache_key_differs_by_context() {
        let a = CacheKey::new("What is Rust?", "ctx-a");
        let b = CacheKey::new("What is Rust?", "ctx-b");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_hash_context_is_length_prefixed() {
        assert_ne!(CacheKey::hash_context(["ab", "c"]), CacheKey::hash_context(["a", "bc"]));
        assert_eq!(CacheKey::hash_context(["x"]), CacheKey::hash_context(vec!["x".to_string()]));
    }

    #[test]
    fn test_entry_expiry_invariant() {
        let entry = CacheEntry::new(CacheKey::new("p", "c"), "r", Duration::from_secs(60)).unwrap();
        assert!(entry.expires_at > entry.created_at);
        assert!(!entry.is_expired_at(entry.created_at));
        assert!(entry.is_expired_at(entry.expires_at));
    }

    #[test]
    fn test_entry_zero_ttl_rejected() {
        assert!(CacheEntry::new(CacheKey::new("p", "c"), "r", Duration::ZERO).is_none());
    }

    #[test]
    fn test_entry_huge_ttl_saturates() {
        let entry = CacheEntry::new(CacheKey::new("p", "c"), "r", Duration::MAX).unwrap();
        assert!(entry.expires_at > entry.created_at);
    }

    #[test]
    fn test_cache_tier_serialization() {
        assert_eq!(serde_json::to_string(&CacheTier::L1).unwrap(), "\"l1\"");
        assert_eq!(CacheTier::L2.to_string(), "l2");
    }
}
