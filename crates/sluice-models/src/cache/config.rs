//! Configuration for the response caches.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration for the L1 and L2 response caches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Whether response caching is enabled at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Seconds an exact-match entry stays valid (default: 86400 = 1 day).
    #[serde(default = "default_l1_ttl_secs")]
    pub l1_ttl_secs: u64,

    /// Seconds a semantic entry stays valid (default: 604800 = 1 week).
    #[serde(default = "default_l2_ttl_secs")]
    pub l2_ttl_secs: u64,

    /// Minimum cosine similarity for a semantic hit (default: 0.95).
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Maximum number of exact-match entries before LRU displacement.
    #[serde(default = "default_l1_max_entries")]
    pub l1_max_entries: usize,

    /// Maximum number of semantic entries before LRU displacement.
    #[serde(default = "default_l2_max_entries")]
    pub l2_max_entries: usize,

    /// Whether the conversation history is part of the cache scope.
    ///
    /// Off by default: repeating a prompt within a session is then an exact hit.
    #[serde(default)]
    pub key_includes_history: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_l1_ttl_secs() -> u64 {
    86_400 // 1 day
}

fn default_l2_ttl_secs() -> u64 {
    604_800 // 1 week
}

fn default_similarity_threshold() -> f32 {
    0.95
}

fn default_l1_max_entries() -> usize {
    10_000
}

fn default_l2_max_entries() -> usize {
    2_000
}

/// Errors that can occur during cache configuration validation.
#[derive(Debug, Error, PartialEq)]
pub enum CacheConfigError {
    /// Invalid TTL (must be > 0).
    #[error("Invalid {tier} TTL: must be greater than 0")]
    InvalidTtl {
        /// "l1" or "l2".
        tier: &'static str,
    },

    /// Invalid capacity (must be > 0).
    #[error("Invalid {tier} capacity: must be greater than 0")]
    InvalidCapacity {
        /// "l1" or "l2".
        tier: &'static str,
    },

    /// Similarity threshold outside (0, 1].
    #[error("Invalid similarity threshold {0}: must be in (0, 1]")]
    InvalidSimilarityThreshold(f32),
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            l1_ttl_secs: default_l1_ttl_secs(),
            l2_ttl_secs: default_l2_ttl_secs(),
            similarity_threshold: default_similarity_threshold(),
            l1_max_entries: default_l1_max_entries(),
            l2_max_entries: default_l2_max_entries(),
            key_includes_history: false,
        }
    }
}

impl CacheConfig {
    /// Validate the cache configuration.
    ///
    /// # Errors
    /// Returns `CacheConfigError` if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), CacheConfigError> {
        if self.l1_ttl_secs == 0 {
            return Err(CacheConfigError::InvalidTtl { tier: "l1" });
        }
        if self.l2_ttl_secs == 0 {
            return Err(CacheConfigError::InvalidTtl { tier: "l2" });
        }
        if self.l1_max_entries == 0 {
            return Err(CacheConfigError::InvalidCapacity { tier: "l1" });
        }
        if self.l2_max_entries == 0 {
            return Err(CacheConfigError::InvalidCapacity { tier: "l2" });
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(CacheConfigError::InvalidSimilarityThreshold(self.similarity_threshold));
        }
        Ok(())
    }

    /// Get the L1 TTL as a Duration.
    #[must_use]
    pub fn l1_ttl(&self) -> Duration {
        Duration::from_secs(self.l1_ttl_secs)
    }

    /// Get the L2 TTL as a Duration.
    #[must_use]
    pub fn l2_ttl(&self) -> Duration {
        Duration::from_secs(self.l2_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_default() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.l1_ttl_secs, 86_400);
        assert_eq!(config.l2_ttl_secs, 604_800);
        assert!((config.similarity_threshold - 0.95).abs() < f32::EPSILON);
        assert!(!config.key_includes_history);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cache_config_validation_invalid_ttl() {
        let config = CacheConfig { l2_ttl_secs: 0, ..CacheConfig::default() };
        assert_eq!(config.validate(), Err(CacheConfigError::InvalidTtl { tier: "l2" }));
    }

    #[test]
    fn test_cache_config_validation_invalid_capacity() {
        let config = CacheConfig { l1_max_entries: 0, ..CacheConfig::default() };
        assert_eq!(config.validate(), Err(CacheConfigError::InvalidCapacity { tier: "l1" }));
    }

    #[test]
    fn test_cache_config_validation_invalid_threshold() {
        for threshold in [0.0, -0.5, 1.5, f32::NAN] {
            let config = CacheConfig { similarity_threshold: threshold, ..CacheConfig::default() };
            assert!(matches!(
                config.validate(),
                Err(CacheConfigError::InvalidSimilarityThreshold(_))
            ));
        }
    }

    #[test]
    fn test_cache_config_durations() {
        let config = CacheConfig::default();
        assert_eq!(config.l1_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.l2_ttl(), Duration::from_secs(604_800));
    }

    #[test]
    fn test_cache_config_from_toml_like_json() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"l1_ttl_secs": 60, "similarity_threshold": 0.9}"#).unwrap();
        assert_eq!(config.l1_ttl_secs, 60);
        assert_eq!(config.l2_ttl_secs, 604_800);
        assert!((config.similarity_threshold - 0.9).abs() < f32::EPSILON);
    }
}
