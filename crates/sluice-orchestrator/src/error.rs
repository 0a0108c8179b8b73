// Error types for request orchestration

use sluice_abstraction::ModelError;
use sluice_models::CacheConfigError;
use thiserror::Error;

use crate::stream::CancelReason;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// The admission queue is full; the caller should retry with backoff.
    #[error("Service overloaded: admission queue is full ({capacity} requests pending)")]
    ServiceOverloaded {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The backend failed while generating.
    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    /// Generation was cancelled before it completed.
    #[error("Generation cancelled ({reason})")]
    Cancelled {
        /// Who or what cancelled it.
        reason: CancelReason,
        /// Text produced before the cancellation.
        partial: String,
    },

    /// The queue processor is not running.
    #[error("Queue processor is not running")]
    ProcessorUnavailable,

    /// The request itself is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A component was configured with invalid values.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Cache configuration error
    #[error("Cache configuration error: {0}")]
    CacheConfig(#[from] CacheConfigError),

    /// Model error
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
}

impl OrchestrationError {
    /// Whether the caller should retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServiceOverloaded { .. } | Self::ProcessorUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrchestrationError::ServiceOverloaded { capacity: 50 };
        assert_eq!(
            err.to_string(),
            "Service overloaded: admission queue is full (50 requests pending)"
        );

        let err = OrchestrationError::Cancelled { reason: CancelReason::Timeout, partial: String::new() };
        assert_eq!(err.to_string(), "Generation cancelled (timeout)");
    }

    #[test]
    fn test_retryable() {
        assert!(OrchestrationError::ServiceOverloaded { capacity: 1 }.is_retryable());
        assert!(!OrchestrationError::GenerationFailed("boom".to_string()).is_retryable());
    }

    #[test]
    fn test_from_model_error() {
        let err: OrchestrationError = ModelError::Other("x".to_string()).into();
        assert!(matches!(err, OrchestrationError::Model(_)));
    }
}
