//! Error types for Sluice Core.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use sluice_abstraction::ModelError;
use sluice_orchestrator::{CancelReason, OrchestrationError};
use thiserror::Error;

use crate::config::ConfigError;

/// Seconds a client is told to wait after an overload rejection.
const RETRY_AFTER_SECS: &str = "5";

/// Startup and serving errors.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The inference backend could not be constructed.
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Orchestrator wiring failed.
    #[error("Orchestration error: {0}")]
    Orchestration(#[from] OrchestrationError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// An error returned to an HTTP client as `{"detail": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
    retry_after: bool,
}

impl ApiError {
    /// Error with an explicit status.
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self { status, detail: detail.into(), retry_after: false }
    }

    /// 404 for an unknown resource.
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    /// HTTP status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Message body.
    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl From<OrchestrationError> for ApiError {
    fn from(error: OrchestrationError) -> Self {
        let detail = error.to_string();
        match error {
            OrchestrationError::ServiceOverloaded { .. } => {
                Self { status: StatusCode::SERVICE_UNAVAILABLE, detail, retry_after: true }
            }
            OrchestrationError::ProcessorUnavailable => {
                Self { status: StatusCode::SERVICE_UNAVAILABLE, detail, retry_after: true }
            }
            OrchestrationError::GenerationFailed(_) | OrchestrationError::Model(_) => {
                Self::new(StatusCode::BAD_GATEWAY, detail)
            }
            OrchestrationError::Cancelled { reason: CancelReason::Timeout, .. } => {
                Self::new(StatusCode::REQUEST_TIMEOUT, detail)
            }
            OrchestrationError::Cancelled { reason: CancelReason::Shutdown, .. } => {
                Self { status: StatusCode::SERVICE_UNAVAILABLE, detail, retry_after: true }
            }
            OrchestrationError::Cancelled { reason: CancelReason::Caller, .. } => {
                Self::new(StatusCode::CONFLICT, detail)
            }
            OrchestrationError::InvalidRequest(_) => Self::new(StatusCode::UNPROCESSABLE_ENTITY, detail),
            OrchestrationError::InvalidConfig(_) | OrchestrationError::CacheConfig(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(json!({ "detail": self.detail }))).into_response();
        if self.retry_after {
            response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overload_maps_to_503_with_retry_after() {
        let response = ApiError::from(OrchestrationError::ServiceOverloaded { capacity: 50 }).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "5");
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (OrchestrationError::GenerationFailed("boom".to_string()), StatusCode::BAD_GATEWAY),
            (
                OrchestrationError::Cancelled { reason: CancelReason::Timeout, partial: String::new() },
                StatusCode::REQUEST_TIMEOUT,
            ),
            (
                OrchestrationError::Cancelled { reason: CancelReason::Caller, partial: String::new() },
                StatusCode::CONFLICT,
            ),
            (OrchestrationError::InvalidRequest("empty".to_string()), StatusCode::UNPROCESSABLE_ENTITY),
            (OrchestrationError::ProcessorUnavailable, StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
    }

    #[test]
    fn test_gateway_error_from_config() {
        let error: GatewayError = ConfigError::Invalid("bad".to_string()).into();
        assert_eq!(error.to_string(), "Configuration error: Invalid configuration: bad");
    }
}
