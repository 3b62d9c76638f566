//! HTTP error mapping

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Malformed request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Domain rule rejected the request; nothing changed (422)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Lost a race or not valid in the current state (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Missing or expired session (401)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Store down beyond the retry budget, or a bounded call timed out (503)
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Client cursor fell out of the retention window (410)
    #[error("Resynchronization required")]
    ResyncRequired { oldest_available: u64, head: u64 },

    /// No transport mode left for this client (503)
    #[error("All transports exhausted")]
    TransportExhausted,

    /// Request rate exceeded (429)
    #[error("Too many requests")]
    RateLimited { retry_after: Duration },

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<huddle_common::Error> for ApiError {
    fn from(err: huddle_common::Error) -> Self {
        use huddle_common::Error;
        match err {
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            Error::Validation(msg) => ApiError::Validation(msg),
            Error::Conflict(msg) => ApiError::Conflict(msg),
            Error::StoreUnavailable(msg) | Error::Timeout(msg) => ApiError::Unavailable(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Whole seconds for `Retry-After`, never zero
fn retry_after_secs(wait: Duration) -> u64 {
    wait.as_secs() + u64::from(wait.subsec_nanos() > 0)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut extra = Map::new();
        let mut retry_after = None;

        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Validation(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_FAILED", msg)
            }
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg),
            ApiError::Unavailable(msg) => {
                retry_after = Some(1);
                extra.insert("retryable".into(), Value::Bool(true));
                (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE", msg)
            }
            ApiError::ResyncRequired {
                oldest_available,
                head,
            } => {
                extra.insert("resync".into(), Value::Bool(true));
                extra.insert("oldestAvailable".into(), json!(oldest_available));
                extra.insert("lastEventId".into(), json!(head));
                (
                    StatusCode::GONE,
                    "RESYNC_REQUIRED",
                    "Events since your cursor were evicted; refetch state".to_string(),
                )
            }
            ApiError::TransportExhausted => {
                extra.insert("manualRefresh".into(), Value::Bool(true));
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "TRANSPORT_EXHAUSTED",
                    "No live update transport is available; refresh manually".to_string(),
                )
            }
            ApiError::RateLimited { retry_after: wait } => {
                retry_after = Some(retry_after_secs(wait));
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    "RATE_LIMITED",
                    "Too many requests".to_string(),
                )
            }
            ApiError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg)
            }
        };

        let mut error_body = Map::new();
        error_body.insert("code".into(), json!(error_code));
        error_body.insert("message".into(), json!(message));
        error_body.extend(extra);
        let body = Json(json!({ "error": error_body }));

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
