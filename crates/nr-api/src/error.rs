//! API error envelope.
//!
//! Internal failures are logged with full context and surfaced as a
//! generic 500 carrying nothing beyond the trace id already present in the
//! response headers; validation errors carry a field path.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;
use utoipa::ToSchema;

use nr_queue::QueueError;
use nr_store::StoreError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("validation error at {field}: {message}")]
    Validation { field: String, message: String },

    #[error("missing or invalid API key")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("rate limited, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: i64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => ApiError::NotFound,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

/// Error response body.
#[derive(Debug, serde::Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(rename = "retryAfterSeconds", skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<i64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, retry_after) = match &self {
            ApiError::Validation { .. } => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", None),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", None),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", None),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", None),
            ApiError::RateLimited {
                retry_after_seconds,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                Some(*retry_after_seconds),
            ),
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", None)
            }
        };

        let message = match &self {
            // Never leak internals to the caller.
            ApiError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message,
            retry_after_seconds: retry_after,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(seconds) = retry_after {
            if let Ok(value) = seconds.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
