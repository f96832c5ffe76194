//! API error types and JSON error response formatting.
//!
//! ApiError maps lifecycle errors to HTTP status codes. Every error carries a
//! `{error, message}` JSON body except a busy-activation Conflict, which is
//! answered with an empty body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use eda_activation::ActivationError;

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g., "bad_request", "not_found").
    pub error: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type that maps to HTTP status codes and JSON responses.
#[derive(Debug)]
pub enum ApiError {
    /// 400 Bad Request - malformed query parameters.
    BadRequest(String),
    /// 403 Forbidden - the transition is not allowed in the current state.
    Forbidden(String),
    /// 404 Not Found - resource does not exist.
    NotFound(String),
    /// 409 Conflict - a transition is already in flight. Empty body.
    Conflict,
    /// 422 Unprocessable Entity - missing reference or integrity violation.
    UnprocessableEntity(String),
    /// 500 Internal Server Error - unexpected server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::Conflict => return StatusCode::CONFLICT.into_response(),
            ApiError::UnprocessableEntity(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "unprocessable_entity", msg)
            }
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
            }
        };

        let body = ErrorBody {
            error: error_code.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}

impl From<ActivationError> for ApiError {
    fn from(err: ActivationError) -> Self {
        match err {
            ActivationError::Unprocessable(msg) => ApiError::UnprocessableEntity(msg),
            ActivationError::NotFound(msg) => ApiError::NotFound(msg),
            ActivationError::Conflict => ApiError::Conflict,
            ActivationError::Forbidden(msg) => ApiError::Forbidden(msg),
            other => {
                error!(error = %other, "Activation request failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}
