//! HTTP error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hookline_core::CoreError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::crypto::SignatureError;

/// Errors surfaced by the HTTP layer.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Webhook signature did not verify.
    #[error("authentication failed: {0}")]
    Authentication(#[from] SignatureError),

    /// Operator request without a valid admin token.
    #[error("missing or invalid admin token")]
    Unauthorized,

    /// No record for the requested key.
    #[error("{0}")]
    NotFound(String),

    /// The record is not in a state that allows the operation.
    #[error("{0}")]
    Conflict(String),

    /// The store could not be reached; the sender should retry.
    #[error("store unavailable")]
    StoreUnavailable(String),

    /// Anything else.
    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication_failed",
            Self::Unauthorized => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "invalid_state",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Authentication(_) | Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(key) => Self::NotFound(format!("no event with key {key}")),
            err @ (CoreError::InvalidTransition { .. } | CoreError::LeaseExpired { .. }) => {
                Self::Conflict(err.to_string())
            },
            CoreError::Database(msg) => Self::StoreUnavailable(msg),
            CoreError::Corrupt(msg) => Self::Internal(msg),
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details.
    pub error: ErrorDetail,
}

/// Error code and message.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            Self::StoreUnavailable(detail) | Self::Internal(detail) => {
                error!(code = self.code(), error = %detail, "request failed");
            },
            _ => {},
        }

        let status = self.status();
        let body = ErrorResponse {
            error: ErrorDetail { code: self.code().to_string(), message: self.to_string() },
        };
        (status, Json(body)).into_response()
    }
}

/// Result alias for handlers.
pub type Result<T> = std::result::Result<T, ApiError>;
