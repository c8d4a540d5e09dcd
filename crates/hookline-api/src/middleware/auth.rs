//! Bearer token authentication for operator routes.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::ApiError;

/// Extracts the token from `Authorization: Bearer <token>`.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Compares without short-circuiting on the first differing byte.
fn tokens_match(provided: &str, expected: &str) -> bool {
    bool::from(provided.as_bytes().ct_eq(expected.as_bytes()))
}

/// Rejects requests that do not carry the admin token.
pub async fn require_admin(
    State(admin_token): State<Arc<str>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let authorized = match extract_bearer_token(req.headers()) {
        Some(token) => tokens_match(token, &admin_token),
        None => return Err(ApiError::Unauthorized),
    };

    if !authorized {
        warn!(path = %req.uri().path(), "operator request with wrong token");
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(req).await)
}
