//! Webhook ingestion endpoint.
//!
//! Answers as soon as the event is durably recorded:
//! - `202 Accepted` for a first sighting
//! - `200 OK` for a duplicate, so the sender stops retrying
//! - `401 Unauthorized` for a bad signature, with no store access
//! - `503 Service Unavailable` when the store is down, so the sender retries

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use hookline_core::{DedupKey, EventState};
use serde::Serialize;
use tracing::instrument;

use crate::{
    error::{ApiError, Result},
    intake::{InboundWebhook, IntakeOutcome, EVENT_ID_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER},
    AppState,
};

/// Body returned for accepted and duplicate webhooks.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    /// `accepted` or `duplicate`.
    pub status: &'static str,
    /// Key the event is recorded under.
    pub dedup_key: DedupKey,
    /// State of the existing record, for duplicates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<EventState>,
}

/// Receives a webhook.
#[instrument(name = "ingest_webhook", skip_all)]
pub async fn ingest_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let webhook = InboundWebhook {
        body,
        signature: header_value(&headers, SIGNATURE_HEADER),
        event_id: header_value(&headers, EVENT_ID_HEADER),
        timestamp: header_value(&headers, TIMESTAMP_HEADER),
    };

    match state.intake.receive(webhook).await? {
        IntakeOutcome::Accepted(dedup_key) => Ok((
            StatusCode::ACCEPTED,
            Json(IngestResponse { status: "accepted", dedup_key, state: None }),
        )
            .into_response()),
        IntakeOutcome::Duplicate { key, state } => Ok((
            StatusCode::OK,
            Json(IngestResponse { status: "duplicate", dedup_key: key, state: Some(state) }),
        )
            .into_response()),
        IntakeOutcome::Rejected(reason) => Err(ApiError::Authentication(reason)),
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(String::from)
}
