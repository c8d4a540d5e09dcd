//! Operator endpoints: event inspection and dead-letter management.
//!
//! Mounted only when an admin token is configured, behind
//! [`require_admin`](crate::middleware::auth::require_admin).

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use hookline_core::{AttemptRecord, DeadLetterEntry, DedupKey, EventRecord, EventState};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{
    error::{ApiError, Result},
    AppState,
};

/// Default page size for dead-letter listings.
const DEFAULT_LIMIT: usize = 100;

/// Upper bound on the page size.
const MAX_LIMIT: usize = 1000;

/// Event record with its attempt history.
#[derive(Debug, Serialize)]
pub struct EventView {
    /// Event key.
    pub dedup_key: DedupKey,
    /// Lifecycle state.
    pub state: EventState,
    /// Recorded handler outcomes.
    pub attempt_count: u32,
    /// First acceptance time.
    pub received_at: DateTime<Utc>,
    /// Earliest next attempt while pending.
    pub next_attempt_at: DateTime<Utc>,
    /// Most recent failure.
    pub last_error: Option<String>,
    /// Payload as UTF-8, lossily decoded.
    pub payload: String,
    /// Attempt history.
    pub attempts: Vec<AttemptRecord>,
}

impl EventView {
    fn new(record: EventRecord, attempts: Vec<AttemptRecord>) -> Self {
        Self {
            payload: String::from_utf8_lossy(&record.payload).into_owned(),
            dedup_key: record.dedup_key,
            state: record.state,
            attempt_count: record.attempt_count,
            received_at: record.received_at,
            next_attempt_at: record.next_attempt_at,
            last_error: record.last_error,
            attempts,
        }
    }
}

/// Dead-letter entry including its payload.
#[derive(Debug, Serialize)]
pub struct DeadLetterView {
    /// The entry.
    #[serde(flatten)]
    pub entry: DeadLetterEntry,
    /// Payload as UTF-8, lossily decoded.
    pub payload: String,
}

impl From<DeadLetterEntry> for DeadLetterView {
    fn from(entry: DeadLetterEntry) -> Self {
        let payload = String::from_utf8_lossy(&entry.payload).into_owned();
        Self { entry, payload }
    }
}

/// Dead-letter listing.
#[derive(Debug, Serialize)]
pub struct DeadLetterList {
    /// Entries, oldest first.
    pub dead_letters: Vec<DeadLetterEntry>,
}

/// Query parameters for listing.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    /// Maximum number of entries to return.
    pub limit: Option<usize>,
}

/// `GET /events/{key}`
#[instrument(skip(state))]
pub async fn get_event(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<EventView>> {
    let key = DedupKey::new(key);
    let record = state
        .store
        .get(&key)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no event with key {key}")))?;
    let attempts = state.store.attempts(&key).await?;

    Ok(Json(EventView::new(record, attempts)))
}

/// `GET /dead-letters`
#[instrument(skip(state))]
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<DeadLetterList>> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let dead_letters = state.dead_letters.dead_letters(limit).await?;

    Ok(Json(DeadLetterList { dead_letters }))
}

/// `GET /dead-letters/{key}`
#[instrument(skip(state))]
pub async fn get_dead_letter(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<DeadLetterView>> {
    let key = DedupKey::new(key);
    let entry = state
        .dead_letters
        .dead_letter(&key)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no dead letter for key {key}")))?;

    Ok(Json(entry.into()))
}

/// `POST /dead-letters/{key}/replay`
///
/// Returns the record to `PENDING`, due immediately, with a fresh retry
/// budget.
#[instrument(skip(state))]
pub async fn replay_dead_letter(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<EventView>> {
    let key = DedupKey::new(key);
    let record = state.dead_letters.replay(&key, state.clock.now()).await?;
    state.queue.notify();
    info!(dedup_key = %key, "dead letter replayed");

    Ok(Json(EventView::new(record, Vec::new())))
}
