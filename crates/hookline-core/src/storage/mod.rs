//! Idempotency store and dead-letter sink.
//!
//! The store is the single mutable resource shared by intake and the worker
//! pool. All coordination (dedup, leasing, state transitions) funnels through
//! the atomic operations of [`EventStore`]; callers depend on the contract,
//! not on the backend.
//!
//! Two backends are provided: [`MemoryStore`] for single-process use and
//! tests, and [`SqliteStore`] which is durable and safe to share between
//! processes through SQLite transactions.
//!
//! Every lease-holder transition checks the lease token. A transition against
//! a terminal record fails with `InvalidTransition`; one presenting a token
//! the record no longer carries fails with `LeaseExpired`. In both cases the
//! record is left untouched.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::{
    error::{CoreError, Result},
    models::{
        AttemptRecord, DeadLetterEntry, DeadReason, DedupKey, EventRecord, EventState,
        InsertOutcome, Lease,
    },
};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Durable ledger of event records keyed by dedup key.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Inserts a `Pending` record unless one already exists for `key`.
    ///
    /// Atomic across concurrent callers: exactly one observes `Created`.
    async fn check_and_insert(
        &self,
        key: &DedupKey,
        payload: Bytes,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome>;

    /// Looks up a record.
    async fn get(&self, key: &DedupKey) -> Result<Option<EventRecord>>;

    /// Leases the oldest due record, if any.
    ///
    /// Expired leases are returned to `Pending` first so a crashed worker's
    /// record is claimable again. Due records are ordered by
    /// `next_attempt_at`, then `received_at`.
    async fn claim_due(&self, now: DateTime<Utc>, lease_timeout: Duration)
        -> Result<Option<Lease>>;

    /// `InFlight -> Delivered`, recording a successful attempt.
    async fn complete(&self, lease: &Lease, now: DateTime<Utc>) -> Result<EventRecord>;

    /// `InFlight -> Failed`, recording a retryable attempt and its error.
    async fn fail(&self, lease: &Lease, error: &str, now: DateTime<Utc>) -> Result<EventRecord>;

    /// `InFlight -> Dead`, recording a permanent failure and appending a
    /// dead-letter entry.
    async fn kill(&self, lease: &Lease, error: &str, now: DateTime<Utc>) -> Result<EventRecord>;

    /// `Failed -> Pending` with a new due time.
    async fn reschedule(
        &self,
        key: &DedupKey,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<EventRecord>;

    /// `Failed -> Dead` once retries are exhausted, appending a dead-letter
    /// entry.
    async fn bury(&self, key: &DedupKey, now: DateTime<Utc>) -> Result<EventRecord>;

    /// `InFlight -> Pending` without recording an attempt. Used on shutdown.
    async fn release(&self, lease: &Lease) -> Result<EventRecord>;

    /// Returns every `InFlight` record whose lease ran out to `Pending`.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<DedupKey>>;

    /// Records left in `Failed`, e.g. by a crash between `fail` and
    /// `reschedule`.
    async fn failed_records(&self) -> Result<Vec<EventRecord>>;

    /// Earliest `next_attempt_at` among `Pending` records.
    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>>;

    /// Attempt history for the current life of a record.
    async fn attempts(&self, key: &DedupKey) -> Result<Vec<AttemptRecord>>;
}

/// Append-only record of events that reached `Dead`.
#[async_trait::async_trait]
pub trait DeadLetterSink: Send + Sync + 'static {
    /// Entries in insertion order, newest last.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>>;

    /// Most recent entry for `key`.
    async fn dead_letter(&self, key: &DedupKey) -> Result<Option<DeadLetterEntry>>;

    /// Re-injects a `Dead` record as `Pending` with `attempt_count` reset.
    ///
    /// The only externally triggered reverse transition. The dead-letter
    /// entries for the key are kept.
    async fn replay(&self, key: &DedupKey, now: DateTime<Utc>) -> Result<EventRecord>;
}

/// Checks that `record` is still held by `lease`.
///
/// Terminal records report `InvalidTransition` towards `to`; anything else
/// that does not carry the lease token reports `LeaseExpired`.
pub(crate) fn check_lease(record: &EventRecord, lease: &Lease, to: EventState) -> Result<()> {
    if record.state.is_terminal() {
        return Err(CoreError::InvalidTransition {
            key: record.dedup_key.clone(),
            from: record.state,
            to,
        });
    }
    if record.state != EventState::InFlight || record.lease_token != Some(lease.token) {
        return Err(CoreError::LeaseExpired { key: record.dedup_key.clone() });
    }
    Ok(())
}

/// Checks that `record` is in `expected` before moving it to `to`.
pub(crate) fn check_state(
    record: &EventRecord,
    expected: EventState,
    to: EventState,
) -> Result<()> {
    if record.state != expected {
        return Err(CoreError::InvalidTransition {
            key: record.dedup_key.clone(),
            from: record.state,
            to,
        });
    }
    Ok(())
}

/// Builds the dead-letter entry for a record that just died.
pub(crate) fn dead_letter_for(
    id: i64,
    record: &EventRecord,
    reason: DeadReason,
    died_at: DateTime<Utc>,
    attempts: Vec<AttemptRecord>,
) -> DeadLetterEntry {
    DeadLetterEntry {
        id,
        dedup_key: record.dedup_key.clone(),
        payload: record.payload.clone(),
        reason,
        attempt_count: record.attempt_count,
        last_error: record.last_error.clone(),
        received_at: record.received_at,
        died_at,
        attempts,
    }
}
