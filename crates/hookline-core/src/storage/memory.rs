//! In-process store backed by a hash map and a due-time index.
//!
//! Suitable for single-node deployments and tests. Nothing survives a
//! restart; use [`super::SqliteStore`] when durability matters.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{check_lease, check_state, dead_letter_for, DeadLetterSink, EventStore};
use crate::{
    error::{CoreError, Result},
    models::{
        AttemptOutcome, AttemptRecord, DeadLetterEntry, DeadReason, DedupKey, EventRecord,
        EventState, InsertOutcome, Lease,
    },
    time::saturating_add,
};

type DueEntry = (DateTime<Utc>, DateTime<Utc>, DedupKey);

#[derive(Default)]
struct Inner {
    records: HashMap<DedupKey, EventRecord>,
    /// `Pending` records ordered by (next_attempt_at, received_at, key).
    due: BTreeSet<DueEntry>,
    attempts: HashMap<DedupKey, Vec<AttemptRecord>>,
    dead_letters: Vec<DeadLetterEntry>,
}

fn due_entry(record: &EventRecord) -> DueEntry {
    (record.next_attempt_at, record.received_at, record.dedup_key.clone())
}

impl Inner {
    fn record_mut(&mut self, key: &DedupKey) -> Result<&mut EventRecord> {
        self.records.get_mut(key).ok_or_else(|| CoreError::NotFound(key.clone()))
    }

    fn reclaim_expired(&mut self, now: DateTime<Utc>) -> Vec<DedupKey> {
        let mut reclaimed = Vec::new();
        for record in self.records.values_mut() {
            if record.lease_expired(now) {
                record.state = EventState::Pending;
                record.lease_token = None;
                record.lease_expires_at = None;
                self.due.insert(due_entry(record));
                reclaimed.push(record.dedup_key.clone());
            }
        }
        reclaimed
    }

    /// Applies a lease-holder transition and records the attempt.
    fn finish_attempt(
        &mut self,
        lease: &Lease,
        to: EventState,
        outcome: AttemptOutcome,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<EventRecord> {
        let record = self.record_mut(lease.dedup_key())?;
        check_lease(record, lease, to)?;

        record.state = to;
        record.attempt_count += 1;
        if let Some(error) = error {
            record.last_error = Some(error.to_string());
        }
        record.lease_token = None;
        record.lease_expires_at = None;
        let updated = record.clone();

        self.attempts.entry(updated.dedup_key.clone()).or_default().push(AttemptRecord {
            attempt: updated.attempt_count,
            outcome,
            error: error.map(str::to_string),
            started_at: lease.claimed_at,
            finished_at: now,
        });
        Ok(updated)
    }

    fn append_dead_letter(&mut self, record: &EventRecord, reason: DeadReason, now: DateTime<Utc>) {
        let id = i64::try_from(self.dead_letters.len()).unwrap_or(i64::MAX).saturating_add(1);
        let attempts = self.attempts.get(&record.dedup_key).cloned().unwrap_or_default();
        self.dead_letters.push(dead_letter_for(id, record, reason, now, attempts));
    }
}

/// Event store held entirely in memory.
///
/// Cloning is cheap and clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held, in any state.
    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    /// Whether the store holds no records.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.records.is_empty()
    }
}

#[async_trait::async_trait]
impl EventStore for MemoryStore {
    async fn check_and_insert(
        &self,
        key: &DedupKey,
        payload: Bytes,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.records.get(key) {
            return Ok(InsertOutcome::Duplicate(existing.state));
        }

        let record = EventRecord::new(key.clone(), payload, now);
        inner.due.insert(due_entry(&record));
        inner.records.insert(key.clone(), record.clone());
        Ok(InsertOutcome::Created(record))
    }

    async fn get(&self, key: &DedupKey) -> Result<Option<EventRecord>> {
        Ok(self.inner.read().await.records.get(key).cloned())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_timeout: Duration,
    ) -> Result<Option<Lease>> {
        let mut inner = self.inner.write().await;
        inner.reclaim_expired(now);

        let Some(entry) = inner.due.first().cloned() else {
            return Ok(None);
        };
        if entry.0 > now {
            return Ok(None);
        }
        inner.due.remove(&entry);

        let token = Uuid::new_v4();
        let expires_at = saturating_add(now, lease_timeout);
        let record = inner.record_mut(&entry.2)?;
        record.state = EventState::InFlight;
        record.lease_token = Some(token);
        record.lease_expires_at = Some(expires_at);

        Ok(Some(Lease { record: record.clone(), token, claimed_at: now, expires_at }))
    }

    async fn complete(&self, lease: &Lease, now: DateTime<Utc>) -> Result<EventRecord> {
        let mut inner = self.inner.write().await;
        inner.finish_attempt(lease, EventState::Delivered, AttemptOutcome::Success, None, now)
    }

    async fn fail(&self, lease: &Lease, error: &str, now: DateTime<Utc>) -> Result<EventRecord> {
        let mut inner = self.inner.write().await;
        inner.finish_attempt(lease, EventState::Failed, AttemptOutcome::Retryable, Some(error), now)
    }

    async fn kill(&self, lease: &Lease, error: &str, now: DateTime<Utc>) -> Result<EventRecord> {
        let mut inner = self.inner.write().await;
        let record =
            inner.finish_attempt(
                lease,
                EventState::Dead,
                AttemptOutcome::Permanent,
                Some(error),
                now,
            )?;
        inner.append_dead_letter(&record, DeadReason::Permanent, now);
        Ok(record)
    }

    async fn reschedule(
        &self,
        key: &DedupKey,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<EventRecord> {
        let mut inner = self.inner.write().await;
        let record = inner.record_mut(key)?;
        check_state(record, EventState::Failed, EventState::Pending)?;

        record.state = EventState::Pending;
        record.next_attempt_at = next_attempt_at;
        let updated = record.clone();
        inner.due.insert(due_entry(&updated));
        Ok(updated)
    }

    async fn bury(&self, key: &DedupKey, now: DateTime<Utc>) -> Result<EventRecord> {
        let mut inner = self.inner.write().await;
        let record = inner.record_mut(key)?;
        check_state(record, EventState::Failed, EventState::Dead)?;

        record.state = EventState::Dead;
        let updated = record.clone();
        inner.append_dead_letter(&updated, DeadReason::Exhausted, now);
        Ok(updated)
    }

    async fn release(&self, lease: &Lease) -> Result<EventRecord> {
        let mut inner = self.inner.write().await;
        let record = inner.record_mut(lease.dedup_key())?;
        check_lease(record, lease, EventState::Pending)?;

        record.state = EventState::Pending;
        record.lease_token = None;
        record.lease_expires_at = None;
        let updated = record.clone();
        inner.due.insert(due_entry(&updated));
        Ok(updated)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<DedupKey>> {
        Ok(self.inner.write().await.reclaim_expired(now))
    }

    async fn failed_records(&self) -> Result<Vec<EventRecord>> {
        let inner = self.inner.read().await;
        let mut failed: Vec<_> = inner
            .records
            .values()
            .filter(|record| record.state == EventState::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        Ok(failed)
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.inner.read().await.due.first().map(|entry| entry.0))
    }

    async fn attempts(&self, key: &DedupKey) -> Result<Vec<AttemptRecord>> {
        Ok(self.inner.read().await.attempts.get(key).cloned().unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl DeadLetterSink for MemoryStore {
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let inner = self.inner.read().await;
        Ok(inner.dead_letters.iter().take(limit).cloned().collect())
    }

    async fn dead_letter(&self, key: &DedupKey) -> Result<Option<DeadLetterEntry>> {
        let inner = self.inner.read().await;
        Ok(inner.dead_letters.iter().rev().find(|entry| &entry.dedup_key == key).cloned())
    }

    async fn replay(&self, key: &DedupKey, now: DateTime<Utc>) -> Result<EventRecord> {
        let mut inner = self.inner.write().await;
        let record = inner.record_mut(key)?;
        check_state(record, EventState::Dead, EventState::Pending)?;

        record.state = EventState::Pending;
        record.attempt_count = 0;
        record.last_error = None;
        record.next_attempt_at = now;
        let updated = record.clone();
        inner.due.insert(due_entry(&updated));
        inner.attempts.remove(key);
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(30);

    fn key(s: &str) -> DedupKey {
        DedupKey::new(s)
    }

    #[tokio::test]
    async fn claim_orders_by_due_time_then_receipt() {
        let store = MemoryStore::new();
        let t0 = Utc::now();

        store.check_and_insert(&key("b"), Bytes::new(), t0).await.unwrap();
        let later = t0 + chrono::Duration::seconds(1);
        store.check_and_insert(&key("a"), Bytes::new(), later).await.unwrap();

        let later = t0 + chrono::Duration::seconds(5);
        let first = store.claim_due(later, LEASE).await.unwrap().unwrap();
        let second = store.claim_due(later, LEASE).await.unwrap().unwrap();

        assert_eq!(first.dedup_key(), &key("b"));
        assert_eq!(second.dedup_key(), &key("a"));
        assert!(store.claim_due(later, LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn records_not_yet_due_are_not_claimed() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store.check_and_insert(&key("evt"), Bytes::new(), t0).await.unwrap();

        let lease = store.claim_due(t0, LEASE).await.unwrap().unwrap();
        store.fail(&lease, "boom", t0).await.unwrap();
        store.reschedule(&key("evt"), t0 + chrono::Duration::seconds(10)).await.unwrap();

        assert!(store.claim_due(t0 + chrono::Duration::seconds(9), LEASE).await.unwrap().is_none());
        assert_eq!(store.next_due_at().await.unwrap(), Some(t0 + chrono::Duration::seconds(10)));
        let after_expiry = t0 + chrono::Duration::seconds(10);
        assert!(store.claim_due(after_expiry, LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn released_lease_cannot_be_used_again() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store.check_and_insert(&key("evt"), Bytes::new(), t0).await.unwrap();

        let lease = store.claim_due(t0, LEASE).await.unwrap().unwrap();
        let released = store.release(&lease).await.unwrap();
        assert_eq!(released.state, EventState::Pending);
        assert_eq!(released.attempt_count, 0);

        let err = store.complete(&lease, t0).await.unwrap_err();
        assert!(matches!(err, CoreError::LeaseExpired { .. }));
    }
}
