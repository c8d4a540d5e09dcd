//! Contract tests for the event store backends.
//!
//! Every scenario runs against both the in-memory store and the SQLite store
//! so the two stay interchangeable.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use hookline_core::{
    CoreError, DeadLetterSink, DeadReason, DedupKey, EventState, EventStore, InsertOutcome,
    MemoryStore, SqliteStore,
};
use tempfile::TempDir;

const LEASE: Duration = Duration::from_secs(30);

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

async fn sqlite_store() -> Result<(SqliteStore, TempDir)> {
    let dir = tempfile::tempdir()?;
    let url = format!("sqlite://{}", dir.path().join("events.db").display());
    let store = SqliteStore::connect(&url, 4).await?;
    Ok((store, dir))
}

async fn concurrent_inserts_create_exactly_once<S>(store: Arc<S>) -> Result<()>
where
    S: EventStore,
{
    let key = DedupKey::new("evt_race");
    let mut handles = Vec::new();
    for _ in 0..32 {
        let store = store.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            store.check_and_insert(&key, Bytes::from_static(b"{\"x\":1}"), t0()).await
        }));
    }

    let mut created = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await?? {
            InsertOutcome::Created(_) => created += 1,
            InsertOutcome::Duplicate(_) => duplicates += 1,
        }
    }

    assert_eq!(created, 1);
    assert_eq!(duplicates, 31);
    Ok(())
}

async fn terminal_records_never_transition<S>(store: &S) -> Result<()>
where
    S: EventStore + DeadLetterSink,
{
    let delivered = DedupKey::new("evt_delivered");
    let dead = DedupKey::new("evt_dead");
    store.check_and_insert(&delivered, Bytes::new(), t0()).await?;
    store.check_and_insert(&dead, Bytes::new(), t0() + secs(1)).await?;

    let delivered_lease = store.claim_due(t0() + secs(2), LEASE).await?.expect("due");
    store.complete(&delivered_lease, t0() + secs(2)).await?;
    let dead_lease = store.claim_due(t0() + secs(2), LEASE).await?.expect("due");
    store.kill(&dead_lease, "schema mismatch", t0() + secs(2)).await?;

    for (key, lease, state) in [
        (&delivered, &delivered_lease, EventState::Delivered),
        (&dead, &dead_lease, EventState::Dead),
    ] {
        let before = store.get(key).await?.expect("record");
        let now = t0() + secs(3);

        let results = vec![
            store.complete(lease, now).await.map(|_| ()),
            store.fail(lease, "late", now).await.map(|_| ()),
            store.kill(lease, "late", now).await.map(|_| ()),
            store.release(lease).await.map(|_| ()),
            store.reschedule(key, now).await.map(|_| ()),
            store.bury(key, now).await.map(|_| ()),
        ];
        for result in results {
            assert!(
                matches!(result, Err(CoreError::InvalidTransition { from, .. }) if from == state),
                "expected InvalidTransition from {state}, got {result:?}"
            );
        }

        assert_eq!(store.get(key).await?.expect("record"), before);
    }

    assert!(matches!(
        store.replay(&delivered, t0()).await,
        Err(CoreError::InvalidTransition { from: EventState::Delivered, .. })
    ));
    Ok(())
}

async fn expired_lease_is_claimable_by_another_worker<S>(store: &S) -> Result<()>
where
    S: EventStore,
{
    let key = DedupKey::new("evt_crash");
    store.check_and_insert(&key, Bytes::from_static(b"payload"), t0()).await?;

    let crashed = store.claim_due(t0(), Duration::from_secs(10)).await?.expect("due");
    assert!(store.claim_due(t0() + secs(5), LEASE).await?.is_none());

    let rescued = store.claim_due(t0() + secs(10), LEASE).await?.expect("lease expired");
    assert_eq!(rescued.dedup_key(), &key);
    assert_ne!(rescued.token, crashed.token);
    assert_eq!(rescued.record.attempt_count, 0);

    assert!(matches!(
        store.complete(&crashed, t0() + secs(11)).await,
        Err(CoreError::LeaseExpired { .. })
    ));

    let done = store.complete(&rescued, t0() + secs(11)).await?;
    assert_eq!(done.state, EventState::Delivered);
    assert_eq!(done.attempt_count, 1);
    Ok(())
}

async fn reclaim_sweep_returns_expired_leases<S>(store: &S) -> Result<()>
where
    S: EventStore,
{
    let key = DedupKey::new("evt_sweep");
    store.check_and_insert(&key, Bytes::new(), t0()).await?;
    store.claim_due(t0(), Duration::from_secs(10)).await?.expect("due");

    assert!(store.reclaim_expired(t0() + secs(9)).await?.is_empty());
    assert_eq!(store.reclaim_expired(t0() + secs(10)).await?, vec![key.clone()]);

    let record = store.get(&key).await?.expect("record");
    assert_eq!(record.state, EventState::Pending);
    assert_eq!(record.lease_token, None);
    Ok(())
}

async fn exhausted_record_is_dead_lettered_with_history<S>(store: &S) -> Result<()>
where
    S: EventStore + DeadLetterSink,
{
    let key = DedupKey::new("evt_flaky");
    store.check_and_insert(&key, Bytes::from_static(b"body"), t0()).await?;

    let first = store.claim_due(t0(), LEASE).await?.expect("due");
    let failed = store.fail(&first, "connection reset", t0() + secs(1)).await?;
    assert_eq!(failed.state, EventState::Failed);
    assert_eq!(failed.attempt_count, 1);
    assert_eq!(store.failed_records().await?.len(), 1);

    store.reschedule(&key, t0() + secs(5)).await?;
    let second = store.claim_due(t0() + secs(5), LEASE).await?.expect("due");
    store.fail(&second, "connection refused", t0() + secs(6)).await?;
    let dead = store.bury(&key, t0() + secs(6)).await?;

    assert_eq!(dead.state, EventState::Dead);
    assert_eq!(dead.attempt_count, 2);
    assert_eq!(dead.last_error.as_deref(), Some("connection refused"));

    let entry = store.dead_letter(&key).await?.expect("dead letter");
    assert_eq!(entry.reason, DeadReason::Exhausted);
    assert_eq!(entry.attempt_count, 2);
    assert_eq!(entry.payload, Bytes::from_static(b"body"));
    assert_eq!(entry.attempts.len(), 2);
    assert_eq!(entry.attempts[0].error.as_deref(), Some("connection reset"));
    assert_eq!(entry.attempts[1].started_at, t0() + secs(5));
    assert_eq!(entry.died_at, t0() + secs(6));
    Ok(())
}

async fn replay_resets_attempts_and_keeps_dead_letter<S>(store: &S) -> Result<()>
where
    S: EventStore + DeadLetterSink,
{
    let key = DedupKey::new("evt_replay");
    store.check_and_insert(&key, Bytes::new(), t0()).await?;
    let lease = store.claim_due(t0(), LEASE).await?.expect("due");
    store.kill(&lease, "rejected", t0()).await?;

    let entry = store.dead_letter(&key).await?.expect("dead letter");
    assert_eq!(entry.reason, DeadReason::Permanent);
    assert_eq!(entry.attempts.len(), 1);

    let replayed = store.replay(&key, t0() + secs(60)).await?;
    assert_eq!(replayed.state, EventState::Pending);
    assert_eq!(replayed.attempt_count, 0);
    assert_eq!(replayed.last_error, None);
    assert!(store.attempts(&key).await?.is_empty());
    assert_eq!(store.dead_letters(10).await?.len(), 1);

    let again = store.claim_due(t0() + secs(60), LEASE).await?.expect("due after replay");
    let done = store.complete(&again, t0() + secs(61)).await?;
    assert_eq!(done.attempt_count, 1);

    assert!(matches!(
        store.replay(&DedupKey::new("missing"), t0()).await,
        Err(CoreError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn memory_concurrent_inserts_create_exactly_once() -> Result<()> {
    concurrent_inserts_create_exactly_once(Arc::new(MemoryStore::new())).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_concurrent_inserts_create_exactly_once() -> Result<()> {
    let (store, _dir) = sqlite_store().await?;
    concurrent_inserts_create_exactly_once(Arc::new(store)).await
}

#[tokio::test]
async fn memory_terminal_records_never_transition() -> Result<()> {
    terminal_records_never_transition(&MemoryStore::new()).await
}

#[tokio::test]
async fn sqlite_terminal_records_never_transition() -> Result<()> {
    let (store, _dir) = sqlite_store().await?;
    terminal_records_never_transition(&store).await
}

#[tokio::test]
async fn memory_expired_lease_is_claimable_by_another_worker() -> Result<()> {
    expired_lease_is_claimable_by_another_worker(&MemoryStore::new()).await
}

#[tokio::test]
async fn sqlite_expired_lease_is_claimable_by_another_worker() -> Result<()> {
    let (store, _dir) = sqlite_store().await?;
    expired_lease_is_claimable_by_another_worker(&store).await
}

#[tokio::test]
async fn memory_reclaim_sweep_returns_expired_leases() -> Result<()> {
    reclaim_sweep_returns_expired_leases(&MemoryStore::new()).await
}

#[tokio::test]
async fn sqlite_reclaim_sweep_returns_expired_leases() -> Result<()> {
    let (store, _dir) = sqlite_store().await?;
    reclaim_sweep_returns_expired_leases(&store).await
}

#[tokio::test]
async fn memory_exhausted_record_is_dead_lettered_with_history() -> Result<()> {
    exhausted_record_is_dead_lettered_with_history(&MemoryStore::new()).await
}

#[tokio::test]
async fn sqlite_exhausted_record_is_dead_lettered_with_history() -> Result<()> {
    let (store, _dir) = sqlite_store().await?;
    exhausted_record_is_dead_lettered_with_history(&store).await
}

#[tokio::test]
async fn memory_replay_resets_attempts_and_keeps_dead_letter() -> Result<()> {
    replay_resets_attempts_and_keeps_dead_letter(&MemoryStore::new()).await
}

#[tokio::test]
async fn sqlite_replay_resets_attempts_and_keeps_dead_letter() -> Result<()> {
    let (store, _dir) = sqlite_store().await?;
    replay_resets_attempts_and_keeps_dead_letter(&store).await
}

/// Dedup state survives closing and reopening the database.
#[tokio::test]
async fn sqlite_dedup_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let url = format!("sqlite://{}", dir.path().join("events.db").display());
    let key = DedupKey::new("evt_durable");

    let store = SqliteStore::connect(&url, 2).await?;
    store.check_and_insert(&key, Bytes::from_static(b"once"), t0()).await?;
    store.close().await;

    let reopened = SqliteStore::connect(&url, 2).await?;
    let outcome = reopened.check_and_insert(&key, Bytes::from_static(b"twice"), t0()).await?;
    assert_eq!(outcome, InsertOutcome::Duplicate(EventState::Pending));
    assert_eq!(reopened.get(&key).await?.expect("record").payload, Bytes::from_static(b"once"));
    Ok(())
}

/// Two independent pools on one file behave like two processes sharing the
/// database: only one claim wins.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_claims_are_exclusive_across_pools() -> Result<()> {
    let (first, dir) = sqlite_store().await?;
    let url = format!("sqlite://{}", dir.path().join("events.db").display());
    let second = SqliteStore::connect(&url, 4).await?;

    for i in 0..20 {
        first.check_and_insert(&DedupKey::new(format!("evt_{i}")), Bytes::new(), t0()).await?;
    }

    let (a, b) = (Arc::new(first), Arc::new(second));
    let mut handles = Vec::new();
    for store in [a.clone(), b.clone(), a, b] {
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(lease) = store.claim_due(t0(), LEASE).await? {
                claimed.push(lease.dedup_key().clone());
            }
            Ok::<_, CoreError>(claimed)
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await??);
    }
    assert_eq!(all.len(), 20);
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 20, "a record was claimed twice");
    Ok(())
}
