//! Durable store on SQLite.
//!
//! Every transition is a single conditional `UPDATE ... RETURNING` so the
//! compare-and-swap happens under SQLite's write lock. Several processes may
//! open the same database file; the lock is what makes dedup and leasing safe
//! between them. Timestamps are stored as Unix milliseconds so they order
//! correctly in SQL.

use std::{str::FromStr, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
    },
    Executor, Row, Sqlite, SqlitePool,
};
use tracing::debug;
use uuid::Uuid;

use super::{check_lease, check_state, DeadLetterSink, EventStore};
use crate::{
    error::{CoreError, Result},
    models::{
        AttemptOutcome, AttemptRecord, DeadLetterEntry, DeadReason, DedupKey, EventRecord,
        EventState, InsertOutcome, Lease,
    },
    time::saturating_add,
};

const RECORD_COLUMNS: &str = "dedup_key, payload, received_at, state, attempt_count, \
                              next_attempt_at, last_error, lease_token, lease_expires_at";

const DEAD_LETTER_COLUMNS: &str = "id, dedup_key, payload, reason, attempt_count, last_error, \
                                   received_at, died_at, attempts";

const SCHEMA: [&str; 5] = [
    r#"
    CREATE TABLE IF NOT EXISTS events (
        dedup_key TEXT PRIMARY KEY,
        payload BLOB NOT NULL,
        received_at INTEGER NOT NULL,
        state TEXT NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        next_attempt_at INTEGER NOT NULL,
        last_error TEXT,
        lease_token TEXT,
        lease_expires_at INTEGER
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_events_due
    ON events(state, next_attempt_at, received_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS attempts (
        dedup_key TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        outcome TEXT NOT NULL,
        error TEXT,
        started_at INTEGER NOT NULL,
        finished_at INTEGER NOT NULL,
        PRIMARY KEY (dedup_key, attempt)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dead_letters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        dedup_key TEXT NOT NULL,
        payload BLOB NOT NULL,
        reason TEXT NOT NULL,
        attempt_count INTEGER NOT NULL,
        last_error TEXT,
        received_at INTEGER NOT NULL,
        died_at INTEGER NOT NULL,
        attempts TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_dead_letters_key
    ON dead_letters(dedup_key, id)
    "#,
];

/// Event store and dead-letter sink backed by a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `url` and applies the
    /// schema.
    ///
    /// In-memory URLs are limited to one connection that is never recycled,
    /// since each SQLite connection would otherwise see its own empty
    /// database.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the URL is malformed, the file cannot
    /// be opened or the schema cannot be applied.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Creates tables and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns error if a DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("sqlite schema applied");
        Ok(())
    }

    /// Closes every connection in the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Records a lease-holder outcome: CAS the record out of `InFlight`, then
    /// append the attempt (and dead letter, if the record died) in the same
    /// transaction.
    async fn finish_attempt(
        &self,
        lease: &Lease,
        to: EventState,
        outcome: AttemptOutcome,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<EventRecord> {
        let key = lease.dedup_key();
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "UPDATE events SET state = ?, attempt_count = attempt_count + 1, \
             last_error = COALESCE(?, last_error), lease_token = NULL, lease_expires_at = NULL \
             WHERE dedup_key = ? AND state = 'in_flight' AND lease_token = ? \
             RETURNING {RECORD_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(error)
            .bind(key.as_str())
            .bind(lease.token.to_string())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            let current = fetch_record(&mut *tx, key).await?;
            let current = current.ok_or_else(|| CoreError::NotFound(key.clone()))?;
            check_lease(&current, lease, to)?;
            return Err(CoreError::LeaseExpired { key: key.clone() });
        };
        let record = record_from_row(&row)?;

        sqlx::query(
            r#"
            INSERT INTO attempts (dedup_key, attempt, outcome, error, started_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(key.as_str())
        .bind(i64::from(record.attempt_count))
        .bind(outcome.as_str())
        .bind(error)
        .bind(lease.claimed_at.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        if to == EventState::Dead {
            insert_dead_letter(&mut tx, &record, DeadReason::Permanent, now).await?;
        }

        tx.commit().await?;
        Ok(record)
    }
}

#[async_trait::async_trait]
impl EventStore for SqliteStore {
    async fn check_and_insert(
        &self,
        key: &DedupKey,
        payload: Bytes,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO events (dedup_key, payload, received_at, state, attempt_count, next_attempt_at)
            VALUES (?, ?, ?, 'pending', 0, ?)
            ON CONFLICT(dedup_key) DO NOTHING
            "#,
        )
        .bind(key.as_str())
        .bind(payload.as_ref())
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            let record = EventRecord::new(key.clone(), payload, millis_to_time(now.timestamp_millis())?);
            return Ok(InsertOutcome::Created(record));
        }

        let state: EventState = sqlx::query_scalar("SELECT state FROM events WHERE dedup_key = ?")
            .bind(key.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(InsertOutcome::Duplicate(state))
    }

    async fn get(&self, key: &DedupKey) -> Result<Option<EventRecord>> {
        fetch_record(&self.pool, key).await
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_timeout: Duration,
    ) -> Result<Option<Lease>> {
        let reclaimed = self.reclaim_expired(now).await?;
        if !reclaimed.is_empty() {
            debug!(count = reclaimed.len(), "reclaimed expired leases before claim");
        }

        let token = Uuid::new_v4();
        let expires_at = saturating_add(now, lease_timeout);
        let sql = format!(
            "UPDATE events SET state = 'in_flight', lease_token = ?, lease_expires_at = ? \
             WHERE dedup_key = ( \
                 SELECT dedup_key FROM events \
                 WHERE state = 'pending' AND next_attempt_at <= ? \
                 ORDER BY next_attempt_at ASC, received_at ASC, dedup_key ASC \
                 LIMIT 1 \
             ) AND state = 'pending' \
             RETURNING {RECORD_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(token.to_string())
            .bind(expires_at.timestamp_millis())
            .bind(now.timestamp_millis())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let record = record_from_row(&row)?;
        Ok(Some(Lease {
            record,
            token,
            claimed_at: now,
            expires_at: millis_to_time(expires_at.timestamp_millis())?,
        }))
    }

    async fn complete(&self, lease: &Lease, now: DateTime<Utc>) -> Result<EventRecord> {
        self.finish_attempt(lease, EventState::Delivered, AttemptOutcome::Success, None, now).await
    }

    async fn fail(&self, lease: &Lease, error: &str, now: DateTime<Utc>) -> Result<EventRecord> {
        self.finish_attempt(lease, EventState::Failed, AttemptOutcome::Retryable, Some(error), now)
            .await
    }

    async fn kill(&self, lease: &Lease, error: &str, now: DateTime<Utc>) -> Result<EventRecord> {
        self.finish_attempt(lease, EventState::Dead, AttemptOutcome::Permanent, Some(error), now)
            .await
    }

    async fn reschedule(
        &self,
        key: &DedupKey,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<EventRecord> {
        let sql = format!(
            "UPDATE events SET state = 'pending', next_attempt_at = ? \
             WHERE dedup_key = ? AND state = 'failed' \
             RETURNING {RECORD_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(next_attempt_at.timestamp_millis())
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => record_from_row(&row),
            None => Err(self.explain_state_miss(key, EventState::Failed, EventState::Pending).await),
        }
    }

    async fn bury(&self, key: &DedupKey, now: DateTime<Utc>) -> Result<EventRecord> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "UPDATE events SET state = 'dead' \
             WHERE dedup_key = ? AND state = 'failed' \
             RETURNING {RECORD_COLUMNS}"
        );
        let row = sqlx::query(&sql).bind(key.as_str()).fetch_optional(&mut *tx).await?;

        let Some(row) = row else {
            drop(tx);
            return Err(self.explain_state_miss(key, EventState::Failed, EventState::Dead).await);
        };
        let record = record_from_row(&row)?;
        insert_dead_letter(&mut tx, &record, DeadReason::Exhausted, now).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn release(&self, lease: &Lease) -> Result<EventRecord> {
        let key = lease.dedup_key();
        let sql = format!(
            "UPDATE events SET state = 'pending', lease_token = NULL, lease_expires_at = NULL \
             WHERE dedup_key = ? AND state = 'in_flight' AND lease_token = ? \
             RETURNING {RECORD_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(key.as_str())
            .bind(lease.token.to_string())
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = row {
            return record_from_row(&row);
        }
        let current =
            fetch_record(&self.pool, key).await?.ok_or_else(|| CoreError::NotFound(key.clone()))?;
        check_lease(&current, lease, EventState::Pending)?;
        Err(CoreError::LeaseExpired { key: key.clone() })
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<DedupKey>> {
        let keys: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE events SET state = 'pending', lease_token = NULL, lease_expires_at = NULL
            WHERE state = 'in_flight' AND lease_expires_at <= ?
            RETURNING dedup_key
            "#,
        )
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        Ok(keys.into_iter().map(DedupKey).collect())
    }

    async fn failed_records(&self) -> Result<Vec<EventRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM events WHERE state = 'failed' ORDER BY received_at ASC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>> {
        let millis: Option<i64> =
            sqlx::query_scalar("SELECT MIN(next_attempt_at) FROM events WHERE state = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        millis.map(millis_to_time).transpose()
    }

    async fn attempts(&self, key: &DedupKey) -> Result<Vec<AttemptRecord>> {
        fetch_attempts(&self.pool, key).await
    }
}

#[async_trait::async_trait]
impl DeadLetterSink for SqliteStore {
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let sql = format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters ORDER BY id ASC LIMIT ?");
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(dead_letter_from_row).collect()
    }

    async fn dead_letter(&self, key: &DedupKey) -> Result<Option<DeadLetterEntry>> {
        let sql = format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE dedup_key = ? \
             ORDER BY id DESC LIMIT 1"
        );
        let row = sqlx::query(&sql).bind(key.as_str()).fetch_optional(&self.pool).await?;
        row.as_ref().map(dead_letter_from_row).transpose()
    }

    async fn replay(&self, key: &DedupKey, now: DateTime<Utc>) -> Result<EventRecord> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "UPDATE events SET state = 'pending', attempt_count = 0, last_error = NULL, \
             next_attempt_at = ? \
             WHERE dedup_key = ? AND state = 'dead' \
             RETURNING {RECORD_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(now.timestamp_millis())
            .bind(key.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            drop(tx);
            return Err(self.explain_state_miss(key, EventState::Dead, EventState::Pending).await);
        };
        let record = record_from_row(&row)?;

        sqlx::query("DELETE FROM attempts WHERE dedup_key = ?")
            .bind(key.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(record)
    }
}

impl SqliteStore {
    /// Builds the error for a conditional update that matched nothing.
    async fn explain_state_miss(
        &self,
        key: &DedupKey,
        expected: EventState,
        to: EventState,
    ) -> CoreError {
        match fetch_record(&self.pool, key).await {
            Ok(Some(current)) => match check_state(&current, expected, to) {
                Err(err) => err,
                // Raced back into the expected state between the two queries.
                Ok(()) => CoreError::InvalidTransition { key: key.clone(), from: expected, to },
            },
            Ok(None) => CoreError::NotFound(key.clone()),
            Err(err) => err,
        }
    }
}

async fn fetch_record<'e, E>(executor: E, key: &DedupKey) -> Result<Option<EventRecord>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {RECORD_COLUMNS} FROM events WHERE dedup_key = ?");
    let row = sqlx::query(&sql).bind(key.as_str()).fetch_optional(executor).await?;
    row.as_ref().map(record_from_row).transpose()
}

async fn fetch_attempts<'e, E>(executor: E, key: &DedupKey) -> Result<Vec<AttemptRecord>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        r#"
        SELECT attempt, outcome, error, started_at, finished_at
        FROM attempts WHERE dedup_key = ?
        ORDER BY attempt ASC
        "#,
    )
    .bind(key.as_str())
    .fetch_all(executor)
    .await?;

    rows.iter()
        .map(|row| -> Result<AttemptRecord> {
            let outcome: String = row.try_get("outcome")?;
            Ok(AttemptRecord {
                attempt: to_count(row.try_get("attempt")?)?,
                outcome: AttemptOutcome::from_str(&outcome).map_err(CoreError::Corrupt)?,
                error: row.try_get("error")?,
                started_at: millis_to_time(row.try_get("started_at")?)?,
                finished_at: millis_to_time(row.try_get("finished_at")?)?,
            })
        })
        .collect()
}

async fn insert_dead_letter(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    record: &EventRecord,
    reason: DeadReason,
    now: DateTime<Utc>,
) -> Result<()> {
    let attempts = fetch_attempts(&mut **tx, &record.dedup_key).await?;
    let attempts =
        serde_json::to_string(&attempts).map_err(|e| CoreError::Corrupt(e.to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO dead_letters
            (dedup_key, payload, reason, attempt_count, last_error, received_at, died_at, attempts)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.dedup_key.as_str())
    .bind(record.payload.as_ref())
    .bind(reason.as_str())
    .bind(i64::from(record.attempt_count))
    .bind(record.last_error.as_deref())
    .bind(record.received_at.timestamp_millis())
    .bind(now.timestamp_millis())
    .bind(attempts)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn record_from_row(row: &SqliteRow) -> Result<EventRecord> {
    let payload: Vec<u8> = row.try_get("payload")?;
    let lease_token: Option<String> = row.try_get("lease_token")?;
    let lease_expires_at: Option<i64> = row.try_get("lease_expires_at")?;

    Ok(EventRecord {
        dedup_key: DedupKey(row.try_get("dedup_key")?),
        payload: Bytes::from(payload),
        received_at: millis_to_time(row.try_get("received_at")?)?,
        state: row.try_get("state")?,
        attempt_count: to_count(row.try_get("attempt_count")?)?,
        next_attempt_at: millis_to_time(row.try_get("next_attempt_at")?)?,
        last_error: row.try_get("last_error")?,
        lease_token: lease_token
            .map(|token| Uuid::parse_str(&token))
            .transpose()
            .map_err(|e| CoreError::Corrupt(e.to_string()))?,
        lease_expires_at: lease_expires_at.map(millis_to_time).transpose()?,
    })
}

fn dead_letter_from_row(row: &SqliteRow) -> Result<DeadLetterEntry> {
    let payload: Vec<u8> = row.try_get("payload")?;
    let reason: String = row.try_get("reason")?;
    let attempts: String = row.try_get("attempts")?;

    Ok(DeadLetterEntry {
        id: row.try_get("id")?,
        dedup_key: DedupKey(row.try_get("dedup_key")?),
        payload: Bytes::from(payload),
        reason: DeadReason::from_str(&reason).map_err(CoreError::Corrupt)?,
        attempt_count: to_count(row.try_get("attempt_count")?)?,
        last_error: row.try_get("last_error")?,
        received_at: millis_to_time(row.try_get("received_at")?)?,
        died_at: millis_to_time(row.try_get("died_at")?)?,
        attempts: serde_json::from_str(&attempts).map_err(|e| CoreError::Corrupt(e.to_string()))?,
    })
}

fn millis_to_time(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| CoreError::Corrupt(format!("timestamp out of range: {millis}")))
}

fn to_count(value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| CoreError::Corrupt(format!("invalid attempt count: {value}")))
}
