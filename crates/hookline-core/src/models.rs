//! Event records and the lifecycle state machine.
//!
//! Defines the dedup key newtype, the record stored per distinct event, the
//! lease a worker holds while processing it, and the attempt history that
//! follows a record into the dead-letter sink.

use std::{fmt, str::FromStr};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type SqliteDb = sqlx::Sqlite;
type SqliteValueRef<'r> = sqlx::sqlite::SqliteValueRef<'r>;
type SqliteTypeInfo = sqlx::sqlite::SqliteTypeInfo;
type BoxDynError = sqlx::error::BoxDynError;

/// Identity of a logical event for idempotency.
///
/// Taken from the sender's event id header when present, otherwise derived
/// from the body content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(pub String);

impl DedupKey {
    /// Wraps a sender-provided identifier.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Builds a key from an already computed content digest.
    ///
    /// ```
    /// use hookline_core::models::DedupKey;
    /// let key = DedupKey::from_digest("ab12");
    /// assert_eq!(key.as_str(), "sha256:ab12");
    /// ```
    pub fn from_digest(hex_digest: &str) -> Self {
        Self(format!("sha256:{hex_digest}"))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DedupKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DedupKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle state of an event record.
///
/// ```text
/// Pending -> InFlight -> Delivered
///                     -> Failed -> Pending | Dead
///                     -> Dead
///                     -> Pending (lease expired or released)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventState {
    /// Waiting for `next_attempt_at` to pass and a worker to claim it.
    Pending,

    /// Leased by a worker; the handler is running.
    InFlight,

    /// Handler succeeded. Terminal.
    Delivered,

    /// Handler failed and the outcome is recorded; awaiting the retry
    /// scheduler's decision.
    Failed,

    /// Retries exhausted or permanent failure. Terminal.
    Dead,
}

impl EventState {
    /// Whether no further transition is allowed out of this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Dead)
    }

    /// Column representation used by the SQLite store.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            _ => Err(format!("invalid event state: {s}")),
        }
    }
}

impl sqlx::Type<SqliteDb> for EventState {
    fn type_info() -> SqliteTypeInfo {
        <&str as sqlx::Type<SqliteDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, SqliteDb> for EventState {
    fn decode(value: SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<SqliteDb>>::decode(value)?;
        s.parse::<Self>().map_err(Into::into)
    }
}

/// The unit of work owned by the idempotency store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique identity across all records.
    pub dedup_key: DedupKey,

    /// Raw request body, immutable once stored.
    pub payload: Bytes,

    /// First acceptance time.
    pub received_at: DateTime<Utc>,

    /// Current lifecycle state.
    pub state: EventState,

    /// Number of handler outcomes recorded so far.
    pub attempt_count: u32,

    /// Earliest time the record may be claimed. Only meaningful while
    /// `Pending`.
    pub next_attempt_at: DateTime<Utc>,

    /// Most recent handler failure.
    pub last_error: Option<String>,

    /// Token of the lease currently held on the record, if `InFlight`.
    pub lease_token: Option<Uuid>,

    /// When the current lease stops being honoured.
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl EventRecord {
    /// Creates a fresh `Pending` record due immediately.
    pub fn new(dedup_key: DedupKey, payload: Bytes, received_at: DateTime<Utc>) -> Self {
        Self {
            dedup_key,
            payload,
            received_at,
            state: EventState::Pending,
            attempt_count: 0,
            next_attempt_at: received_at,
            last_error: None,
            lease_token: None,
            lease_expires_at: None,
        }
    }

    /// Whether the record is `Pending` and due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == EventState::Pending && self.next_attempt_at <= now
    }

    /// Whether the record is `InFlight` with a lease that has run out.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == EventState::InFlight && self.lease_expires_at.is_some_and(|at| at <= now)
    }
}

/// Exclusive, time-bounded claim on an `InFlight` record.
///
/// Every state change a worker makes presents the token; the store rejects
/// tokens that no longer match the record.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    /// Snapshot of the record at claim time.
    pub record: EventRecord,

    /// Token minted by the claim.
    pub token: Uuid,

    /// When the claim was made.
    pub claimed_at: DateTime<Utc>,

    /// Time after which the lease may be reclaimed.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Key of the leased record.
    pub fn dedup_key(&self) -> &DedupKey {
        &self.record.dedup_key
    }

    /// Attempt number this lease is processing (1-based).
    pub fn attempt_number(&self) -> u32 {
        self.record.attempt_count + 1
    }
}

/// Result of `check_and_insert`.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// This caller created the record.
    Created(EventRecord),

    /// A record already existed; carries its state at lookup time.
    Duplicate(EventState),
}

/// How a recorded attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Handler reported success.
    Success,
    /// Handler failed in a way worth retrying (includes timeouts).
    Retryable,
    /// Handler rejected the event permanently.
    Permanent,
}

impl AttemptOutcome {
    /// Column representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Retryable => "retryable",
            Self::Permanent => "permanent",
        }
    }
}

impl FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "retryable" => Ok(Self::Retryable),
            "permanent" => Ok(Self::Permanent),
            _ => Err(format!("invalid attempt outcome: {s}")),
        }
    }
}

/// One handler invocation in a record's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    /// How the attempt ended.
    pub outcome: AttemptOutcome,
    /// Failure description, if any.
    pub error: Option<String>,
    /// When the lease for this attempt was taken.
    pub started_at: DateTime<Utc>,
    /// When the outcome was recorded.
    pub finished_at: DateTime<Utc>,
}

/// Why a record was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadReason {
    /// The handler reported a permanent failure.
    Permanent,
    /// `max_attempts` retryable failures were recorded.
    Exhausted,
}

impl DeadReason {
    /// Column representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::Exhausted => "exhausted",
        }
    }
}

impl FromStr for DeadReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "permanent" => Ok(Self::Permanent),
            "exhausted" => Ok(Self::Exhausted),
            _ => Err(format!("invalid dead reason: {s}")),
        }
    }
}

/// Append-only entry written when a record reaches `Dead`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Sequence number assigned by the sink.
    pub id: i64,
    /// Key of the dead record.
    pub dedup_key: DedupKey,
    /// Payload at time of death.
    #[serde(skip)]
    pub payload: Bytes,
    /// Why the record died.
    pub reason: DeadReason,
    /// Attempts recorded before death.
    pub attempt_count: u32,
    /// Last handler failure.
    pub last_error: Option<String>,
    /// First acceptance time of the record.
    pub received_at: DateTime<Utc>,
    /// When the record reached `Dead`.
    pub died_at: DateTime<Utc>,
    /// Every attempt made during this life of the record.
    pub attempts: Vec<AttemptRecord>,
}
