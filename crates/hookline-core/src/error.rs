//! Error types for store operations.
//!
//! Separates infrastructure failures from state machine violations so callers
//! can log the latter as diagnostics without treating the store as down.

use thiserror::Error;

use crate::models::{DedupKey, EventState};

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the idempotency store and dead-letter sink.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Backing database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// No record exists for the key.
    #[error("event {0} not found")]
    NotFound(DedupKey),

    /// The requested transition is not allowed from the record's current
    /// state. The record is left unchanged.
    #[error("invalid transition for {key}: {from} -> {to}")]
    InvalidTransition {
        /// Record the transition was requested on
        key: DedupKey,
        /// State the record is actually in
        from: EventState,
        /// State the caller asked for
        to: EventState,
    },

    /// The caller's lease no longer matches the record; another worker may
    /// own it now.
    #[error("lease on {key} expired or was superseded")]
    LeaseExpired {
        /// Record whose lease was lost
        key: DedupKey,
    },

    /// Stored data could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl CoreError {
    /// Whether the error signals a state machine race rather than an
    /// unavailable store.
    pub fn is_transition_conflict(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. } | Self::LeaseExpired { .. })
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::Corrupt(err.to_string())
            },
            _ => Self::Database(err.to_string()),
        }
    }
}
