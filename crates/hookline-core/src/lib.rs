//! Event records, the idempotency store and the dead-letter sink.
//!
//! Everything that mutates shared state lives behind the [`EventStore`] and
//! [`DeadLetterSink`] traits. The intake path and the delivery engine only
//! ever talk to those traits.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    AttemptOutcome, AttemptRecord, DeadLetterEntry, DeadReason, DedupKey, EventRecord,
    EventState, InsertOutcome, Lease,
};
pub use storage::{DeadLetterSink, EventStore, MemoryStore, SqliteStore};
pub use time::{Clock, RealClock, TestClock};
