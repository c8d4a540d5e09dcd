//! Delivery side of the receiver: dispatch queue, retry scheduler, worker
//! pool and the handler seam.
//!
//! Workers claim due records from the [`hookline_core::EventStore`] under a
//! lease, invoke the user's [`EventHandler`] with a timeout and record the
//! outcome. Failures are rescheduled with exponential backoff and jitter
//! until `max_attempts` is spent, then moved to the dead-letter sink.
//!
//! Delivery is at least once: a handler may see the same dedup key again if
//! a worker dies after the handler returned but before the outcome landed.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hookline_core::{MemoryStore, RealClock};
//! use hookline_delivery::{DeliveryConfig, DeliveryEngine, DeliveryError, LogHandler};
//!
//! # async fn example() -> Result<(), DeliveryError> {
//! let mut engine = DeliveryEngine::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(LogHandler),
//!     DeliveryConfig::default(),
//!     Arc::new(RealClock::new()),
//! )?;
//!
//! engine.start().await?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod handler;
pub mod queue;
pub mod retry;
mod worker;
mod worker_pool;

pub use engine::{DeliveryConfig, DeliveryEngine, EngineStats};
pub use error::{DeliveryError, Result};
pub use handler::{CommandHandler, EventHandler, HandlerOutcome, LogHandler};
pub use queue::{DispatchQueue, RecoveryReport};
pub use retry::{RetryDecision, RetryPolicy};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;
