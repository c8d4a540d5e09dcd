//! HTTP request handlers.
//!
//! - `ingest`: webhook intake
//! - `health`: liveness with a store check
//! - `operator`: event inspection and dead-letter replay

pub mod health;
pub mod ingest;
pub mod operator;

pub use health::health_check;
pub use ingest::ingest_webhook;
pub use operator::{get_dead_letter, get_event, list_dead_letters, replay_dead_letter};
