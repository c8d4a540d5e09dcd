//! Webhook intake and the HTTP surface of hookline.
//!
//! Verifies HMAC signatures, records each distinct event once in the
//! idempotency store and exposes operator routes for inspection and
//! dead-letter replay.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod intake;
pub mod middleware;
pub mod server;

pub use config::Config;
pub use crypto::{SignatureError, SignatureVerifier, SigningScheme};
pub use error::ApiError;
pub use intake::{InboundWebhook, IntakeOutcome, IntakeService};
pub use server::{create_router, serve, shutdown_signal, start_server, AppState};
