//! Error types for the delivery pipeline.
//!
//! Handler failures are not errors of the engine; they are outcomes the
//! retry scheduler resolves. `DeliveryError` covers what can go wrong around
//! them: the store, timeouts, shutdown and worker supervision.

use std::time::Duration;

use hookline_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised by the dispatch queue, workers and the engine.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Store operation failed.
    #[error(transparent)]
    Store(#[from] CoreError),

    /// Handler did not return within the configured timeout.
    #[error("handler timed out after {}ms", timeout.as_millis())]
    HandlerTimeout {
        /// Configured handler timeout
        timeout: Duration,
    },

    /// Handler failed in a way worth retrying.
    #[error("retryable handler failure: {reason}")]
    RetryableHandlerFailure {
        /// Reason reported by the handler
        reason: String,
    },

    /// Handler rejected the event; it goes to the dead-letter sink.
    #[error("permanent handler failure: {reason}")]
    PermanentHandlerFailure {
        /// Reason reported by the handler
        reason: String,
    },

    /// Retry budget spent; the event goes to the dead-letter sink.
    #[error("delivery failed after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts recorded for the event
        attempts: u32,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("worker shutdown timed out after {}s", timeout.as_secs())]
    ShutdownTimeout {
        /// Configured shutdown timeout
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Index of the failed worker
        worker_id: usize,
        /// Join error description
        error: String,
    },

    /// Invalid engine configuration.
    #[error("invalid delivery configuration: {message}")]
    Configuration {
        /// What is wrong
        message: String,
    },
}

impl DeliveryError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether the failure should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HandlerTimeout { .. } | Self::RetryableHandlerFailure { .. } => true,
            Self::Store(err) => !err.is_transition_conflict(),
            Self::PermanentHandlerFailure { .. }
            | Self::RetriesExhausted { .. }
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. }
            | Self::Configuration { .. } => false,
        }
    }

    /// Text recorded as the attempt's `last_error`.
    ///
    /// Handler failures keep the handler's own wording.
    pub fn attempt_error(&self) -> String {
        match self {
            Self::RetryableHandlerFailure { reason } | Self::PermanentHandlerFailure { reason } => {
                reason.clone()
            },
            other => other.to_string(),
        }
    }

    /// Whether this is a state machine race (stale lease, terminal record)
    /// that should be logged and skipped rather than treated as a failure.
    pub fn is_transition_conflict(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_transition_conflict())
    }
}

#[cfg(test)]
mod tests {
    use hookline_core::{DedupKey, EventState};

    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::HandlerTimeout { timeout: Duration::from_secs(5) }.is_retryable());
        assert!(DeliveryError::RetryableHandlerFailure { reason: "503".into() }.is_retryable());
        assert!(DeliveryError::Store(CoreError::Database("locked".into())).is_retryable());

        assert!(!DeliveryError::PermanentHandlerFailure { reason: "bad".into() }.is_retryable());
        assert!(!DeliveryError::RetriesExhausted { attempts: 5 }.is_retryable());
        assert!(!DeliveryError::configuration("zero workers").is_retryable());
    }

    #[test]
    fn transition_conflicts_are_not_retried() {
        let err = DeliveryError::from(CoreError::InvalidTransition {
            key: DedupKey::new("evt_1"),
            from: EventState::Delivered,
            to: EventState::Failed,
        });
        assert!(err.is_transition_conflict());
        assert!(!err.is_retryable());
    }

    #[test]
    fn attempt_error_keeps_handler_wording() {
        let err = DeliveryError::PermanentHandlerFailure { reason: "unknown event type".into() };
        assert_eq!(err.attempt_error(), "unknown event type");
        assert_eq!(err.to_string(), "permanent handler failure: unknown event type");

        let err = DeliveryError::RetriesExhausted { attempts: 3 };
        assert_eq!(err.attempt_error(), "delivery failed after 3 attempts");
    }

    #[test]
    fn error_display_format() {
        let err = DeliveryError::HandlerTimeout { timeout: Duration::from_millis(1500) };
        assert_eq!(err.to_string(), "handler timed out after 1500ms");

        let err = DeliveryError::ShutdownTimeout { timeout: Duration::from_secs(30) };
        assert_eq!(err.to_string(), "worker shutdown timed out after 30s");
    }
}
