//! Event handlers invoked by delivery workers.
//!
//! A handler receives the dedup key and the raw payload of a leased record
//! and reports one of three outcomes. It never sees the store; the worker
//! turns the outcome into a state transition.

use std::{process::Stdio, sync::Arc};

use bytes::Bytes;
use hookline_core::DedupKey;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, info, warn};

use crate::error::{DeliveryError, Result};

/// Exit code a command handler uses to request a retry (`EX_TEMPFAIL`).
pub const EXIT_RETRYABLE: i32 = 75;

/// Environment variable carrying the dedup key to command handlers.
pub const DEDUP_KEY_ENV: &str = "HOOKLINE_DEDUP_KEY";

/// Result of one handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The event was processed.
    Success,
    /// Processing failed; try again later.
    RetryableFailure(String),
    /// Processing can never succeed; dead-letter the event.
    PermanentFailure(String),
}

impl HandlerOutcome {
    /// Shorthand for a retryable failure.
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::RetryableFailure(reason.into())
    }

    /// Shorthand for a permanent failure.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::PermanentFailure(reason.into())
    }

    /// Converts a failure outcome into the matching delivery error.
    pub fn into_error(self) -> Option<DeliveryError> {
        match self {
            Self::Success => None,
            Self::RetryableFailure(reason) => {
                Some(DeliveryError::RetryableHandlerFailure { reason })
            },
            Self::PermanentFailure(reason) => {
                Some(DeliveryError::PermanentHandlerFailure { reason })
            },
        }
    }
}

/// User-supplied processing for accepted events.
///
/// Invoked at least once per accepted event. Implementations must tolerate
/// repeated invocations for the same key: a worker that crashes after the
/// handler returns but before the outcome is recorded causes a redelivery.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Processes one event.
    async fn handle(&self, key: &DedupKey, payload: &Bytes) -> HandlerOutcome;
}

#[async_trait::async_trait]
impl<H: EventHandler + ?Sized> EventHandler for Arc<H> {
    async fn handle(&self, key: &DedupKey, payload: &Bytes) -> HandlerOutcome {
        (**self).handle(key, payload).await
    }
}

/// Handler that logs each event and succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogHandler;

#[async_trait::async_trait]
impl EventHandler for LogHandler {
    async fn handle(&self, key: &DedupKey, payload: &Bytes) -> HandlerOutcome {
        info!(
            dedup_key = %key,
            payload_size = payload.len(),
            payload = %String::from_utf8_lossy(payload),
            "event received"
        );
        HandlerOutcome::Success
    }
}

/// Handler that runs an external command per event.
///
/// The payload is written to the child's stdin and the key is exported as
/// `HOOKLINE_DEDUP_KEY`. Exit status 0 is success, 75 asks for a retry and
/// anything else is a permanent failure. A command that cannot be spawned is
/// treated as retryable, since the binary may appear later.
///
/// The child is killed if the invocation future is dropped, so the worker's
/// handler timeout also bounds the process.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
}

impl CommandHandler {
    /// Creates a handler running `program` with `args`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }

    /// Parses a whitespace separated command line.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the line is blank.
    pub fn from_command_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| DeliveryError::configuration("handler command is empty"))?;
        Ok(Self::new(program, parts.collect()))
    }

    async fn run(&self, key: &DedupKey, payload: &Bytes) -> std::io::Result<std::process::Output> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(DEDUP_KEY_ENV, key.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Feed stdin while draining stdout and stderr, so a child that writes
        // before it has read everything cannot fill a pipe and stall.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A child that exits without reading stdin closes the pipe;
                // its exit status is what matters.
                if let Err(error) = stdin.write_all(payload).await {
                    debug!(dedup_key = %key, error = %error, "handler closed stdin early");
                }
            }
        };

        let (output, ()) = tokio::join!(child.wait_with_output(), feed);
        output
    }
}

#[async_trait::async_trait]
impl EventHandler for CommandHandler {
    async fn handle(&self, key: &DedupKey, payload: &Bytes) -> HandlerOutcome {
        let output = match self.run(key, payload).await {
            Ok(output) => output,
            Err(error) => {
                warn!(program = %self.program, error = %error, "failed to run handler command");
                return HandlerOutcome::retry(format!("failed to run {}: {error}", self.program));
            },
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.trim();
        match output.status.code() {
            Some(0) => HandlerOutcome::Success,
            Some(EXIT_RETRYABLE) => HandlerOutcome::retry(format!("exit status 75: {detail}")),
            Some(code) => HandlerOutcome::permanent(format!("exit status {code}: {detail}")),
            None => HandlerOutcome::retry(format!("terminated by signal: {detail}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandHandler {
        CommandHandler::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn command_line_is_split_on_whitespace() {
        let handler = CommandHandler::from_command_line("  ./deliver.sh --queue orders ").unwrap();
        assert_eq!(handler.program, "./deliver.sh");
        assert_eq!(handler.args, vec!["--queue", "orders"]);

        assert!(CommandHandler::from_command_line("   ").is_err());
    }

    #[test]
    fn failure_outcomes_map_to_errors() {
        assert!(HandlerOutcome::Success.into_error().is_none());
        assert!(HandlerOutcome::retry("busy").into_error().unwrap().is_retryable());
        assert!(!HandlerOutcome::permanent("bad").into_error().unwrap().is_retryable());
    }

    #[tokio::test]
    async fn log_handler_always_succeeds() {
        let outcome = LogHandler.handle(&DedupKey::new("evt_1"), &Bytes::from_static(b"{}")).await;
        assert_eq!(outcome, HandlerOutcome::Success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_receives_payload_and_key() {
        let handler = sh(r#"[ "$(cat)" = '{"x":1}' ] && [ "$HOOKLINE_DEDUP_KEY" = evt_7 ]"#);

        let payload = Bytes::from_static(b"{\"x\":1}");
        let outcome = handler.handle(&DedupKey::new("evt_7"), &payload).await;

        assert_eq!(outcome, HandlerOutcome::Success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_codes_select_outcome() {
        let key = DedupKey::new("evt");
        let payload = Bytes::new();

        let retry = sh("echo busy >&2; exit 75").handle(&key, &payload).await;
        assert_eq!(retry, HandlerOutcome::retry("exit status 75: busy"));

        let permanent = sh("echo malformed >&2; exit 2").handle(&key, &payload).await;
        assert_eq!(permanent, HandlerOutcome::permanent("exit status 2: malformed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn chatty_command_with_large_payload_does_not_stall() {
        // Writes more than a pipe buffer to stdout before reading stdin.
        let handler = sh("head -c 262144 /dev/zero; cat > /dev/null");
        let payload = Bytes::from(vec![b'x'; 262_144]);

        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            handler.handle(&DedupKey::new("evt_big"), &payload),
        )
        .await
        .expect("handler stalled on full pipes");

        assert_eq!(outcome, HandlerOutcome::Success);
    }

    #[tokio::test]
    async fn missing_program_is_retryable() {
        let handler = CommandHandler::new("/nonexistent/hookline-handler", Vec::new());
        let outcome = handler.handle(&DedupKey::new("evt"), &Bytes::new()).await;
        assert!(matches!(outcome, HandlerOutcome::RetryableFailure(_)));
    }
}
