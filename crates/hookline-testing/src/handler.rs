//! Handler whose outcomes are scripted by the test.

use std::{collections::VecDeque, time::Duration};

use bytes::Bytes;
use hookline_core::DedupKey;
use hookline_delivery::{EventHandler, HandlerOutcome};
use tokio::sync::Mutex;

/// Handler that replays a queue of outcomes, then falls back to a fixed one.
///
/// Every invocation is logged so tests can assert how often, and for which
/// keys, the engine called it.
#[derive(Debug)]
pub struct ScriptedHandler {
    script: Mutex<VecDeque<HandlerOutcome>>,
    fallback: HandlerOutcome,
    delay: Option<Duration>,
    calls: Mutex<Vec<(DedupKey, Bytes)>>,
}

impl Default for ScriptedHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedHandler {
    /// A handler that always succeeds.
    pub fn new() -> Self {
        Self::with_fallback(HandlerOutcome::Success)
    }

    /// A handler that returns `fallback` once the script runs out.
    pub fn with_fallback(fallback: HandlerOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fails retryably `failures` times, then succeeds.
    pub fn failing_then_succeeding(failures: usize, reason: &str) -> Self {
        let mut handler = Self::new();
        handler.script = Mutex::new(
            std::iter::repeat_with(|| HandlerOutcome::retry(reason)).take(failures).collect(),
        );
        handler
    }

    /// Always fails retryably.
    pub fn always_failing(reason: &str) -> Self {
        Self::with_fallback(HandlerOutcome::retry(reason))
    }

    /// Always rejects permanently.
    pub fn rejecting(reason: &str) -> Self {
        Self::with_fallback(HandlerOutcome::permanent(reason))
    }

    /// Appends `outcome` to the script.
    #[must_use]
    pub fn then(mut self, outcome: HandlerOutcome) -> Self {
        self.script.get_mut().push_back(outcome);
        self
    }

    /// Sleeps for `delay` before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of invocations so far.
    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    /// Number of invocations for `key`.
    pub async fn calls_for(&self, key: &str) -> usize {
        self.calls.lock().await.iter().filter(|(k, _)| k.as_str() == key).count()
    }

    /// Payloads received, in invocation order.
    pub async fn payloads(&self) -> Vec<Bytes> {
        self.calls.lock().await.iter().map(|(_, payload)| payload.clone()).collect()
    }
}

#[async_trait::async_trait]
impl EventHandler for ScriptedHandler {
    async fn handle(&self, key: &DedupKey, payload: &Bytes) -> HandlerOutcome {
        self.calls.lock().await.push((key.clone(), payload.clone()));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.script.lock().await.pop_front().unwrap_or_else(|| self.fallback.clone())
    }
}
