//! Test infrastructure for deterministic testing.
//!
//! Provides a [`TestEnv`] backed by a throwaway SQLite file and a manually
//! driven clock, a [`ScriptedHandler`] whose outcomes a test dictates, request
//! signing helpers and store invariant checks.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use hookline_core::{
    AttemptRecord, DeadLetterEntry, DeadLetterSink, DedupKey, EventRecord, EventState, EventStore,
    InsertOutcome, SqliteStore,
};
use hookline_delivery::{DeliveryConfig, DeliveryEngine, DispatchQueue};
use tempfile::TempDir;

pub mod fixtures;
pub mod handler;
pub mod invariants;
pub mod signing;

mod env_core;

pub use env_core::TestEnvBuilder;
pub use fixtures::{TestWebhook, WebhookBuilder};
pub use handler::ScriptedHandler;
pub use hookline_core::{Clock, TestClock};
pub use invariants::assert_store_invariants;
pub use signing::{sign_body, sign_timestamped};

/// Isolated environment for integration tests.
///
/// Each environment owns its own database file, removed on drop, so tests
/// never share state.
pub struct TestEnv {
    /// Deterministic clock shared with the engine.
    pub clock: TestClock,
    /// Handler the engine invokes.
    pub handler: Arc<ScriptedHandler>,
    store: SqliteStore,
    engine: DeliveryEngine,
    config: DeliveryConfig,
    database_url: String,
    dir: TempDir,
}

impl TestEnv {
    /// Creates an environment with default settings.
    pub async fn new() -> Result<Self> {
        TestEnvBuilder::new().build().await
    }

    /// Starts configuring an environment.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// The backing store.
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// The engine under test. Not started unless [`Self::start_engine`] ran.
    pub fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    /// Dispatch queue of the engine.
    pub fn queue(&self) -> DispatchQueue {
        self.engine.queue()
    }

    /// URL of the database file, for opening a second store on it.
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Inserts an event as intake would, stamped with the test clock.
    pub async fn ingest(&self, key: &str, body: impl Into<Bytes>) -> Result<InsertOutcome> {
        let outcome =
            self.store.check_and_insert(&DedupKey::new(key), body.into(), self.clock.now()).await?;
        if matches!(outcome, InsertOutcome::Created(_)) {
            self.engine.queue().notify();
        }
        Ok(outcome)
    }

    /// Processes one due event on the calling task.
    pub async fn process_one(&self) -> Result<bool> {
        Ok(self.engine.process_one().await?)
    }

    /// Processes due events until none is left at the current clock time.
    ///
    /// Returns how many attempts ran.
    pub async fn run_delivery_cycle(&self) -> Result<usize> {
        let mut processed = 0;
        while self.engine.process_one().await? {
            processed += 1;
        }
        Ok(processed)
    }

    /// Moves the test clock forward.
    pub fn advance_time(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Advances past the longest possible retry delay and runs a cycle.
    pub async fn advance_and_deliver(&self) -> Result<usize> {
        self.advance_time(self.config.retry_policy.max_delay);
        self.run_delivery_cycle().await
    }

    /// Record for `key`; fails the test if it does not exist.
    pub async fn record(&self, key: &str) -> Result<EventRecord> {
        self.store.get(&DedupKey::new(key)).await?.with_context(|| format!("no record for {key}"))
    }

    /// Attempt history for `key`.
    pub async fn attempts(&self, key: &str) -> Result<Vec<AttemptRecord>> {
        Ok(self.store.attempts(&DedupKey::new(key)).await?)
    }

    /// Latest dead-letter entry for `key`.
    pub async fn dead_letter(&self, key: &str) -> Result<Option<DeadLetterEntry>> {
        Ok(self.store.dead_letter(&DedupKey::new(key)).await?)
    }

    /// Polls until `key` reaches `state`, for tests running real workers.
    pub async fn wait_for_state(
        &self,
        key: &str,
        state: EventState,
        timeout: Duration,
    ) -> Result<EventRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let record = self.record(key).await?;
            if record.state == state {
                return Ok(record);
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("{key} still {} after {timeout:?}, expected {state}", record.state);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Runs crash recovery and spawns the worker pool.
    pub async fn start_engine(&mut self) -> Result<()> {
        self.engine.start().await?;
        Ok(())
    }

    /// Shuts the engine down, keeping the database for inspection.
    ///
    /// The returned directory must outlive the store.
    pub async fn shutdown(self) -> Result<(SqliteStore, TempDir)> {
        self.engine.shutdown().await?;
        Ok((self.store, self.dir))
    }
}
