//! Builder for [`TestEnv`].

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookline_core::{Clock, EventStore, SqliteStore};
use hookline_delivery::{DeliveryConfig, DeliveryEngine, EventHandler, RetryPolicy};

use crate::{ScriptedHandler, TestClock, TestEnv};

/// Builder for configuring a [`TestEnv`].
pub struct TestEnvBuilder {
    worker_count: usize,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    handler_timeout: Duration,
    lease_timeout: Duration,
    poll_interval: Duration,
    shutdown_timeout: Duration,
    handler: ScriptedHandler,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self {
            worker_count: 1, // Single worker for determinism
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            handler_timeout: Duration::from_secs(1),
            lease_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(5),
            handler: ScriptedHandler::new(),
        }
    }
}

impl TestEnvBuilder {
    /// Creates a builder with defaults tuned for fast tests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of delivery workers (default: 1).
    #[must_use]
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Sets the retry budget (default: 3).
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the first retry delay (default: 1s).
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the handler timeout (default: 1s).
    #[must_use]
    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Sets the lease timeout (default: 5s).
    #[must_use]
    pub fn lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    /// Sets the shutdown timeout (default: 5s).
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Uses `handler` instead of an always-succeeding one.
    #[must_use]
    pub fn handler(mut self, handler: ScriptedHandler) -> Self {
        self.handler = handler;
        self
    }

    /// Builds the environment. The engine is created but not started.
    pub async fn build(self) -> Result<TestEnv> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
            )
            .with_test_writer()
            .try_init();

        let dir = tempfile::tempdir().context("failed to create temp dir")?;
        let url = format!("sqlite://{}", dir.path().join("hookline.db").display());
        let store = SqliteStore::connect(&url, 4).await.context("failed to open test database")?;

        let clock = TestClock::new();
        let handler = Arc::new(self.handler);
        let config = DeliveryConfig {
            worker_count: self.worker_count,
            poll_interval: self.poll_interval,
            lease_timeout: self.lease_timeout,
            handler_timeout: self.handler_timeout,
            sweep_interval: Duration::from_millis(50),
            shutdown_timeout: self.shutdown_timeout,
            retry_policy: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: self.base_delay,
                max_delay: self.max_delay,
                // Zero jitter for deterministic tests
                jitter_factor: 0.0,
            },
        };

        let engine = DeliveryEngine::new(
            Arc::new(store.clone()) as Arc<dyn EventStore>,
            handler.clone() as Arc<dyn EventHandler>,
            config.clone(),
            Arc::new(clock.clone()) as Arc<dyn Clock>,
        )?;

        Ok(TestEnv { clock, handler, store, engine, config, database_url: url, dir })
    }
}
