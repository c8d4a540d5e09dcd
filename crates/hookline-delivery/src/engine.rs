//! Delivery engine: dispatch queue, worker pool and store sweeper.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐ notify ┌───────────────┐ lease ┌─────────────┐
//! │   Intake   │───────▶│ DispatchQueue │──────▶│ WorkerPool  │
//! └────────────┘        └───────────────┘       └─────────────┘
//!       │                      │                     │
//!       ▼                      ▼                     ▼
//! ┌──────────────────────────────────────┐    ┌─────────────┐
//! │ EventStore (leases, state, history)  │◀───│ EventHandler│
//! └──────────────────────────────────────┘    └─────────────┘
//! ```
//!
//! Intake writes records and pokes the queue. Workers take leases from the
//! queue, run the handler and write the outcome back with the lease token.
//! A sweeper periodically returns expired leases to `Pending`, so a crashed
//! or wedged worker delays an event by at most one lease timeout. The same
//! pass schedules `Failed` records whose retry decision was never written.

use std::{sync::Arc, time::Duration};

use hookline_core::{Clock, EventStore};
use serde::Serialize;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    error::{DeliveryError, Result},
    handler::EventHandler,
    queue::{DispatchQueue, RecoveryReport},
    retry::RetryPolicy,
    worker::{ActiveLeases, DeliveryWorker},
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Longest an idle worker sleeps before looking for due records again.
    pub poll_interval: Duration,

    /// How long a claim stays exclusive. Must exceed `handler_timeout`.
    pub lease_timeout: Duration,

    /// Upper bound on one handler invocation.
    pub handler_timeout: Duration,

    /// How often expired leases and stranded `Failed` records are swept
    /// back into the queue.
    pub sweep_interval: Duration,

    /// Maximum time to wait for in-flight attempts on shutdown.
    pub shutdown_timeout: Duration,

    /// Backoff and retry budget for failed attempts.
    pub retry_policy: RetryPolicy,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            poll_interval: Duration::from_secs(1),
            lease_timeout: Duration::from_secs(60),
            handler_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl DeliveryConfig {
    /// Checks the invariants the engine relies on.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }
        if self.retry_policy.max_attempts == 0 {
            return Err(DeliveryError::configuration("max_attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry_policy.jitter_factor) {
            return Err(DeliveryError::configuration("jitter_factor must be between 0 and 1"));
        }
        if self.lease_timeout <= self.handler_timeout {
            return Err(DeliveryError::configuration(
                "lease_timeout must be greater than handler_timeout",
            ));
        }
        if self.poll_interval.is_zero() || self.sweep_interval.is_zero() {
            return Err(DeliveryError::configuration("poll and sweep intervals must be non-zero"));
        }
        Ok(())
    }
}

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Number of active delivery workers.
    pub active_workers: usize,
    /// Attempts finished since startup, whatever their outcome.
    pub events_processed: u64,
    /// Attempts that ended in `Delivered`.
    pub delivered: u64,
    /// Failed attempts that were rescheduled.
    pub retried: u64,
    /// Events moved to the dead-letter sink.
    pub dead_lettered: u64,
    /// Attempts currently running.
    pub in_flight: u64,
    /// Outcomes dropped because the lease had been lost.
    pub transition_conflicts: u64,
}

/// Main delivery engine coordinating delivery workers.
pub struct DeliveryEngine {
    store: Arc<dyn EventStore>,
    handler: Arc<dyn EventHandler>,
    config: DeliveryConfig,
    queue: DispatchQueue,
    stats: Arc<RwLock<EngineStats>>,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    sweeper: Option<JoinHandle<()>>,
}

impl DeliveryEngine {
    /// Creates an engine over `store` that feeds events to `handler`.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn new(
        store: Arc<dyn EventStore>,
        handler: Arc<dyn EventHandler>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let queue = DispatchQueue::new(
            store.clone(),
            clock.clone(),
            config.lease_timeout,
            config.poll_interval,
            config.retry_policy.clone(),
        );

        Ok(Self {
            store,
            handler,
            config,
            queue,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            clock,
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            sweeper: None,
        })
    }

    /// Handle to the dispatch queue, for intake to notify.
    pub fn queue(&self) -> DispatchQueue {
        self.queue.clone()
    }

    /// Runs crash recovery, then spawns workers and the store sweeper.
    ///
    /// Returns immediately after spawning. Use `shutdown()` to stop
    /// gracefully; dropping the engine cancels workers without waiting.
    ///
    /// # Errors
    ///
    /// Returns error if the recovery pass cannot reach the store.
    pub async fn start(&mut self) -> Result<RecoveryReport> {
        info!(
            worker_count = self.config.worker_count,
            max_attempts = self.config.retry_policy.max_attempts,
            lease_timeout_ms = self.config.lease_timeout.as_millis(),
            "starting delivery engine"
        );

        let report = self.queue.recover().await?;

        let mut worker_pool = WorkerPool::new(
            self.config.worker_count,
            self.queue.clone(),
            self.store.clone(),
            self.handler.clone(),
            self.stats.clone(),
            self.clock.clone(),
            self.config.handler_timeout,
            self.cancellation_token.clone(),
        );
        worker_pool.spawn_workers().await;
        self.worker_pool = Some(worker_pool);
        self.sweeper = Some(self.spawn_sweeper());

        info!("delivery engine started");
        Ok(report)
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let stats = self.stats.clone();
        let cancel = self.cancellation_token.clone();
        let interval = self.config.sweep_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {
                        match queue.sweep().await {
                            Ok(report) => {
                                let mut stats = stats.write().await;
                                stats.retried += report.rescheduled as u64;
                                stats.dead_lettered += report.buried as u64;
                            },
                            Err(error) => error!(error = %error, "store sweep failed"),
                        }
                    }
                }
            }
            debug!("store sweeper stopped");
        })
    }

    /// Stops claiming and waits for in-flight attempts, up to the configured
    /// shutdown timeout.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if attempts had to be aborted.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");
        self.cancellation_token.cancel();

        let result = match self.worker_pool.take() {
            Some(worker_pool) => worker_pool.shutdown_graceful(self.config.shutdown_timeout).await,
            None => {
                info!("delivery engine was not started, shutdown completed immediately");
                Ok(())
            },
        };

        if let Some(sweeper) = self.sweeper.take() {
            let _ = sweeper.await;
        }
        result
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Claims and processes at most one due record on the calling task.
    ///
    /// For tests and controlled draining; does not need `start()`.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    pub async fn process_one(&self) -> Result<bool> {
        let worker = DeliveryWorker::new(
            0,
            self.queue.clone(),
            self.store.clone(),
            self.handler.clone(),
            self.stats.clone(),
            self.clock.clone(),
            self.config.handler_timeout,
            self.cancellation_token.clone(),
            ActiveLeases::default(),
        );
        worker.process_one().await
    }
}

impl Drop for DeliveryEngine {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}
