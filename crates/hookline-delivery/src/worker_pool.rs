//! Worker pool management with structured concurrency.
//!
//! Provides lifecycle management and graceful shutdown for supervised
//! delivery worker tasks.

use std::{sync::Arc, time::Duration};

use hookline_core::{Clock, EventStore};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    engine::EngineStats,
    error::{DeliveryError, Result},
    handler::EventHandler,
    queue::DispatchQueue,
    worker::{ActiveLeases, DeliveryWorker},
};

/// Worker pool that manages delivery worker tasks with supervision.
///
/// All workers share one dispatch queue and one cancellation token; the pool
/// owns their join handles so shutdown can wait for them collectively.
pub struct WorkerPool {
    worker_count: usize,
    queue: DispatchQueue,
    store: Arc<dyn EventStore>,
    handler: Arc<dyn EventHandler>,
    stats: Arc<RwLock<EngineStats>>,
    clock: Arc<dyn Clock>,
    handler_timeout: Duration,
    cancellation_token: CancellationToken,
    active: ActiveLeases,
    worker_handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_count: usize,
        queue: DispatchQueue,
        store: Arc<dyn EventStore>,
        handler: Arc<dyn EventHandler>,
        stats: Arc<RwLock<EngineStats>>,
        clock: Arc<dyn Clock>,
        handler_timeout: Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            worker_count,
            queue,
            store,
            handler,
            stats,
            clock,
            handler_timeout,
            cancellation_token,
            active: ActiveLeases::default(),
            worker_handles: Vec::new(),
        }
    }

    /// Spawn all configured workers and begin processing.
    ///
    /// Workers run until the cancellation token fires. Returns immediately
    /// after spawning.
    pub async fn spawn_workers(&mut self) {
        info!(worker_count = self.worker_count, "spawning delivery workers");

        self.stats.write().await.active_workers = self.worker_count;

        for worker_id in 0..self.worker_count {
            let worker = DeliveryWorker::new(
                worker_id,
                self.queue.clone(),
                self.store.clone(),
                self.handler.clone(),
                self.stats.clone(),
                self.clock.clone(),
                self.handler_timeout,
                self.cancellation_token.clone(),
                self.active.clone(),
            );

            let handle = tokio::spawn(async move {
                info!(worker_id, "delivery worker starting");

                let result = worker.run().await;

                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "delivery worker terminated with error");
                } else {
                    info!(worker_id, "delivery worker stopped gracefully");
                }

                result
            });

            self.worker_handles.push(handle);
        }
    }

    /// Stops claiming new events and waits for in-flight attempts to finish.
    ///
    /// Workers still running when `timeout` elapses are aborted and their
    /// leases released back to `Pending`, so the events are redelivered
    /// promptly instead of waiting for lease expiry.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers had to be aborted, or
    /// `WorkerPanic` if a worker task panicked.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_ms = timeout.as_millis(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let mut handles = std::mem::take(&mut self.worker_handles);
        let joined = tokio::time::timeout(timeout, async {
            let mut first_panic = None;
            for (worker_id, handle) in handles.iter_mut().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker failed during shutdown");
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "worker panicked during shutdown");
                        first_panic.get_or_insert(DeliveryError::WorkerPanic {
                            worker_id,
                            error: join_error.to_string(),
                        });
                    },
                }
            }
            first_panic
        })
        .await;

        let result = match joined {
            Ok(None) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                error!(
                    timeout_ms = timeout.as_millis(),
                    "worker shutdown timed out, aborting in-flight attempts"
                );
                for handle in handles {
                    // Handles that already finished may have been polled to
                    // completion above and must not be awaited again.
                    if !handle.is_finished() {
                        handle.abort();
                        let _ = handle.await;
                    }
                }
                self.release_abandoned().await;
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        };

        let mut stats = self.stats.write().await;
        stats.active_workers = 0;
        stats.in_flight = 0;
        result
    }

    async fn release_abandoned(&self) {
        let abandoned: Vec<_> = self.active.lock().await.drain().map(|(_, lease)| lease).collect();
        for lease in abandoned {
            match self.store.release(&lease).await {
                Ok(_) => info!(dedup_key = %lease.dedup_key(), "released lease of aborted attempt"),
                Err(error) => warn!(
                    dedup_key = %lease.dedup_key(),
                    error = %error,
                    "could not release lease, it will expire"
                ),
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.worker_handles.iter().filter(|h| !h.is_finished()).count();

        if active_count > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                active_workers = active_count,
                "worker pool dropped without shutdown, cancelling workers"
            );
            self.cancellation_token.cancel();
        }
    }
}
