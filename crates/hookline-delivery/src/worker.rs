//! Delivery worker: claim, invoke, record.
//!
//! Each worker loops over the dispatch queue. For every lease it runs the
//! handler under a timeout, then reports the outcome to the store with the
//! lease token. The handler runs in its own task so that a panic or a hang
//! costs one attempt, not the worker.

use std::{collections::HashMap, sync::Arc, time::Duration};

use hookline_core::{Clock, EventStore, Lease};
use tokio::sync::{Mutex, RwLock};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{debug, error, info, warn};

use crate::{
    engine::EngineStats,
    error::{DeliveryError, Result},
    handler::{EventHandler, HandlerOutcome},
    queue::DispatchQueue,
    retry::RetryDecision,
};

/// Leases currently held by workers, keyed by worker id.
///
/// The pool releases whatever is left here when shutdown has to abort
/// workers mid-attempt.
pub(crate) type ActiveLeases = Arc<Mutex<HashMap<usize, Lease>>>;

/// How long a worker backs off after the store reports an error.
const STORE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Individual worker that processes leased events.
pub struct DeliveryWorker {
    id: usize,
    queue: DispatchQueue,
    store: Arc<dyn EventStore>,
    handler: Arc<dyn EventHandler>,
    stats: Arc<RwLock<EngineStats>>,
    clock: Arc<dyn Clock>,
    handler_timeout: Duration,
    cancellation_token: CancellationToken,
    active: ActiveLeases,
}

impl DeliveryWorker {
    /// Creates a worker.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        queue: DispatchQueue,
        store: Arc<dyn EventStore>,
        handler: Arc<dyn EventHandler>,
        stats: Arc<RwLock<EngineStats>>,
        clock: Arc<dyn Clock>,
        handler_timeout: Duration,
        cancellation_token: CancellationToken,
        active: ActiveLeases,
    ) -> Self {
        Self {
            id,
            queue,
            store,
            handler,
            stats,
            clock,
            handler_timeout,
            cancellation_token,
            active,
        }
    }

    /// Main worker loop. Claims and processes leases until cancelled.
    ///
    /// Cancellation stops new claims; an attempt already running is finished
    /// and recorded first.
    ///
    /// # Errors
    ///
    /// Never returns an error today; store failures are logged and the loop
    /// backs off.
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.queue.next(&self.cancellation_token).await {
                Ok(Some(lease)) => {
                    if let Err(error) = self.process_lease(lease).await {
                        error!(worker_id = self.id, error = %error, "failed to record outcome");
                    }
                },
                Ok(None) => {
                    info!(worker_id = self.id, "delivery worker received shutdown signal");
                    break;
                },
                Err(error) => {
                    error!(worker_id = self.id, error = %error, "failed to claim event");
                    tokio::select! {
                        () = tokio::time::sleep(STORE_ERROR_BACKOFF) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        Ok(())
    }

    /// Claims and processes at most one due record.
    ///
    /// Returns whether a record was processed.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    pub async fn process_one(&self) -> Result<bool> {
        match self.queue.try_next().await? {
            Some(lease) => {
                self.process_lease(lease).await?;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    /// Runs the handler for one lease and records the outcome.
    ///
    /// A transition rejected by the store means the lease was lost while the
    /// handler ran (it expired and someone else took the record). That is
    /// logged and swallowed; the other holder owns the outcome now.
    async fn process_lease(&self, lease: Lease) -> Result<()> {
        self.active.lock().await.insert(self.id, lease.clone());
        self.stats.write().await.in_flight += 1;

        debug!(
            worker_id = self.id,
            dedup_key = %lease.dedup_key(),
            attempt = lease.attempt_number(),
            "processing event"
        );

        let outcome = self.invoke_handler(&lease).await;
        let result = match self.record_outcome(&lease, outcome).await {
            Err(error) if error.is_transition_conflict() => {
                warn!(
                    worker_id = self.id,
                    dedup_key = %lease.dedup_key(),
                    attempt = lease.attempt_number(),
                    error = %error,
                    "lease lost before outcome was recorded"
                );
                self.stats.write().await.transition_conflicts += 1;
                Ok(())
            },
            other => other,
        };

        self.active.lock().await.remove(&self.id);
        {
            let mut stats = self.stats.write().await;
            stats.in_flight = stats.in_flight.saturating_sub(1);
            stats.events_processed += 1;
        }

        result
    }

    async fn invoke_handler(&self, lease: &Lease) -> HandlerOutcome {
        let handler = Arc::clone(&self.handler);
        let key = lease.dedup_key().clone();
        let payload = lease.record.payload.clone();
        let mut task =
            AbortOnDropHandle::new(tokio::spawn(async move {
                handler.handle(&key, &payload).await
            }));

        match tokio::time::timeout(self.handler_timeout, &mut task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => {
                error!(
                    worker_id = self.id,
                    dedup_key = %lease.dedup_key(),
                    error = %join_error,
                    "handler task failed"
                );
                HandlerOutcome::retry(format!("handler panicked: {join_error}"))
            },
            Err(_elapsed) => {
                task.abort();
                let error = DeliveryError::HandlerTimeout { timeout: self.handler_timeout };
                HandlerOutcome::retry(error.to_string())
            },
        }
    }

    async fn record_outcome(&self, lease: &Lease, outcome: HandlerOutcome) -> Result<()> {
        let key = lease.dedup_key();
        let attempt = lease.attempt_number();

        let Some(failure) = outcome.into_error() else {
            self.store.complete(lease, self.clock.now()).await?;
            self.stats.write().await.delivered += 1;
            info!(worker_id = self.id, dedup_key = %key, attempt, "event delivered");
            return Ok(());
        };

        let reason = failure.attempt_error();
        if !failure.is_retryable() {
            self.store.kill(lease, &reason, self.clock.now()).await?;
            self.stats.write().await.dead_lettered += 1;
            warn!(
                worker_id = self.id,
                dedup_key = %key,
                attempt,
                error = %failure,
                "handler rejected event, dead-lettered"
            );
            return Ok(());
        }

        let record = self.store.fail(lease, &reason, self.clock.now()).await?;
        warn!(
            worker_id = self.id,
            dedup_key = %key,
            attempt,
            error = %failure,
            "handler failed, scheduling retry"
        );
        match self.queue.schedule_retry(&record).await {
            Ok(RetryDecision::Retry { .. }) => self.stats.write().await.retried += 1,
            Ok(RetryDecision::GiveUp { .. }) => self.stats.write().await.dead_lettered += 1,
            // The sweeper got to the failed record first; it counts the decision.
            Err(error) if error.is_transition_conflict() => {
                debug!(worker_id = self.id, dedup_key = %key, "retry already scheduled by sweep");
            },
            Err(error) => return Err(error),
        }

        Ok(())
    }
}
