//! Dispatch queue and retry scheduler over the event store.
//!
//! The queue holds no state of its own. Due records are found by asking the
//! store, and ownership is the store's lease. What the queue adds is waiting:
//! intake calls [`DispatchQueue::notify`] after creating a record, and idle
//! workers park until either that signal, the next known due time, or the
//! poll interval, whichever comes first.

use std::{sync::Arc, time::Duration};

use hookline_core::{Clock, DedupKey, EventRecord, EventStore, Lease};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{DeliveryError, Result},
    retry::{RetryDecision, RetryPolicy},
};

/// Summary of a startup recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records whose expired lease was returned to `Pending`.
    pub reclaimed: Vec<DedupKey>,
    /// `Failed` records given a new due time.
    pub rescheduled: usize,
    /// `Failed` records that had already used their retry budget.
    pub buried: usize,
}

/// Hands due records to workers, one lease at a time.
#[derive(Clone)]
pub struct DispatchQueue {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    notify: Arc<Notify>,
    lease_timeout: Duration,
    poll_interval: Duration,
    policy: RetryPolicy,
}

impl DispatchQueue {
    /// Creates a queue over `store`.
    pub fn new(
        store: Arc<dyn EventStore>,
        clock: Arc<dyn Clock>,
        lease_timeout: Duration,
        poll_interval: Duration,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            notify: Arc::new(Notify::new()),
            lease_timeout,
            poll_interval,
            policy,
        }
    }

    /// Wakes idle workers so they look for due records now.
    pub fn notify(&self) {
        self.notify.notify_waiters();
    }

    /// Retry policy applied by [`Self::schedule_retry`].
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Claims the earliest due record, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unavailable.
    pub async fn try_next(&self) -> Result<Option<Lease>> {
        let lease = self.store.claim_due(self.clock.now(), self.lease_timeout).await?;
        Ok(lease)
    }

    /// Waits for and claims the next due record.
    ///
    /// Returns `Ok(None)` once `cancel` fires. A lease is never handed out
    /// after cancellation has been observed.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unavailable.
    pub async fn next(&self, cancel: &CancellationToken) -> Result<Option<Lease>> {
        loop {
            // Register interest before looking, so a notify that lands between
            // an empty claim and the select is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(lease) = self.try_next().await? {
                return Ok(Some(lease));
            }

            let wait = self.wait_hint().await?;
            tokio::select! {
                () = cancel.cancelled() => return Ok(None),
                () = &mut notified => {},
                () = tokio::time::sleep(wait) => {},
            }
        }
    }

    /// How long an idle worker may sleep before the next record can be due.
    async fn wait_hint(&self) -> Result<Duration> {
        let Some(due_at) = self.store.next_due_at().await? else {
            return Ok(self.poll_interval);
        };
        let until_due = (due_at - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
        Ok(until_due.min(self.poll_interval))
    }

    /// Moves a `Failed` record back to `Pending` with backoff, or to `Dead`
    /// once its attempts are exhausted.
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects the transition or is unavailable.
    pub async fn schedule_retry(&self, record: &EventRecord) -> Result<RetryDecision> {
        let decision = self.policy.decide(record.attempt_count, self.clock.now());
        match &decision {
            RetryDecision::Retry { next_attempt_at } => {
                self.store.reschedule(&record.dedup_key, *next_attempt_at).await?;
                debug!(
                    dedup_key = %record.dedup_key,
                    attempt_count = record.attempt_count,
                    next_attempt_at = %next_attempt_at,
                    "retry scheduled"
                );
                self.notify();
            },
            RetryDecision::GiveUp { attempts } => {
                self.store.bury(&record.dedup_key, self.clock.now()).await?;
                let exhausted = DeliveryError::RetriesExhausted { attempts: *attempts };
                warn!(
                    dedup_key = %record.dedup_key,
                    error = %exhausted,
                    last_error = record.last_error.as_deref().unwrap_or_default(),
                    "event dead-lettered"
                );
            },
        }
        Ok(decision)
    }

    /// Returns expired leases to `Pending`.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unavailable.
    pub async fn reclaim_expired(&self) -> Result<Vec<DedupKey>> {
        let reclaimed = self.store.reclaim_expired(self.clock.now()).await?;
        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "reclaimed expired leases");
            self.notify();
        }
        Ok(reclaimed)
    }

    /// Gives every `Failed` record its retry decision.
    ///
    /// A record stays `Failed` when the process dies, or the store errors,
    /// between `fail` and [`Self::schedule_retry`]. Records a worker
    /// resolves concurrently are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unavailable.
    pub async fn resume_failed(&self, report: &mut RecoveryReport) -> Result<()> {
        for record in self.store.failed_records().await? {
            match self.schedule_retry(&record).await {
                Ok(RetryDecision::Retry { .. }) => report.rescheduled += 1,
                Ok(RetryDecision::GiveUp { .. }) => report.buried += 1,
                Err(error) if error.is_transition_conflict() => {
                    debug!(dedup_key = %record.dedup_key, "failed record already moved on");
                },
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    /// One pass of the background sweep: expired leases and stranded
    /// `Failed` records go back to the queue.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unavailable.
    pub async fn sweep(&self) -> Result<RecoveryReport> {
        let mut report =
            RecoveryReport { reclaimed: self.reclaim_expired().await?, ..Default::default() };
        self.resume_failed(&mut report).await?;
        if report.rescheduled + report.buried > 0 {
            info!(
                rescheduled = report.rescheduled,
                buried = report.buried,
                "resumed stranded failed records"
            );
        }
        Ok(report)
    }

    /// Brings the store back to a dispatchable state after a restart.
    ///
    /// Expired leases are reclaimed and `Failed` records left behind by a
    /// crash between recording an outcome and scheduling the retry get their
    /// retry decision now.
    ///
    /// # Errors
    ///
    /// Returns error if the store is unavailable.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report =
            RecoveryReport { reclaimed: self.reclaim_expired().await?, ..Default::default() };
        self.resume_failed(&mut report).await?;

        info!(
            reclaimed = report.reclaimed.len(),
            rescheduled = report.rescheduled,
            buried = report.buried,
            "recovery pass complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::Utc;
    use hookline_core::{EventState, MemoryStore, TestClock};

    use super::*;

    const LEASE: Duration = Duration::from_secs(30);

    fn queue(store: &MemoryStore, clock: &TestClock, policy: RetryPolicy) -> DispatchQueue {
        DispatchQueue::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            LEASE,
            Duration::from_millis(20),
            policy,
        )
    }

    fn no_jitter(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.0,
        }
    }

    #[tokio::test]
    async fn next_returns_none_after_cancel() {
        let store = MemoryStore::new();
        let clock = TestClock::new();
        let queue = queue(&store, &clock, no_jitter(3));
        let cancel = CancellationToken::new();
        cancel.cancel();

        store.check_and_insert(&"evt".into(), Bytes::new(), clock.now()).await.unwrap();

        assert!(queue.next(&cancel).await.unwrap().is_none());
        assert_eq!(store.get(&"evt".into()).await.unwrap().unwrap().state, EventState::Pending);
    }

    #[tokio::test]
    async fn notify_wakes_idle_worker() {
        let store = MemoryStore::new();
        let clock = TestClock::new();
        let queue = DispatchQueue::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            LEASE,
            Duration::from_secs(3600),
            no_jitter(3),
        );
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.next(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.check_and_insert(&"evt".into(), Bytes::new(), clock.now()).await.unwrap();
        queue.notify();

        let lease = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("worker should wake on notify")
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(lease.dedup_key().as_str(), "evt");
    }

    #[tokio::test]
    async fn schedule_retry_backs_off_then_buries() {
        let store = MemoryStore::new();
        let clock = TestClock::at(Utc::now());
        let queue = queue(&store, &clock, no_jitter(2));
        let key = DedupKey::new("evt");
        store.check_and_insert(&key, Bytes::new(), clock.now()).await.unwrap();

        let lease = queue.try_next().await.unwrap().unwrap();
        let failed = store.fail(&lease, "timeout", clock.now()).await.unwrap();
        let decision = queue.schedule_retry(&failed).await.unwrap();
        assert_eq!(
            decision,
            RetryDecision::Retry { next_attempt_at: clock.now() + chrono::Duration::seconds(1) }
        );
        assert!(queue.try_next().await.unwrap().is_none());

        clock.advance(Duration::from_secs(1));
        let lease = queue.try_next().await.unwrap().unwrap();
        let failed = store.fail(&lease, "timeout", clock.now()).await.unwrap();
        assert_eq!(queue.schedule_retry(&failed).await.unwrap(), RetryDecision::GiveUp {
            attempts: 2
        });

        let record = store.get(&key).await.unwrap().unwrap();
        assert_eq!(record.state, EventState::Dead);
        assert_eq!(record.attempt_count, 2);
    }

    #[tokio::test]
    async fn recover_reschedules_stranded_failures() {
        let store = MemoryStore::new();
        let clock = TestClock::new();
        let queue = queue(&store, &clock, no_jitter(5));

        store.check_and_insert(&"failed".into(), Bytes::new(), clock.now()).await.unwrap();
        store.check_and_insert(&"leased".into(), Bytes::new(), clock.now()).await.unwrap();
        let first = queue.try_next().await.unwrap().unwrap();
        let second = queue.try_next().await.unwrap().unwrap();
        store.fail(&first, "boom", clock.now()).await.unwrap();

        clock.advance(LEASE);
        let report = queue.recover().await.unwrap();

        assert_eq!(report.reclaimed, vec![second.dedup_key().clone()]);
        assert_eq!(report.rescheduled, 1);
        assert_eq!(report.buried, 0);
        let failed = store.get(first.dedup_key()).await.unwrap().unwrap();
        assert_eq!(failed.state, EventState::Pending);
    }
}
