//! Worker pool: a fixed number of execution slots.
//!
//! A slot is a semaphore permit. The dispatcher acquires one (this is where
//! backpressure happens) and hands the claimed job to [`WorkerPool::spawn`];
//! the permit is released when the attempt has been recorded.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::broker::Broker;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::model::{Job, JobId, JobState, Transition};
use crate::store::JobStore;
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;

/// A held execution slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

/// Bookkeeping for one job executing in this pool.
struct RunningJob {
    token: CancellationToken,
    /// Set by an external cancel request, as opposed to shutdown.
    cancel_requested: Arc<AtomicBool>,
}

pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    executor: Arc<dyn Executor>,
    config: Arc<EngineConfig>,
    permits: Arc<Semaphore>,
    running: RwLock<HashMap<JobId, RunningJob>>,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        executor: Arc<dyn Executor>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.pool_size)),
            store,
            broker,
            executor,
            config,
            running: RwLock::new(HashMap::new()),
            tracker: TaskTracker::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.pool_size
    }

    /// Slots not currently held.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait up to `wait` for a free slot.
    pub async fn acquire(&self, wait: Duration) -> Option<Slot> {
        match tokio::time::timeout(wait, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => Some(Slot { _permit: permit }),
            Ok(Err(_closed)) => None,
            Err(_elapsed) => None,
        }
    }

    /// Run one attempt of a Claimed job on a background task.
    pub fn spawn(self: &Arc<Self>, job: Job, slot: Slot) {
        let pool = Arc::clone(self);
        let span = start_job_span(&job);
        self.tracker
            .spawn(async move { pool.run_job(job, slot).await }.instrument(span));
    }

    /// Jobs executing right now on this instance.
    pub async fn running_jobs(&self) -> Vec<JobId> {
        self.running.read().await.keys().copied().collect()
    }

    /// Ask the executor of a running job to stop. Advisory: the executor
    /// decides whether to honour it. Returns false if the job is not
    /// running here.
    pub async fn signal_cancel(&self, id: JobId) -> bool {
        let running = self.running.read().await;
        let Some(job) = running.get(&id) else {
            return false;
        };
        job.cancel_requested.store(true, Ordering::SeqCst);
        job.token.cancel();
        true
    }

    /// Stop accepting work and wait for running attempts.
    ///
    /// After `grace`, every remaining executor is signalled to cancel; their
    /// attempts are then recorded as ordinary (retryable) failures.
    pub async fn drain(&self, grace: Duration) {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            return;
        }

        let running = self.running.read().await;
        info!(count = running.len(), "grace period over, cancelling running jobs");
        for job in running.values() {
            job.token.cancel();
        }
        drop(running);

        self.tracker.wait().await;
    }

    async fn run_job(&self, job: Job, slot: Slot) {
        let _slot = slot;
        let span = Span::current();

        let start = Transition::Start {
            worker_id: self.config.worker_id.clone(),
        };
        let running = match self.update_with_retry(job.id, job.version, start).await {
            Ok(running) => running,
            Err(e) => {
                // Cancelled while waiting for the slot, or reclaimed.
                debug!(job_id = %job.id, error = %e, "job not started");
                return;
            }
        };
        record_state_transition(&span, "start", job.state, running.state);

        let token = CancellationToken::new();
        let cancel_requested = Arc::new(AtomicBool::new(false));
        self.running.write().await.insert(
            job.id,
            RunningJob {
                token: token.clone(),
                cancel_requested: Arc::clone(&cancel_requested),
            },
        );

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.job_timeout,
            self.executor.execute(&running.payload, token.clone()),
        )
        .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.running.write().await.remove(&job.id);
        // An executor that outlived its deadline may still be watching.
        token.cancel();

        let retry_ceiling = self.config.retry_ceiling;
        let (transition, label) = match outcome {
            Ok(Ok(result)) => (Transition::Succeed { result }, "succeeded"),
            Ok(Err(e)) => {
                let err = Error::ExecutorFailure(format!("{e:#}"));
                let cancelled = cancel_requested.load(Ordering::SeqCst);
                warn!(job_id = %job.id, attempt = running.attempts, error = %err, cancelled, "attempt failed");
                let error = if cancelled {
                    format!("cancelled while running: {err}")
                } else {
                    err.to_string()
                };
                (
                    Transition::Fail {
                        error,
                        retry_ceiling,
                        retryable: !cancelled,
                    },
                    "failed",
                )
            }
            Err(_elapsed) => {
                let err = Error::Timeout(self.config.job_timeout);
                warn!(job_id = %job.id, attempt = running.attempts, error = %err, "attempt timed out");
                (
                    Transition::Fail {
                        error: err.to_string(),
                        retry_ceiling,
                        retryable: true,
                    },
                    "timeout",
                )
            }
        };
        metrics::execution_duration_ms().record(elapsed_ms, &[KeyValue::new("outcome", label)]);

        let event = transition.name();
        let finished = match self
            .update_with_retry(running.id, running.version, transition)
            .await
        {
            Ok(finished) => finished,
            Err(Error::VersionConflict { .. }) => {
                warn!(job_id = %job.id, "job was reclaimed while running, outcome discarded");
                return;
            }
            Err(e) => {
                // The job stays Running; recovery resets it once stale.
                error!(job_id = %job.id, error = %e, "failed to record attempt outcome");
                return;
            }
        };
        record_state_transition(&span, event, running.state, finished.state);

        match finished.state {
            JobState::Pending => {
                if let Err(e) = self.broker.enqueue(finished.id).await {
                    warn!(job_id = %finished.id, error = %e, "re-enqueue failed, recovery will resend");
                }
            }
            JobState::Completed => {
                info!(job_id = %finished.id, attempts = finished.attempts, elapsed_ms, "job completed")
            }
            JobState::Failed => {
                info!(job_id = %finished.id, attempts = finished.attempts, "job failed permanently")
            }
            _ => {}
        }
    }

    /// Compare-and-update, retrying while the store is unreachable.
    async fn update_with_retry(
        &self,
        id: JobId,
        expected_version: u64,
        transition: Transition,
    ) -> Result<Job> {
        let mut retries = 0;
        loop {
            match self
                .store
                .compare_and_update(id, expected_version, transition.clone())
                .await
            {
                Err(e) if e.is_transient() && retries < self.config.store_retry_attempts => {
                    retries += 1;
                    warn!(job_id = %id, retries, error = %e, "store write failed, retrying");
                    tokio::time::sleep(self.config.store_retry_backoff).await;
                }
                other => return other,
            }
        }
    }
}
