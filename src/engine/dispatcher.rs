//! Dispatcher: turns broker deliveries into claimed jobs on pool slots.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pool::WorkerPool;
use crate::broker::{Broker, Delivery};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::health::HealthStatus;
use crate::model::{JobId, JobState, Transition};
use crate::store::JobStore;
use crate::telemetry::metrics;

/// Why a delivery was acknowledged without doing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotFound,
    NotPending(JobState),
    /// Another dispatcher changed the job between read and claim.
    Conflict,
}

/// What the dispatcher did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Claimed and handed to a pool slot.
    Started(JobId),
    /// Claimed, but no slot freed in time; back to Pending and re-enqueued.
    Released(JobId),
    /// Already at the retry ceiling; forced to Failed.
    Exhausted(JobId),
    Dropped { job_id: JobId, reason: DropReason },
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Started(_) => "started",
            DispatchOutcome::Released(_) => "released",
            DispatchOutcome::Exhausted(_) => "exhausted",
            DispatchOutcome::Dropped { .. } => "dropped",
        }
    }
}

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    pool: Arc<WorkerPool>,
    config: Arc<EngineConfig>,
    health: Option<watch::Receiver<HealthStatus>>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        pool: Arc<WorkerPool>,
        config: Arc<EngineConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            broker,
            pool,
            config,
            health: None,
            shutdown,
        }
    }

    /// Pause dequeuing while `health` reports a degraded backend.
    pub fn with_health(mut self, health: watch::Receiver<HealthStatus>) -> Self {
        self.health = Some(health);
        self
    }

    /// Run until shutdown or until the broker closes.
    pub async fn run(mut self) {
        info!(worker_id = %self.config.worker_id, "dispatcher started");

        loop {
            if !self.wait_until_healthy().await {
                break;
            }

            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = self.broker.dequeue() => next,
            };

            let delivery = match next {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    debug!("broker closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "dequeue failed");
                    self.pause().await;
                    continue;
                }
            };

            match self.dispatch(&delivery).await {
                Ok(outcome) => {
                    metrics::dispatch_outcomes()
                        .add(1, &[KeyValue::new("outcome", outcome.label())]);
                    debug!(job_id = %delivery.job_id, outcome = outcome.label(), "delivery handled");
                }
                Err(e) => {
                    // Unacknowledged: the broker redelivers after the visibility timeout.
                    warn!(job_id = %delivery.job_id, error = %e, "dispatch failed");
                    if e.is_transient() {
                        self.pause().await;
                    }
                }
            }
        }

        info!("dispatcher stopped");
    }

    /// Handle one delivery.
    ///
    /// Returns `Err` only when the store could not be consulted; the
    /// delivery is then left unacknowledged.
    pub async fn dispatch(&self, delivery: &Delivery) -> Result<DispatchOutcome> {
        let job_id = delivery.job_id;

        let job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(Error::NotFound(_)) => {
                return Ok(self.drop_delivery(delivery, DropReason::NotFound).await);
            }
            Err(e) => return Err(e),
        };

        if job.state != JobState::Pending {
            return Ok(self
                .drop_delivery(delivery, DropReason::NotPending(job.state))
                .await);
        }

        let ceiling = self.config.retry_ceiling;
        if job.attempts >= ceiling {
            let exhaust = Transition::Exhaust {
                retry_ceiling: ceiling,
            };
            return match self.store.compare_and_update(job_id, job.version, exhaust).await {
                Ok(_) => {
                    warn!(%job_id, attempts = job.attempts, "retry ceiling reached, job failed");
                    self.ack(delivery).await;
                    Ok(DispatchOutcome::Exhausted(job_id))
                }
                Err(e) if e.is_transient() => Err(e),
                Err(_) => Ok(self.drop_delivery(delivery, DropReason::Conflict).await),
            };
        }

        let claim = Transition::Claim {
            worker_id: self.config.worker_id.clone(),
            retry_ceiling: ceiling,
        };
        let claimed = match self.store.compare_and_update(job_id, job.version, claim).await {
            Ok(claimed) => claimed,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                debug!(%job_id, error = %e, "lost claim race");
                return Ok(self.drop_delivery(delivery, DropReason::Conflict).await);
            }
        };
        debug!(%job_id, attempt = claimed.attempts, delivery_count = delivery.delivery_count, "claimed");
        self.ack(delivery).await;

        let slot = tokio::select! {
            _ = self.shutdown.cancelled() => None,
            slot = self.pool.acquire(self.config.slot_timeout) => slot,
        };

        match slot {
            Some(slot) => {
                self.pool.spawn(claimed, slot);
                Ok(DispatchOutcome::Started(job_id))
            }
            None => {
                self.release(claimed.id, claimed.version).await;
                Ok(DispatchOutcome::Released(job_id))
            }
        }
    }

    /// Hand a claim we cannot serve back to the queue.
    async fn release(&self, job_id: JobId, version: u64) {
        match self
            .store
            .compare_and_update(job_id, version, Transition::Release)
            .await
        {
            Ok(_) => {
                info!(%job_id, "no free slot, claim released");
                if let Err(e) = self.broker.enqueue(job_id).await {
                    warn!(%job_id, error = %e, "re-enqueue after release failed, recovery will resend");
                }
            }
            // Cancelled while we waited.
            Err(Error::VersionConflict { .. }) | Err(Error::IllegalTransition { .. }) => {
                debug!(%job_id, "claim changed while waiting for a slot");
            }
            Err(e) => {
                // Stays Claimed; recovery reclaims it once stale.
                warn!(%job_id, error = %e, "failed to release claim");
            }
        }
    }

    async fn drop_delivery(&self, delivery: &Delivery, reason: DropReason) -> DispatchOutcome {
        debug!(job_id = %delivery.job_id, ?reason, "dropping delivery");
        self.ack(delivery).await;
        DispatchOutcome::Dropped {
            job_id: delivery.job_id,
            reason,
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        // A failed ack only means a harmless redelivery later.
        if let Err(e) = self.broker.ack(delivery).await {
            warn!(job_id = %delivery.job_id, error = %e, "ack failed");
        }
    }

    /// Wait for a healthy status. Returns false if shutdown fired first.
    async fn wait_until_healthy(&mut self) -> bool {
        let Some(health) = self.health.as_mut() else {
            return true;
        };
        loop {
            let status = health.borrow_and_update().clone();
            if status.is_healthy() {
                return true;
            }
            debug!(?status, "dispatcher paused");
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                changed = health.changed() => {
                    if changed.is_err() {
                        // Monitor gone; stop gating on it.
                        return true;
                    }
                }
            }
        }
    }

    async fn pause(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }
}
