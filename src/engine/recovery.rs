//! Crash recovery sweep.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::error::{Error, Result};
use crate::model::{JobId, JobState, Transition};
use crate::store::JobStore;
use crate::telemetry::metrics;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Orphaned claims returned to Pending and re-enqueued.
    pub requeued: usize,
    /// Orphaned jobs that had no attempts left.
    pub failed: usize,
    /// Stale Pending jobs whose broker message may have been lost.
    pub resent: usize,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Reset jobs whose worker went silent, and resend stale Pending jobs.
///
/// A Claimed or Running job whose `updated_at` is older than `now -
/// staleness` is reclaimed; if it lands in Pending it is re-enqueued.
/// Jobs that moved on since they were listed are skipped. A stale Pending
/// job is resent at most once per staleness window: after the enqueue its
/// `updated_at` is refreshed through the `resend` transition. Resending a
/// job that is still queued only produces a duplicate delivery.
pub async fn recover_stale(
    store: &dyn JobStore,
    broker: &dyn Broker,
    staleness: Duration,
    retry_ceiling: u32,
    now: DateTime<Utc>,
) -> Result<RecoveryReport> {
    let staleness = TimeDelta::from_std(staleness)
        .map_err(|e| Error::Config(format!("staleness threshold out of range: {e}")))?;
    let cutoff = now - staleness;
    let mut report = RecoveryReport::default();
    let mut requeued = HashSet::new();

    for state in [JobState::Claimed, JobState::Running] {
        for job in store.list_by_state(state).await? {
            if job.updated_at >= cutoff {
                continue;
            }
            let reclaim = Transition::Reclaim { retry_ceiling };
            let next = match store.compare_and_update(job.id, job.version, reclaim).await {
                Ok(next) => next,
                Err(e @ Error::StoreUnavailable(_)) => return Err(e),
                Err(e) => {
                    debug!(job_id = %job.id, error = %e, "job moved on, not reclaimed");
                    continue;
                }
            };
            warn!(
                job_id = %job.id,
                from = %job.state,
                to = %next.state,
                worker = job.claimed_by.as_deref().unwrap_or_default(),
                "reclaimed orphaned job"
            );
            match next.state {
                JobState::Pending => {
                    resend(broker, next.id).await;
                    requeued.insert(next.id);
                    report.requeued += 1;
                    metrics::recovered_jobs().add(1, &[KeyValue::new("action", "requeued")]);
                }
                _ => {
                    report.failed += 1;
                    metrics::recovered_jobs().add(1, &[KeyValue::new("action", "failed")]);
                }
            }
        }
    }

    for job in store.list_by_state(JobState::Pending).await? {
        if job.updated_at >= cutoff || requeued.contains(&job.id) {
            continue;
        }
        if !resend(broker, job.id).await {
            continue;
        }
        // Refresh `updated_at` so the next sweep leaves it alone for a
        // full staleness window.
        match store.compare_and_update(job.id, job.version, Transition::Resend).await {
            Ok(_) => {}
            Err(e @ Error::StoreUnavailable(_)) => return Err(e),
            Err(e) => debug!(job_id = %job.id, error = %e, "job moved on after resend"),
        }
        report.resent += 1;
        metrics::recovered_jobs().add(1, &[KeyValue::new("action", "resent")]);
    }

    if !report.is_empty() {
        info!(
            requeued = report.requeued,
            failed = report.failed,
            resent = report.resent,
            "recovery sweep finished"
        );
    }
    Ok(report)
}

async fn resend(broker: &dyn Broker, id: JobId) -> bool {
    match broker.enqueue(id).await {
        Ok(()) => true,
        Err(e) => {
            // The job stays Pending and stale, so the next sweep tries again.
            warn!(job_id = %id, error = %e, "re-enqueue failed");
            false
        }
    }
}
