//! Job state machine.
//!
//! Transitions are plain data. Every store backend applies them through
//! [`Transition::apply`], so the transition table lives in exactly one place:
//!
//! | From            | Event   | To                                   |
//! |-----------------|---------|--------------------------------------|
//! | Pending         | claim   | Claimed (attempts < ceiling)         |
//! | Claimed         | start   | Running (same worker)                |
//! | Running         | succeed | Completed                            |
//! | Running         | fail    | Failed at the ceiling (or when not   |
//! |                 |         | retryable), else Pending             |
//! | Pending/Claimed | cancel  | Cancelled                            |
//! | Claimed         | release | Pending, attempt refunded            |
//! | Pending         | exhaust | Failed (attempts >= ceiling)         |
//! | Claimed         | reclaim | Pending, attempt refunded            |
//! | Running         | reclaim | Failed at the ceiling, else Pending  |
//! | Pending         | resend  | Pending, `updated_at` refreshed      |

use chrono::{DateTime, Utc};

use super::{Job, JobState};
use crate::error::{Error, Result};

/// An event applied to a job through compare-and-update.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Assign the job to a worker.
    Claim {
        worker_id: String,
        retry_ceiling: u32,
    },
    /// The claiming worker begins execution.
    Start { worker_id: String },
    /// Executor returned a result.
    Succeed { result: serde_json::Value },
    /// Executor failed or timed out. A non-retryable failure is terminal
    /// regardless of the attempts left.
    Fail {
        error: String,
        retry_ceiling: u32,
        retryable: bool,
    },
    /// External cancel request.
    Cancel,
    /// The dispatcher could not get a slot in time.
    Release,
    /// A pending job already used every attempt.
    Exhaust { retry_ceiling: u32 },
    /// The claiming worker went silent past the staleness threshold.
    Reclaim { retry_ceiling: u32 },
    /// Recovery re-published a stale Pending job to the broker.
    Resend,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Claim { .. } => "claim",
            Transition::Start { .. } => "start",
            Transition::Succeed { .. } => "succeed",
            Transition::Fail { .. } => "fail",
            Transition::Cancel => "cancel",
            Transition::Release => "release",
            Transition::Exhaust { .. } => "exhaust",
            Transition::Reclaim { .. } => "reclaim",
            Transition::Resend => "resend",
        }
    }

    /// Compute the job that results from applying this transition at `now`.
    ///
    /// Pure: the input is untouched. On success the returned job has its
    /// version bumped and `updated_at` set. A rejected transition is an
    /// [`Error::IllegalTransition`] and leaves nothing to persist.
    pub fn apply(&self, job: &Job, now: DateTime<Utc>) -> Result<Job> {
        let illegal = || Error::IllegalTransition {
            id: job.id,
            from: job.state,
            event: self.name(),
        };

        if job.state.is_terminal() {
            return Err(illegal());
        }

        let mut next = job.clone();
        match (self, job.state) {
            (
                Transition::Claim {
                    worker_id,
                    retry_ceiling,
                },
                JobState::Pending,
            ) => {
                if job.attempts >= *retry_ceiling {
                    return Err(illegal());
                }
                next.state = JobState::Claimed;
                next.attempts += 1;
                next.claimed_by = Some(worker_id.clone());
            }
            (Transition::Start { worker_id }, JobState::Claimed) => {
                if job.claimed_by.as_deref() != Some(worker_id.as_str()) {
                    return Err(illegal());
                }
                next.state = JobState::Running;
            }
            (Transition::Succeed { result }, JobState::Running) => {
                next.state = JobState::Completed;
                next.result = Some(result.clone());
            }
            (
                Transition::Fail {
                    error,
                    retry_ceiling,
                    retryable,
                },
                JobState::Running,
            ) => {
                if !retryable || job.attempts >= *retry_ceiling {
                    next.state = JobState::Failed;
                    next.error = Some(error.clone());
                } else {
                    next.state = JobState::Pending;
                    next.claimed_by = None;
                }
            }
            (Transition::Cancel, JobState::Pending | JobState::Claimed) => {
                next.state = JobState::Cancelled;
            }
            (Transition::Release, JobState::Claimed)
            | (Transition::Reclaim { .. }, JobState::Claimed) => {
                // The claim never reached the executor.
                next.state = JobState::Pending;
                next.attempts = job.attempts.saturating_sub(1);
                next.claimed_by = None;
            }
            (Transition::Exhaust { retry_ceiling }, JobState::Pending) => {
                if job.attempts < *retry_ceiling {
                    return Err(illegal());
                }
                next.state = JobState::Failed;
                next.error = Some(format!(
                    "retry ceiling reached after {} of {retry_ceiling} attempts",
                    job.attempts
                ));
            }
            (Transition::Reclaim { retry_ceiling }, JobState::Running) => {
                if job.attempts >= *retry_ceiling {
                    next.state = JobState::Failed;
                    next.error = Some(format!(
                        "worker {} lost during attempt {} of {retry_ceiling}",
                        job.claimed_by.as_deref().unwrap_or("unknown"),
                        job.attempts
                    ));
                } else {
                    next.state = JobState::Pending;
                    next.claimed_by = None;
                }
            }
            (Transition::Resend, JobState::Pending) => {}
            _ => return Err(illegal()),
        }

        next.version = job.version + 1;
        next.updated_at = now;
        Ok(next)
    }
}
