//! Core data model.
//!
//! A job is a unit of deferred scraping work. It has identity, an opaque
//! payload, and a lifecycle state guarded by a monotonic version.

pub mod transition;

pub use transition::Transition;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A search job tracked by the engine.
///
/// The field set is the persisted record layout. Additions must stay
/// backward-compatible with stored records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier. Immutable.
    pub id: JobId,

    /// Current lifecycle state.
    pub state: JobState,

    /// Parameters for the executor. The engine never interprets these.
    pub payload: serde_json::Value,

    /// Executor result. Set only on the transition to Completed.
    pub result: Option<serde_json::Value>,

    /// Terminal cause. Set only on the transition to Failed.
    pub error: Option<String>,

    /// Number of execution attempts; incremented on every claim.
    pub attempts: u32,

    /// Bumped by every successful compare-and-update.
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Identity of the worker holding the current claim.
    pub claimed_by: Option<String>,
}

impl Job {
    /// A freshly submitted job: Pending, version 0, no attempts.
    pub fn new(payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            state: JobState::Pending,
            payload,
            result: None,
            error: None,
            attempts: 0,
            version: 0,
            created_at: now,
            updated_at: now,
            claimed_by: None,
        }
    }

    pub fn view(&self) -> JobView {
        JobView::from(self)
    }
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|e| Error::Other(format!("invalid job id '{s}': {e}")))
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Submitted and waiting for a dispatcher.
    Pending,
    /// Assigned to a worker, waiting for an execution slot.
    Claimed,
    /// Executor running.
    Running,
    /// Done successfully. Terminal.
    Completed,
    /// Retries exhausted. Terminal.
    Failed,
    /// Cancelled before it started running. Terminal.
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Claimed,
        JobState::Running,
        JobState::Completed,
        JobState::Failed,
        JobState::Cancelled,
    ];

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Claimed => "claimed",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| Error::Other(format!("unknown job state: {s}")))
    }
}

// ---------------------------------------------------------------------------
// View
// ---------------------------------------------------------------------------

/// What a polling client sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            state: job.state,
            result: job.result.clone(),
            error: job.error.clone(),
            attempts: job.attempts,
        }
    }
}
