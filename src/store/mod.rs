//! Job Store contract.
//!
//! The store is the single source of truth for job state. The only way to
//! mutate a job after creation is [`JobStore::compare_and_update`], which
//! applies a [`Transition`] iff the stored version still matches.

pub mod memory;

pub use memory::MemoryJobStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Job, JobId, JobState, Transition};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new Pending job at version 0.
    async fn create(&self, payload: serde_json::Value) -> Result<Job>;

    async fn get(&self, id: JobId) -> Result<Job>;

    /// Apply `transition` atomically if the stored version equals
    /// `expected_version`. Returns the updated job.
    ///
    /// Fails with `NotFound`, `VersionConflict`, or `IllegalTransition`;
    /// nothing is written in any of those cases.
    async fn compare_and_update(
        &self,
        id: JobId,
        expected_version: u64,
        transition: Transition,
    ) -> Result<Job>;

    /// All jobs currently in `state`, oldest update first.
    async fn list_by_state(&self, state: JobState) -> Result<Vec<Job>>;

    async fn health_check(&self) -> Result<()>;
}
