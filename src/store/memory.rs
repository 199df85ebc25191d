//! Process-local job store.
//!
//! Backs tests and single-process embedding. The compare-and-update runs
//! under one mutex, which gives the same atomicity the Postgres store gets
//! from its conditional `UPDATE`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use super::JobStore;
use crate::error::{Error, Result};
use crate::model::{Job, JobId, JobState, Transition};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    unavailable: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backing store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Overwrite a stored record as-is, bypassing the state machine.
    ///
    /// Only for tests that need to age a job past the staleness threshold
    /// or fabricate a crashed worker's leftovers.
    #[doc(hidden)]
    pub fn put_raw(&self, job: Job) {
        self.lock().insert(job.id, job);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, payload: serde_json::Value) -> Result<Job> {
        self.ensure_available()?;
        let job = Job::new(payload);
        self.lock().insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        self.ensure_available()?;
        self.lock().get(&id).cloned().ok_or(Error::NotFound(id))
    }

    async fn compare_and_update(
        &self,
        id: JobId,
        expected_version: u64,
        transition: Transition,
    ) -> Result<Job> {
        self.ensure_available()?;
        let mut jobs = self.lock();
        let current = jobs.get(&id).ok_or(Error::NotFound(id))?;
        if current.version != expected_version {
            return Err(Error::VersionConflict {
                id,
                expected: expected_version,
            });
        }
        let next = transition.apply(current, Utc::now())?;
        jobs.insert(id, next.clone());
        Ok(next)
    }

    async fn list_by_state(&self, state: JobState) -> Result<Vec<Job>> {
        self.ensure_available()?;
        let mut matching: Vec<Job> = self
            .lock()
            .values()
            .filter(|job| job.state == state)
            .cloned()
            .collect();
        matching.sort_by_key(|job| job.updated_at);
        Ok(matching)
    }

    async fn health_check(&self) -> Result<()> {
        self.ensure_available()
    }
}
