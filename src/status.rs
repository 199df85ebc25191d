//! Read-side queries and external cancellation.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{JobId, JobView, Transition};
use crate::store::JobStore;
use crate::telemetry::job::record_state_transition;

#[derive(Clone)]
pub struct StatusService {
    store: Arc<dyn JobStore>,
}

impl StatusService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn get_status(&self, id: JobId) -> Result<JobView> {
        Ok(self.store.get(id).await?.view())
    }

    /// Cancel a Pending or Claimed job.
    ///
    /// Retries on version conflicts so a concurrent claim cannot make the
    /// request fail spuriously. A Running or terminal job yields
    /// `IllegalTransition`.
    pub async fn cancel_job(&self, id: JobId) -> Result<JobView> {
        loop {
            let job = self.store.get(id).await?;
            match self
                .store
                .compare_and_update(id, job.version, Transition::Cancel)
                .await
            {
                Ok(cancelled) => {
                    record_state_transition(
                        &tracing::Span::current(),
                        "cancel",
                        job.state,
                        cancelled.state,
                    );
                    info!(job_id = %id, from = %job.state, "job cancelled");
                    return Ok(cancelled.view());
                }
                Err(Error::VersionConflict { .. }) => {
                    debug!(job_id = %id, "job changed under cancel, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}
