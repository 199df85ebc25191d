//! Lifecycle engine. The public API for submitting and managing jobs.
//!
//! An [`Engine`] wires a job store, a broker and an executor together. Any
//! number of engines may share one store and broker; the store's
//! compare-and-update keeps them from stepping on each other.

pub mod dispatcher;
pub mod pool;
pub mod recovery;

pub use dispatcher::{DispatchOutcome, Dispatcher, DropReason};
pub use pool::WorkerPool;
pub use recovery::{RecoveryReport, recover_stale};

use std::sync::Arc;

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::health::HealthMonitor;
use crate::model::{JobId, JobState, JobView};
use crate::status::StatusService;
use crate::store::JobStore;
use crate::telemetry::metrics;

#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    pool: Arc<WorkerPool>,
    status: StatusService,
    config: Arc<EngineConfig>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        executor: Arc<dyn Executor>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            executor,
            Arc::clone(&config),
        ));
        Ok(Self {
            status: StatusService::new(Arc::clone(&store)),
            store,
            broker,
            pool,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Persist a new job and publish it to the broker.
    ///
    /// If the store write succeeds but the enqueue does not, the id is
    /// still returned: the job is durable, and the recovery sweep resends
    /// stale Pending jobs.
    pub async fn submit_job(&self, payload: serde_json::Value) -> Result<JobId> {
        let job = self.store.create(payload).await?;
        let result = match self.broker.enqueue(job.id).await {
            Ok(()) => "ok",
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "enqueue failed, job will be resent by recovery");
                "enqueue_failed"
            }
        };
        metrics::jobs_submitted().add(1, &[KeyValue::new("result", result)]);
        info!(job_id = %job.id, "job submitted");
        Ok(job.id)
    }

    pub async fn get_status(&self, id: JobId) -> Result<JobView> {
        self.status.get_status(id).await
    }

    /// Cancel a Pending or Claimed job.
    ///
    /// A Running job cannot be cancelled through the state machine; if it
    /// runs on this engine its executor is signalled (advisory) and the
    /// call still returns `IllegalTransition`.
    pub async fn cancel_job(&self, id: JobId) -> Result<JobView> {
        let outcome = self.status.cancel_job(id).await;
        if let Err(Error::IllegalTransition {
            from: JobState::Running,
            ..
        }) = outcome
        {
            if self.pool.signal_cancel(id).await {
                info!(job_id = %id, "cancellation signalled to running executor");
            }
        }
        outcome
    }

    /// One crash-recovery sweep against the current time.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        recover_stale(
            self.store.as_ref(),
            self.broker.as_ref(),
            self.config.staleness_threshold,
            self.config.retry_ceiling,
            Utc::now(),
        )
        .await
    }

    /// A dispatcher bound to this engine's pool and shutdown signal.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.broker),
            Arc::clone(&self.pool),
            Arc::clone(&self.config),
            self.shutdown.clone(),
        )
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop dispatching. `run` then drains the pool and returns.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run until shutdown: recover, then dispatch with health gating and
    /// optional periodic recovery, then drain running jobs.
    pub async fn run(&self) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            pool_size = self.config.pool_size,
            "engine starting"
        );
        self.recover().await?;

        let health = HealthMonitor::new(self.config.poll_interval)
            .with_store(Arc::clone(&self.store))
            .with_broker(Arc::clone(&self.broker))
            .spawn(self.shutdown.clone())
            .await;

        if let Some(interval) = self.config.recovery_interval {
            let engine = self.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = engine.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    if let Err(e) = engine.recover().await {
                        error!(error = %e, "recovery sweep failed");
                    }
                }
            });
        }

        self.dispatcher().with_health(health).run().await;
        // The dispatcher also stops when the broker closes; take the health
        // monitor and the recovery loop down with it.
        self.shutdown.cancel();

        info!(grace_ms = self.config.shutdown_grace.as_millis() as u64, "draining worker pool");
        self.pool.drain(self.config.shutdown_grace).await;
        info!("engine stopped");
        Ok(())
    }
}
