//! Shared fixtures for engine-level tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use searchq::config::EngineConfig;
use searchq::engine::Engine;
use searchq::executor::Executor;
use searchq::model::{JobId, JobState, JobView};
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Settings small enough for tests to run in well under a second.
pub fn config(worker_id: &str) -> EngineConfig {
    EngineConfig {
        worker_id: worker_id.to_string(),
        retry_ceiling: 3,
        pool_size: 2,
        staleness_threshold: Duration::from_secs(30),
        job_timeout: Duration::from_secs(5),
        visibility_timeout: Duration::from_secs(5),
        slot_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(20),
        store_retry_attempts: 5,
        store_retry_backoff: Duration::from_millis(20),
        shutdown_grace: Duration::from_secs(1),
        recovery_interval: None,
    }
}

/// What the executor does on one attempt.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed(Value),
    /// Return `{"echo": payload}`.
    Echo,
    Fail(&'static str),
    /// Never finish on its own.
    Hang,
    /// Finish with an error once the cancel token fires.
    WaitForCancel,
    /// Finish once a permit is available on the shared gate.
    Gate,
}

/// Executor that replays a script, then repeats `fallback`.
pub struct ScriptedExecutor {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    pub gate: Semaphore,
}

impl ScriptedExecutor {
    pub fn new(script: impl IntoIterator<Item = Step>, fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(script.into_iter().collect()),
            fallback,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        })
    }

    pub fn always(step: Step) -> Arc<Self> {
        Self::new([], step)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of attempts observed running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn open_gate(&self, permits: usize) {
        self.gate.add_permits(permits);
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, payload: &Value, cancel: CancellationToken) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        match step {
            Step::Succeed(value) => Ok(value),
            Step::Echo => Ok(json!({ "echo": payload })),
            Step::Fail(msg) => anyhow::bail!("{msg}"),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Value::Null)
            }
            Step::WaitForCancel => {
                cancel.cancelled().await;
                anyhow::bail!("stopped on request")
            }
            Step::Gate => {
                let _permit = self.gate.acquire().await?;
                Ok(json!("done"))
            }
        }
    }
}

/// Poll until the job reaches `state`, panicking after a few seconds.
pub async fn wait_for(engine: &Engine, id: JobId, state: JobState) -> JobView {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let view = engine.get_status(id).await.unwrap();
        if view.state == state {
            return view;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} stuck in {} waiting for {state}",
            view.state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `check` holds, panicking after a few seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
