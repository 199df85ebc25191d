//! Backend health observation.
//!
//! Components expose a `health_check` probe; the monitor polls them on an
//! interval and publishes the aggregate through a `watch` channel. The
//! dispatcher subscribes and stops pulling work while a backend is down,
//! so the state machine never sees transport-level events directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::error::Result;
use crate::store::JobStore;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Anything the engine can probe for reachability.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Short component name for logs and metrics.
    fn component(&self) -> &'static str;

    async fn health_check(&self) -> Result<()>;
}

/// Aggregate status published by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded { component: String, reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

struct StoreProbe(Arc<dyn JobStore>);

#[async_trait]
impl HealthCheck for StoreProbe {
    fn component(&self) -> &'static str {
        "store"
    }

    async fn health_check(&self) -> Result<()> {
        self.0.health_check().await
    }
}

struct BrokerProbe(Arc<dyn Broker>);

#[async_trait]
impl HealthCheck for BrokerProbe {
    fn component(&self) -> &'static str {
        "broker"
    }

    async fn health_check(&self) -> Result<()> {
        self.0.health_check().await
    }
}

/// Polls a set of probes and publishes transitions between healthy and degraded.
pub struct HealthMonitor {
    checks: Vec<Arc<dyn HealthCheck>>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            checks: Vec::new(),
            interval,
        }
    }

    pub fn with_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.checks.push(check);
        self
    }

    pub fn with_store(self, store: Arc<dyn JobStore>) -> Self {
        self.with_check(Arc::new(StoreProbe(store)))
    }

    pub fn with_broker(self, broker: Arc<dyn Broker>) -> Self {
        self.with_check(Arc::new(BrokerProbe(broker)))
    }

    /// Probe every component once. The first failure wins.
    pub async fn check_once(&self) -> HealthStatus {
        for check in &self.checks {
            if let Err(e) = check.health_check().await {
                return HealthStatus::Degraded {
                    component: check.component().to_string(),
                    reason: e.to_string(),
                };
            }
        }
        HealthStatus::Healthy
    }

    /// Start polling in the background until `shutdown` fires.
    ///
    /// The first probe runs before this returns, so the receiver starts
    /// out with a real status.
    pub async fn spawn(self, shutdown: CancellationToken) -> watch::Receiver<HealthStatus> {
        let initial = self.check_once().await;
        log_status(&initial);
        let (tx, rx) = watch::channel(initial);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }
                let status = self.check_once().await;
                tx.send_if_modified(|current| {
                    if *current == status {
                        return false;
                    }
                    log_status(&status);
                    *current = status;
                    true
                });
            }
        });

        rx
    }
}

fn log_status(status: &HealthStatus) {
    match status {
        HealthStatus::Healthy => {
            info!("backends healthy");
            metrics::health_changes().add(1, &[KeyValue::new("status", "healthy")]);
        }
        HealthStatus::Degraded { component, reason } => {
            warn!(%component, %reason, "backend degraded");
            metrics::health_changes().add(
                1,
                &[
                    KeyValue::new("status", "degraded"),
                    KeyValue::new("component", component.clone()),
                ],
            );
        }
    }
}
