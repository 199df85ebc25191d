//! Typed configuration.
//!
//! [`Config`] carries process-level settings from the environment and fails
//! fast if required vars are missing. The database URL is wrapped in
//! secrecy::SecretString to keep it out of logs.
//!
//! [`EngineConfig`] carries every knob the lifecycle engine needs. None of
//! them has a built-in default: they come from a TOML file or from
//! `SEARCHQ_*` environment variables.

pub mod secrets;

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use secrets::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// Settings for one engine instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Identity recorded in `claimed_by`. Unique per instance.
    pub worker_id: String,
    /// Maximum execution attempts per job.
    pub retry_ceiling: u32,
    /// Concurrent execution slots.
    pub pool_size: usize,
    /// Claimed/Running jobs untouched for longer than this are presumed orphaned.
    pub staleness_threshold: Duration,
    /// Per-attempt executor deadline.
    pub job_timeout: Duration,
    /// How long a delivery stays invisible before the broker redelivers it.
    pub visibility_timeout: Duration,
    /// How long a claimed job may wait for a free slot before it is released.
    pub slot_timeout: Duration,
    /// Broker polling and health probe cadence.
    pub poll_interval: Duration,
    /// Retries for a store write that records an execution outcome.
    pub store_retry_attempts: u32,
    pub store_retry_backoff: Duration,
    /// How long shutdown waits for running jobs before signalling cancellation.
    pub shutdown_grace: Duration,
    /// Repeat the recovery sweep on this interval. `None` = startup only.
    pub recovery_interval: Option<Duration>,
}

/// On-disk shape of [`EngineConfig`]. Durations are whole milliseconds.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EngineFile {
    worker_id: Option<String>,
    retry_ceiling: u32,
    pool_size: usize,
    staleness_threshold_ms: u64,
    job_timeout_ms: u64,
    visibility_timeout_ms: u64,
    slot_timeout_ms: u64,
    poll_interval_ms: u64,
    store_retry_attempts: u32,
    store_retry_backoff_ms: u64,
    shutdown_grace_ms: u64,
    recovery_interval_ms: Option<u64>,
}

impl From<EngineFile> for EngineConfig {
    fn from(f: EngineFile) -> Self {
        Self {
            worker_id: f.worker_id.unwrap_or_else(generated_worker_id),
            retry_ceiling: f.retry_ceiling,
            pool_size: f.pool_size,
            staleness_threshold: Duration::from_millis(f.staleness_threshold_ms),
            job_timeout: Duration::from_millis(f.job_timeout_ms),
            visibility_timeout: Duration::from_millis(f.visibility_timeout_ms),
            slot_timeout: Duration::from_millis(f.slot_timeout_ms),
            poll_interval: Duration::from_millis(f.poll_interval_ms),
            store_retry_attempts: f.store_retry_attempts,
            store_retry_backoff: Duration::from_millis(f.store_retry_backoff_ms),
            shutdown_grace: Duration::from_millis(f.shutdown_grace_ms),
            recovery_interval: f.recovery_interval_ms.map(Duration::from_millis),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: EngineFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad engine config: {e}")))?;
        let config = EngineConfig::from(file);
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read engine config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load from `SEARCHQ_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            worker_id: std::env::var("SEARCHQ_WORKER_ID").unwrap_or_else(|_| generated_worker_id()),
            retry_ceiling: parsed_var("SEARCHQ_RETRY_CEILING")?,
            pool_size: parsed_var("SEARCHQ_POOL_SIZE")?,
            staleness_threshold: millis_var("SEARCHQ_STALENESS_THRESHOLD_MS")?,
            job_timeout: millis_var("SEARCHQ_JOB_TIMEOUT_MS")?,
            visibility_timeout: millis_var("SEARCHQ_VISIBILITY_TIMEOUT_MS")?,
            slot_timeout: millis_var("SEARCHQ_SLOT_TIMEOUT_MS")?,
            poll_interval: millis_var("SEARCHQ_POLL_INTERVAL_MS")?,
            store_retry_attempts: parsed_var("SEARCHQ_STORE_RETRY_ATTEMPTS")?,
            store_retry_backoff: millis_var("SEARCHQ_STORE_RETRY_BACKOFF_MS")?,
            shutdown_grace: millis_var("SEARCHQ_SHUTDOWN_GRACE_MS")?,
            recovery_interval: match std::env::var("SEARCHQ_RECOVERY_INTERVAL_MS") {
                Ok(v) => Some(Duration::from_millis(parse_value(
                    "SEARCHQ_RECOVERY_INTERVAL_MS",
                    &v,
                )?)),
                Err(_) => None,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker_id.trim().is_empty() {
            return Err(Error::Config("worker_id must not be empty".to_string()));
        }
        if self.retry_ceiling == 0 {
            return Err(Error::Config("retry_ceiling must be at least 1".to_string()));
        }
        if self.pool_size == 0 {
            return Err(Error::Config("pool_size must be at least 1".to_string()));
        }
        let durations = [
            ("staleness_threshold", self.staleness_threshold),
            ("job_timeout", self.job_timeout),
            ("visibility_timeout", self.visibility_timeout),
            ("slot_timeout", self.slot_timeout),
            ("poll_interval", self.poll_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be non-zero")));
            }
        }
        if self.recovery_interval.is_some_and(|d| d.is_zero()) {
            return Err(Error::Config("recovery_interval must be non-zero".to_string()));
        }
        // A job that is merely slow must never look orphaned. A finished
        // attempt may still be retrying its outcome write.
        let outcome_write = self
            .store_retry_backoff
            .saturating_mul(self.store_retry_attempts);
        let bounds = [
            (
                "job_timeout plus the store retry budget",
                self.job_timeout.saturating_add(outcome_write),
            ),
            ("slot_timeout", self.slot_timeout),
        ];
        for (name, bound) in bounds {
            if self.staleness_threshold <= bound {
                return Err(Error::Config(format!(
                    "staleness_threshold ({:?}) must exceed {name} ({bound:?})",
                    self.staleness_threshold
                )));
            }
        }
        Ok(())
    }
}

fn generated_worker_id() -> String {
    format!("worker-{}", uuid::Uuid::new_v4())
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parse_value<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{name}={value} is invalid: {e}")))
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    parse_value(name, &required_var(name)?)
}

fn millis_var(name: &str) -> Result<Duration> {
    parsed_var::<u64>(name).map(Duration::from_millis)
}
