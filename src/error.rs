//! Error types for searchq.
//!
//! Recoverable variants (`StoreUnavailable`, `VersionConflict`, `NotFound`
//! on a duplicate delivery) are absorbed by the dispatcher and worker pool.
//! Callers of the engine facade only ever see `IllegalTransition`,
//! `NotFound` and a persistent `StoreUnavailable`.

use std::time::Duration;

use thiserror::Error;

use crate::model::{JobId, JobState};

#[derive(Debug, Error)]
pub enum Error {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("version conflict on job {id}: expected version {expected}")]
    VersionConflict { id: JobId, expected: u64 },

    #[error("illegal transition on job {id}: cannot {event} from {from}")]
    IllegalTransition {
        id: JobId,
        from: JobState,
        event: &'static str,
    },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("executor failure: {0}")]
    ExecutorFailure(String),

    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Transient failures the caller may retry as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::Broker(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Error::Other("row not found".to_string()),
            other => Error::StoreUnavailable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
