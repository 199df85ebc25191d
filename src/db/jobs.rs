//! Postgres-backed [`JobStore`].
//!
//! The version check and the write happen in one `UPDATE ... WHERE id = $1
//! AND version = $2`, so concurrent writers on any number of hosts serialize
//! on the row and exactly one of them wins.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Job, JobId, JobState, Transition};
use crate::store::JobStore;

const COLUMNS: &str =
    "id, state, payload, result, error, attempts, version, created_at, updated_at, claimed_by";

impl super::Db {
    /// Jobs for operator listings, newest first.
    pub async fn list_jobs(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM jobs
             WHERE ($1::text IS NULL OR state = $1)
             ORDER BY created_at DESC
             LIMIT $2"
        ))
        .bind(state.map(JobState::as_str))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    async fn fetch_job(&self, id: JobId) -> Result<Job> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM jobs WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or(Error::NotFound(id))?.try_into_job()
    }
}

#[async_trait]
impl JobStore for super::Db {
    async fn create(&self, payload: serde_json::Value) -> Result<Job> {
        let job = Job::new(payload);
        sqlx::query(&format!(
            "INSERT INTO jobs ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(job.id.0)
        .bind(job.state.as_str())
        .bind(&job.payload)
        .bind(&job.result)
        .bind(&job.error)
        .bind(job.attempts as i32)
        .bind(job.version as i64)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(&job.claimed_by)
        .execute(&self.pool)
        .await?;
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        self.fetch_job(id).await
    }

    async fn compare_and_update(
        &self,
        id: JobId,
        expected_version: u64,
        transition: Transition,
    ) -> Result<Job> {
        let current = self.fetch_job(id).await?;
        if current.version != expected_version {
            return Err(Error::VersionConflict {
                id,
                expected: expected_version,
            });
        }
        let next = transition.apply(&current, Utc::now())?;

        let rows_affected = sqlx::query(
            "UPDATE jobs
             SET state = $1, result = $2, error = $3, attempts = $4, version = $5,
                 updated_at = $6, claimed_by = $7
             WHERE id = $8 AND version = $9",
        )
        .bind(next.state.as_str())
        .bind(&next.result)
        .bind(&next.error)
        .bind(next.attempts as i32)
        .bind(next.version as i64)
        .bind(next.updated_at)
        .bind(&next.claimed_by)
        .bind(id.0)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Someone else committed between our read and write.
            return Err(Error::VersionConflict {
                id,
                expected: expected_version,
            });
        }
        Ok(next)
    }

    async fn list_by_state(&self, state: JobState) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM jobs WHERE state = $1 ORDER BY updated_at ASC"
        ))
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::try_into_job).collect()
    }

    async fn health_check(&self) -> Result<()> {
        self.ping().await
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    state: String,
    payload: serde_json::Value,
    result: Option<serde_json::Value>,
    error: Option<String>,
    attempts: i32,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    claimed_by: Option<String>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            state: self.state.parse()?,
            payload: self.payload,
            result: self.result,
            error: self.error,
            attempts: u32::try_from(self.attempts)
                .map_err(|_| Error::Other(format!("job {} has negative attempts", self.id)))?,
            version: u64::try_from(self.version)
                .map_err(|_| Error::Other(format!("job {} has negative version", self.id)))?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            claimed_by: self.claimed_by,
        })
    }
}
