//! pgmq queue operations via direct SQLx, and the [`Broker`] built on them.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.archive. Messages carry only a job reference: `{"job_id": "<uuid>"}`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Db;
use crate::broker::{Broker, Delivery};
use crate::error::{Error, Result};
use crate::model::JobId;
use crate::telemetry::metrics;

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub vt: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

fn count_operation(queue_name: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        count_operation(queue_name, "create");
        Ok(())
    }

    /// Send a message to a pgmq queue. Returns the message ID.
    /// delay_seconds: 0 for immediate, >0 for delayed delivery.
    pub async fn send_to_queue(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
        delay_seconds: i32,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(queue_name)
            .bind(payload)
            .bind(delay_seconds)
            .fetch_one(&self.pool)
            .await?;
        count_operation(queue_name, "send");
        Ok(row.0)
    }

    /// Read the next message from a queue (visibility timeout in seconds).
    /// Returns None if queue is empty.
    pub async fn read_from_queue(
        &self,
        queue_name: &str,
        vt_seconds: i32,
    ) -> Result<Option<PgmqMessage>> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, 1)")
        .bind(queue_name)
        .bind(vt_seconds)
        .fetch_optional(&self.pool)
        .await?;

        let msg = row.map(|(msg_id, read_ct, enqueued_at, vt, message)| PgmqMessage {
            msg_id,
            read_ct,
            enqueued_at,
            vt,
            message,
        });

        count_operation(
            queue_name,
            if msg.is_some() { "read" } else { "read_empty" },
        );
        Ok(msg)
    }

    /// Archive a message (moves to archive table, preserves for audit).
    /// Archiving a message that is already gone is not an error.
    pub async fn archive_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        count_operation(queue_name, "archive");
        Ok(())
    }
}

/// [`Broker`] over a pgmq queue sharing the job store's database.
///
/// pgmq has no blocking read, so `dequeue` polls every `poll_interval`
/// while the queue is empty. The visibility timeout is rounded up to whole
/// seconds.
pub struct PgmqBroker {
    db: Arc<Db>,
    queue: String,
    vt_seconds: i32,
    poll_interval: Duration,
    closed: CancellationToken,
}

impl PgmqBroker {
    /// Bind to `queue`, creating it if needed.
    pub async fn open(
        db: Arc<Db>,
        queue: impl Into<String>,
        visibility_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self> {
        let queue = queue.into();
        db.create_queue(&queue).await?;
        let secs = visibility_timeout.as_secs() + u64::from(visibility_timeout.subsec_nanos() > 0);
        Ok(Self {
            db,
            queue,
            vt_seconds: i32::try_from(secs.max(1)).unwrap_or(i32::MAX),
            poll_interval,
            closed: CancellationToken::new(),
        })
    }

    fn parse(&self, msg: &PgmqMessage) -> Option<JobId> {
        msg.message
            .get("job_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }
}

fn broker_err(e: Error) -> Error {
    match e {
        Error::StoreUnavailable(reason) | Error::Other(reason) => Error::Broker(reason),
        other => other,
    }
}

#[async_trait]
impl Broker for PgmqBroker {
    async fn enqueue(&self, job_id: JobId) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::Broker("broker closed".to_string()));
        }
        let payload = serde_json::json!({ "job_id": job_id.to_string() });
        let msg_id = self
            .db
            .send_to_queue(&self.queue, &payload, 0)
            .await
            .map_err(broker_err)?;
        debug!(%job_id, msg_id, queue = %self.queue, "enqueued");
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>> {
        loop {
            if self.closed.is_cancelled() {
                return Ok(None);
            }
            let msg = self
                .db
                .read_from_queue(&self.queue, self.vt_seconds)
                .await
                .map_err(broker_err)?;

            match msg {
                Some(msg) => match self.parse(&msg) {
                    Some(job_id) => {
                        return Ok(Some(Delivery {
                            job_id,
                            receipt: msg.msg_id,
                            delivery_count: u32::try_from(msg.read_ct).unwrap_or(0),
                        }));
                    }
                    None => {
                        // Nothing can ever consume it; keep it for audit only.
                        warn!(msg_id = msg.msg_id, message = %msg.message, "bad pgmq payload, archiving");
                        self.db
                            .archive_message(&self.queue, msg.msg_id)
                            .await
                            .map_err(broker_err)?;
                    }
                },
                None => {
                    tokio::select! {
                        _ = self.closed.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.db
            .archive_message(&self.queue, delivery.receipt)
            .await
            .map_err(broker_err)
    }

    fn close(&self) {
        self.closed.cancel();
    }

    async fn health_check(&self) -> Result<()> {
        self.db.ping().await.map_err(broker_err)
    }
}
