//! Broker Channel contract.
//!
//! At-least-once transport of job references from submitters to
//! dispatchers. A delivery may arrive more than once; consumers must
//! tolerate duplicates. Deliveries that are never acknowledged come back
//! after the visibility timeout.

pub mod memory;

pub use memory::MemoryBroker;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::JobId;

/// One delivery of a job reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: JobId,
    /// Broker-specific handle used to acknowledge this delivery.
    pub receipt: i64,
    /// How many times this message has been handed out, this one included.
    pub delivery_count: u32,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn enqueue(&self, job_id: JobId) -> Result<()>;

    /// Wait for the next delivery. `None` once the channel is closed.
    async fn dequeue(&self) -> Result<Option<Delivery>>;

    /// Acknowledge a delivery so it is not redelivered. Acking a receipt
    /// that already expired is not an error.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Stop handing out deliveries; pending `dequeue` calls return `None`.
    fn close(&self);

    async fn health_check(&self) -> Result<()>;
}
