//! In-process broker with visibility-timeout redelivery.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Broker, Delivery};
use crate::error::{Error, Result};
use crate::model::JobId;

struct Message {
    job_id: JobId,
    delivery_count: u32,
}

struct InFlight {
    message: Message,
    visible_at: Instant,
}

#[derive(Default)]
struct QueueState {
    next_receipt: i64,
    ready: VecDeque<Message>,
    in_flight: HashMap<i64, InFlight>,
}

impl QueueState {
    /// Move every delivery whose visibility timeout lapsed back to the front.
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<i64> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in expired {
            if let Some(f) = self.in_flight.remove(&receipt) {
                self.ready.push_front(f.message);
            }
        }
    }

    fn next_visible_at(&self) -> Option<Instant> {
        self.in_flight.values().map(|f| f.visible_at).min()
    }
}

pub struct MemoryBroker {
    state: Mutex<QueueState>,
    notify: Notify,
    closed: CancellationToken,
    visibility_timeout: Duration,
    unavailable: AtomicBool,
}

impl MemoryBroker {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            closed: CancellationToken::new(),
            visibility_timeout,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Messages not yet acknowledged (ready plus in flight).
    pub fn depth(&self) -> usize {
        let state = self.lock();
        state.ready.len() + state.in_flight.len()
    }

    /// Simulate the broker going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Broker("memory broker marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, job_id: JobId) -> Result<()> {
        self.ensure_available()?;
        if self.closed.is_cancelled() {
            return Err(Error::Broker("broker closed".to_string()));
        }
        self.lock().ready.push_back(Message {
            job_id,
            delivery_count: 0,
        });
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>> {
        loop {
            if self.closed.is_cancelled() {
                return Ok(None);
            }
            self.ensure_available()?;

            let wake_at = {
                let mut state = self.lock();
                let now = Instant::now();
                state.requeue_expired(now);
                if let Some(mut message) = state.ready.pop_front() {
                    message.delivery_count += 1;
                    let receipt = state.next_receipt;
                    state.next_receipt += 1;
                    let delivery = Delivery {
                        job_id: message.job_id,
                        receipt,
                        delivery_count: message.delivery_count,
                    };
                    state.in_flight.insert(
                        receipt,
                        InFlight {
                            message,
                            visible_at: now + self.visibility_timeout,
                        },
                    );
                    return Ok(Some(delivery));
                }
                state.next_visible_at()
            };

            match wake_at {
                Some(deadline) => tokio::select! {
                    _ = self.closed.cancelled() => {}
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                },
                None => tokio::select! {
                    _ = self.closed.cancelled() => {}
                    _ = self.notify.notified() => {}
                },
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.ensure_available()?;
        self.lock().in_flight.remove(&delivery.receipt);
        Ok(())
    }

    fn close(&self) {
        self.closed.cancel();
    }

    async fn health_check(&self) -> Result<()> {
        self.ensure_available()?;
        if self.closed.is_cancelled() {
            return Err(Error::Broker("broker closed".to_string()));
        }
        Ok(())
    }
}
