//! In-process broker with the same delivery semantics as the Redis queue.
//!
//! Used by tests and by single-process development setups.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{info, warn};

use mm_models::JobId;

use crate::broker::{FailDisposition, JobBroker, QueueStats, Reclaimed};
use crate::error::{QueueError, QueueResult};
use crate::job::{Delivery, Envelope, QueueJob, QueueKind};
use crate::retry::RetryPolicy;

/// A message that exhausted its retries.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub envelope: Envelope,
    pub error: String,
    pub original_id: String,
}

#[derive(Debug)]
struct InFlight {
    delivery: Delivery,
    consumer: String,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct Lane {
    ready: VecDeque<(String, Envelope)>,
    delayed: Vec<(Instant, Envelope)>,
    in_flight: HashMap<String, InFlight>,
    dead: Vec<DeadLetter>,
}

impl Lane {
    fn promote_due(&mut self, now: Instant, next_id: &mut u64) {
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].0 <= now {
                let (_, envelope) = self.delayed.swap_remove(index);
                *next_id += 1;
                self.ready.push_back((format!("{}-0", next_id), envelope));
            } else {
                index += 1;
            }
        }
    }
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    lanes: HashMap<QueueKind, Lane>,
}

impl State {
    fn lane(&mut self, kind: QueueKind) -> &mut Lane {
        self.lanes.entry(kind).or_default()
    }
}

/// In-memory [`JobBroker`].
pub struct MemoryBroker {
    state: Mutex<State>,
    notify: Notify,
    retry: RetryPolicy,
}

impl MemoryBroker {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            retry,
        }
    }

    fn lock(&self) -> QueueResult<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| QueueError::connection_failed("memory broker state poisoned"))
    }

    /// Dead letters currently held for a queue.
    pub fn dead_letters(&self, kind: QueueKind) -> Vec<DeadLetter> {
        self.lock()
            .map(|mut state| state.lane(kind).dead.clone())
            .unwrap_or_default()
    }

    /// Deliveries handed out and not yet acked or failed.
    pub fn in_flight(&self, kind: QueueKind) -> usize {
        self.lock()
            .map(|mut state| state.lane(kind).in_flight.len())
            .unwrap_or_default()
    }

    fn take_ready(&self, kind: QueueKind, consumer: &str, count: usize) -> QueueResult<Vec<Delivery>> {
        let mut state = self.lock()?;
        let mut next_id = state.next_id;
        let now = Instant::now();
        let lane = state.lane(kind);
        lane.promote_due(now, &mut next_id);

        let mut deliveries = Vec::new();
        while deliveries.len() < count.max(1) {
            let Some((id, envelope)) = lane.ready.pop_front() else {
                break;
            };
            let delivery = Delivery { id, kind, envelope };
            lane.in_flight.insert(
                delivery.id.clone(),
                InFlight {
                    delivery: delivery.clone(),
                    consumer: consumer.to_string(),
                    last_seen: now,
                },
            );
            deliveries.push(delivery);
        }
        state.next_id = next_id;
        Ok(deliveries)
    }

    fn settle(&self, delivery: &Delivery, reason: &str) -> QueueResult<FailDisposition> {
        let mut state = self.lock()?;
        let lane = state.lane(delivery.kind);
        if lane.in_flight.remove(&delivery.id).is_none() {
            return Err(QueueError::UnknownDelivery(delivery.id.clone()));
        }

        let attempt = delivery.attempt();
        if self.retry.is_exhausted(attempt) {
            lane.dead.push(DeadLetter {
                envelope: delivery.envelope.clone(),
                error: reason.to_string(),
                original_id: delivery.id.clone(),
            });
            warn!(
                "Moved {} job {} to DLQ after {} attempts: {}",
                delivery.kind,
                delivery.job_id(),
                attempt,
                reason
            );
            return Ok(FailDisposition::DeadLettered { attempts: attempt });
        }

        let next = delivery.envelope.next_attempt();
        let delay = self.retry.delay_after(attempt);
        let next_attempt = next.attempt;
        lane.delayed.push((Instant::now() + delay, next));
        info!(
            "{} job {} will be retried (attempt {}/{}) in {:?}",
            delivery.kind,
            delivery.job_id(),
            next_attempt,
            self.retry.max_attempts,
            delay
        );
        Ok(FailDisposition::Retrying {
            next_attempt,
            delay,
        })
    }

    fn next_due_in(&self, kind: QueueKind) -> Option<Duration> {
        let mut state = self.lock().ok()?;
        let now = Instant::now();
        state
            .lane(kind)
            .delayed
            .iter()
            .map(|(due, _)| due.saturating_duration_since(now))
            .min()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl JobBroker for MemoryBroker {
    async fn init(&self) -> QueueResult<()> {
        Ok(())
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }

    async fn enqueue(&self, job: QueueJob) -> QueueResult<String> {
        let kind = job.kind();
        let envelope = Envelope::new(job);
        let id = {
            let mut state = self.lock()?;
            state.next_id += 1;
            let id = format!("{}-0", state.next_id);
            state.lane(kind).ready.push_back((id.clone(), envelope));
            id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn consume(
        &self,
        kind: QueueKind,
        consumer: &str,
        block: Option<Duration>,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let deadline = block.map(|b| Instant::now() + b);
        loop {
            // Register interest before checking, so an enqueue in between is not missed.
            let notified = self.notify.notified();
            let deliveries = self.take_ready(kind, consumer, count)?;
            if !deliveries.is_empty() {
                return Ok(deliveries);
            }
            let Some(deadline) = deadline else {
                return Ok(deliveries);
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(deliveries);
            }
            let mut wait = deadline - now;
            if let Some(due) = self.next_due_in(kind) {
                wait = wait.min(due);
            }
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut state = self.lock()?;
        state
            .lane(delivery.kind)
            .in_flight
            .remove(&delivery.id)
            .map(|_| ())
            .ok_or_else(|| QueueError::UnknownDelivery(delivery.id.clone()))
    }

    async fn fail(&self, delivery: &Delivery, reason: &str) -> QueueResult<FailDisposition> {
        self.settle(delivery, reason)
    }

    async fn touch(&self, delivery: &Delivery, consumer: &str) -> QueueResult<()> {
        let mut state = self.lock()?;
        if let Some(entry) = state.lane(delivery.kind).in_flight.get_mut(&delivery.id) {
            entry.last_seen = Instant::now();
            entry.consumer = consumer.to_string();
        }
        Ok(())
    }

    async fn claim_stale(
        &self,
        kind: QueueKind,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Reclaimed>> {
        let stale: Vec<Delivery> = {
            let mut state = self.lock()?;
            let now = Instant::now();
            state
                .lane(kind)
                .in_flight
                .values()
                .filter(|f| now.saturating_duration_since(f.last_seen) >= min_idle)
                .take(count.max(1))
                .map(|f| f.delivery.clone())
                .collect()
        };

        let mut reclaimed = Vec::with_capacity(stale.len());
        for delivery in stale {
            info!(
                "{} claimed stale {} job {} (attempt {})",
                consumer,
                kind,
                delivery.job_id(),
                delivery.attempt()
            );
            let disposition = self.settle(&delivery, "visibility timeout expired")?;
            reclaimed.push(Reclaimed {
                delivery,
                disposition,
            });
        }
        Ok(reclaimed)
    }

    async fn stats(&self, kind: QueueKind) -> QueueResult<QueueStats> {
        let mut state = self.lock()?;
        let lane = state.lane(kind);
        Ok(QueueStats {
            queue: kind,
            priority: kind.priority(),
            ready: (lane.ready.len() + lane.in_flight.len()) as u64,
            delayed: lane.delayed.len() as u64,
            dead_lettered: lane.dead.len() as u64,
        })
    }

    async fn purge_dead_letter(&self, kind: QueueKind, job_id: &JobId) -> QueueResult<usize> {
        let mut state = self.lock()?;
        let lane = state.lane(kind);
        let before = lane.dead.len();
        lane.dead.retain(|d| d.envelope.job.job_id() != job_id);
        let removed = before - lane.dead.len();
        if removed > 0 {
            info!("Purged {} DLQ entries for {} job {}", removed, kind, job_id);
        }
        Ok(removed)
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }
}
