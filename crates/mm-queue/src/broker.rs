//! Broker abstraction shared by the Redis and in-memory queues.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use mm_models::JobId;

use crate::error::QueueResult;
use crate::job::{Delivery, QueueJob, QueueKind};
use crate::retry::RetryPolicy;

/// What happened to a delivery reported as failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailDisposition {
    /// Re-enqueued; becomes visible again after `delay`.
    Retrying { next_attempt: u32, delay: Duration },
    /// Attempts exhausted; moved to the dead-letter queue.
    DeadLettered { attempts: u32 },
}

impl FailDisposition {
    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, FailDisposition::DeadLettered { .. })
    }
}

/// A stale delivery taken over from a crashed or stuck consumer and
/// already routed through [`JobBroker::fail`].
#[derive(Debug, Clone)]
pub struct Reclaimed {
    pub delivery: Delivery,
    pub disposition: FailDisposition,
}

/// Queue depth snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue: QueueKind,
    pub priority: u8,
    pub ready: u64,
    pub delayed: u64,
    pub dead_lettered: u64,
}

/// Durable at-least-once broker with per-queue retry and dead-lettering.
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Prepare streams/consumer groups. Idempotent.
    async fn init(&self) -> QueueResult<()>;

    /// Round-trip to the backing store, used by readiness checks.
    async fn ping(&self) -> QueueResult<()>;

    /// Enqueue a job as its first attempt. Returns the broker message id.
    async fn enqueue(&self, job: QueueJob) -> QueueResult<String>;

    /// Pull up to `count` deliveries from one queue. With `block` set, waits
    /// up to that long for the first message.
    async fn consume(
        &self,
        kind: QueueKind,
        consumer: &str,
        block: Option<Duration>,
        count: usize,
    ) -> QueueResult<Vec<Delivery>>;

    /// Acknowledge a delivery after its outcome was durably recorded.
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Report a failed delivery: schedule a retry with backoff, or dead-letter
    /// it once the retry policy is exhausted.
    async fn fail(&self, delivery: &Delivery, reason: &str) -> QueueResult<FailDisposition>;

    /// Keep a long-running delivery from being considered stale.
    async fn touch(&self, delivery: &Delivery, consumer: &str) -> QueueResult<()>;

    /// Take over deliveries idle for longer than `min_idle` and count each
    /// as a failed attempt.
    async fn claim_stale(
        &self,
        kind: QueueKind,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Reclaimed>>;

    /// Depth of one queue.
    async fn stats(&self, kind: QueueKind) -> QueueResult<QueueStats>;

    /// Remove a job's entries from the dead-letter queue so it is never
    /// redelivered. Returns how many were removed.
    async fn purge_dead_letter(&self, kind: QueueKind, job_id: &JobId) -> QueueResult<usize>;

    fn retry_policy(&self) -> &RetryPolicy;
}
