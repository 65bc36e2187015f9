//! Job queues, job records, progress pub/sub and admission control.
//!
//! Queues are Redis Streams with consumer groups, giving at-least-once
//! delivery. Failed deliveries are retried with exponential backoff through a
//! delayed sorted set and dead-lettered once attempts run out. In-memory
//! implementations of every seam are provided for tests and local runs.

pub mod broker;
pub mod error;
pub mod job;
pub mod manager;
pub mod memory;
pub mod progress;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod store;

pub use broker::{FailDisposition, JobBroker, QueueStats, Reclaimed};
pub use error::{QueueError, QueueResult};
pub use job::{ComputeJob, Delivery, Envelope, QueueJob, QueueKind, ScanJob};
pub use manager::QueueManager;
pub use memory::{DeadLetter, MemoryBroker};
pub use progress::{
    MemoryProgressBus, ProgressChannel, ProgressFeed, ProgressSink, ProgressSource,
    JOB_CHANNEL_PATTERN,
};
pub use queue::{QueueConfig, RedisJobQueue};
pub use rate_limit::{
    Admission, BucketState, BucketStore, MemoryBucketStore, RateLimitConfig, RateLimiter,
    RedisBucketStore,
};
pub use retry::{retry_async, RetryPolicy};
pub use store::{JobStore, MemoryJobStore, RedisJobStore, JOB_RECORD_TTL_SECS};
