//! Job queues using Redis Streams.
//!
//! Layout per queue kind:
//! - `{stream_prefix}:{kind}`: stream read through one consumer group
//! - `{delayed_prefix}:{kind}`: sorted set of retries scored by due time (ms)
//! - `{dlq_prefix}:{kind}`: dead-letter stream

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use mm_models::JobId;

use crate::broker::{FailDisposition, JobBroker, QueueStats, Reclaimed};
use crate::error::{QueueError, QueueResult};
use crate::job::{Delivery, Envelope, QueueJob, QueueKind};
use crate::retry::RetryPolicy;

/// Moves due retries from the delayed set back onto the stream.
const PROMOTE_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, member in ipairs(due) do
  local envelope = cjson.decode(member)
  local job = envelope['job'] or {}
  local job_id = job['parent_job_id']
  if job_id == nil and job['job'] ~= nil then
    job_id = job['job']['id']
  end
  redis.call('XADD', KEYS[2], '*', 'job', member, 'job_id', tostring(job_id))
  redis.call('ZREM', KEYS[1], member)
end
return #due
"#;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Prefix for job streams
    pub stream_prefix: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Prefix for dead letter streams
    pub dlq_prefix: String,
    /// Prefix for delayed retry sets
    pub delayed_prefix: String,
    /// Redelivery policy
    pub retry: RetryPolicy,
    /// Idle time after which a pending delivery is considered abandoned
    pub visibility_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_prefix: "mm:queue".to_string(),
            consumer_group: "mm:workers".to_string(),
            dlq_prefix: "mm:dlq".to_string(),
            delayed_prefix: "mm:delayed".to_string(),
            retry: RetryPolicy::default(),
            visibility_timeout: Duration::from_secs(600), // 10 minutes
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            stream_prefix: std::env::var("QUEUE_STREAM_PREFIX")
                .unwrap_or_else(|_| "mm:queue".to_string()),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or_else(|_| "mm:workers".to_string()),
            dlq_prefix: std::env::var("QUEUE_DLQ_PREFIX")
                .unwrap_or_else(|_| "mm:dlq".to_string()),
            delayed_prefix: std::env::var("QUEUE_DELAYED_PREFIX")
                .unwrap_or_else(|_| "mm:delayed".to_string()),
            retry: RetryPolicy::from_env(),
            visibility_timeout: Duration::from_secs(
                std::env::var("QUEUE_VISIBILITY_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(600),
            ),
        }
    }

    pub fn stream_name(&self, kind: QueueKind) -> String {
        format!("{}:{}", self.stream_prefix, kind)
    }

    pub fn dlq_stream_name(&self, kind: QueueKind) -> String {
        format!("{}:{}", self.dlq_prefix, kind)
    }

    pub fn delayed_key(&self, kind: QueueKind) -> String {
        format!("{}:{}", self.delayed_prefix, kind)
    }
}

/// Redis Streams broker.
pub struct RedisJobQueue {
    client: redis::Client,
    config: QueueConfig,
    promote: redis::Script,
}

impl RedisJobQueue {
    /// Create a new job queue.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            config,
            promote: redis::Script::new(PROMOTE_DUE_SCRIPT),
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn promote_due(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        kind: QueueKind,
    ) -> QueueResult<()> {
        let promoted: u64 = self
            .promote
            .key(self.config.delayed_key(kind))
            .key(self.config.stream_name(kind))
            .arg(Utc::now().timestamp_millis())
            .arg(100)
            .invoke_async(conn)
            .await?;
        if promoted > 0 {
            debug!("Promoted {} delayed {} jobs", promoted, kind);
        }
        Ok(())
    }

    /// Turn stream entries into deliveries, dead-lettering anything unreadable.
    async fn parse_entries(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        kind: QueueKind,
        entries: Vec<redis::streams::StreamId>,
    ) -> QueueResult<Vec<Delivery>> {
        let mut deliveries = Vec::with_capacity(entries.len());
        for entry in entries {
            let message_id = entry.id.clone();
            let payload = entry_field(&entry.map, "job");
            match payload.as_deref().map(serde_json::from_str::<Envelope>) {
                Some(Ok(envelope)) => deliveries.push(Delivery {
                    id: message_id,
                    kind,
                    envelope,
                }),
                Some(Err(e)) => {
                    warn!("Failed to parse {} job payload {}: {}", kind, message_id, e);
                    self.dead_letter_raw(conn, kind, &message_id, payload.as_deref(), &e.to_string())
                        .await?;
                }
                None => {
                    warn!("Stream entry {} on {} has no job payload", message_id, kind);
                    self.dead_letter_raw(conn, kind, &message_id, None, "missing job payload")
                        .await?;
                }
            }
        }
        Ok(deliveries)
    }

    async fn dead_letter_raw(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        kind: QueueKind,
        message_id: &str,
        payload: Option<&str>,
        error: &str,
    ) -> QueueResult<()> {
        let stream = self.config.stream_name(kind);
        redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(self.config.dlq_stream_name(kind))
            .arg("*")
            .arg("job")
            .arg(payload.unwrap_or(""))
            .arg("error")
            .arg(error)
            .arg("original_id")
            .arg(message_id)
            .ignore()
            .cmd("XACK")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .ignore()
            .cmd("XDEL")
            .arg(&stream)
            .arg(message_id)
            .ignore()
            .query_async::<()>(conn)
            .await?;
        Ok(())
    }
}

fn entry_field(map: &HashMap<String, redis::Value>, field: &str) -> Option<String> {
    match map.get(field) {
        Some(redis::Value::BulkString(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Some(redis::Value::SimpleString(s)) => Some(s.clone()),
        _ => None,
    }
}

#[async_trait]
impl JobBroker for RedisJobQueue {
    async fn init(&self) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        for kind in QueueKind::BY_PRIORITY {
            // Create consumer group (ignore error if already exists)
            let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(self.config.stream_name(kind))
                .arg(&self.config.consumer_group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;

            match result {
                Ok(_) => info!(
                    "Created consumer group {} on {}",
                    self.config.consumer_group,
                    self.config.stream_name(kind)
                ),
                Err(e) if e.to_string().contains("BUSYGROUP") => {
                    debug!("Consumer group already exists on {}", self.config.stream_name(kind));
                }
                Err(e) => return Err(QueueError::Redis(e)),
            }
        }

        Ok(())
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn enqueue(&self, job: QueueJob) -> QueueResult<String> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let kind = job.kind();
        let envelope = Envelope::new(job);
        let payload = serde_json::to_string(&envelope)?;

        let message_id: String = redis::cmd("XADD")
            .arg(self.config.stream_name(kind))
            .arg("*")
            .arg("job")
            .arg(&payload)
            .arg("job_id")
            .arg(envelope.job.job_id().as_str())
            .query_async(&mut conn)
            .await?;

        info!(
            "Enqueued {} job {} with message ID {}",
            kind,
            envelope.job.job_id(),
            message_id
        );

        Ok(message_id)
    }

    async fn consume(
        &self,
        kind: QueueKind,
        consumer: &str,
        block: Option<Duration>,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        self.promote_due(&mut conn, kind).await?;

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count.max(1));
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS")
            .arg(self.config.stream_name(kind))
            .arg(">"); // Only new messages

        let reply: Option<redis::streams::StreamReadReply> = cmd.query_async(&mut conn).await?;
        let entries = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect::<Vec<_>>())
            .unwrap_or_default();

        let deliveries = self.parse_entries(&mut conn, kind, entries).await?;
        if !deliveries.is_empty() {
            debug!("Consumed {} {} jobs from stream", deliveries.len(), kind);
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let stream = self.config.stream_name(delivery.kind);

        redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg(&delivery.id)
            .ignore()
            .cmd("XDEL")
            .arg(&stream)
            .arg(&delivery.id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        debug!("Acknowledged {} job: {}", delivery.kind, delivery.id);
        Ok(())
    }

    async fn fail(&self, delivery: &Delivery, reason: &str) -> QueueResult<FailDisposition> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let stream = self.config.stream_name(delivery.kind);
        let attempt = delivery.attempt();
        let policy = &self.config.retry;

        let mut pipe = redis::pipe();
        pipe.atomic();

        let disposition = if policy.is_exhausted(attempt) {
            pipe.cmd("XADD")
                .arg(self.config.dlq_stream_name(delivery.kind))
                .arg("*")
                .arg("job")
                .arg(serde_json::to_string(&delivery.envelope)?)
                .arg("job_id")
                .arg(delivery.job_id().as_str())
                .arg("error")
                .arg(reason)
                .arg("original_id")
                .arg(&delivery.id)
                .arg("failed_at")
                .arg(Utc::now().to_rfc3339())
                .ignore();
            FailDisposition::DeadLettered { attempts: attempt }
        } else {
            let next = delivery.envelope.next_attempt();
            let delay = policy.delay_after(attempt);
            let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            pipe.cmd("ZADD")
                .arg(self.config.delayed_key(delivery.kind))
                .arg(due_ms)
                .arg(serde_json::to_string(&next)?)
                .ignore();
            FailDisposition::Retrying {
                next_attempt: next.attempt,
                delay,
            }
        };

        pipe.cmd("XACK")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg(&delivery.id)
            .ignore()
            .cmd("XDEL")
            .arg(&stream)
            .arg(&delivery.id)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;

        match &disposition {
            FailDisposition::DeadLettered { attempts } => warn!(
                "Moved {} job {} to DLQ after {} attempts: {}",
                delivery.kind,
                delivery.job_id(),
                attempts,
                reason
            ),
            FailDisposition::Retrying {
                next_attempt,
                delay,
            } => info!(
                "{} job {} will be retried (attempt {}/{}) in {:?}",
                delivery.kind,
                delivery.job_id(),
                next_attempt,
                policy.max_attempts,
                delay
            ),
        }

        Ok(disposition)
    }

    async fn touch(&self, delivery: &Delivery, consumer: &str) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        // Re-claiming with min-idle 0 resets the idle timer.
        let _: redis::Value = redis::cmd("XCLAIM")
            .arg(self.config.stream_name(delivery.kind))
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(0)
            .arg(&delivery.id)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim_stale(
        &self,
        kind: QueueKind,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Reclaimed>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let stream = self.config.stream_name(kind);
        let min_idle_ms = min_idle.as_millis() as u64;

        let pending: redis::streams::StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        // XCLAIM re-checks idle time, so concurrent claimers cannot both win.
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&stream)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(min_idle_ms);
        for entry in &pending.ids {
            cmd.arg(&entry.id);
        }
        let claimed: redis::streams::StreamClaimReply = cmd.query_async(&mut conn).await?;

        let deliveries = self.parse_entries(&mut conn, kind, claimed.ids).await?;
        let mut reclaimed = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            info!(
                "Claimed stale {} job {} (attempt {})",
                kind,
                delivery.job_id(),
                delivery.attempt()
            );
            let disposition = self.fail(&delivery, "visibility timeout expired").await?;
            reclaimed.push(Reclaimed {
                delivery,
                disposition,
            });
        }
        Ok(reclaimed)
    }

    async fn stats(&self, kind: QueueKind) -> QueueResult<QueueStats> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let ready: u64 = conn.xlen(self.config.stream_name(kind)).await?;
        let delayed: u64 = conn.zcard(self.config.delayed_key(kind)).await?;
        let dead_lettered: u64 = conn.xlen(self.config.dlq_stream_name(kind)).await?;
        Ok(QueueStats {
            queue: kind,
            priority: kind.priority(),
            ready,
            delayed,
            dead_lettered,
        })
    }

    async fn purge_dead_letter(&self, kind: QueueKind, job_id: &JobId) -> QueueResult<usize> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let dlq = self.config.dlq_stream_name(kind);

        let range: redis::streams::StreamRangeReply = conn.xrange_all(&dlq).await?;
        let ids: Vec<String> = range
            .ids
            .into_iter()
            .filter(|entry| entry_field(&entry.map, "job_id").as_deref() == Some(job_id.as_str()))
            .map(|entry| entry.id)
            .collect();

        if ids.is_empty() {
            return Ok(0);
        }
        let removed: usize = conn.xdel(&dlq, &ids).await?;
        info!("Purged {} DLQ entries for {} job {}", removed, kind, job_id);
        Ok(removed)
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }
}
