//! Per-identity token bucket for job admission.
//!
//! Buckets are kept in fixed-point "units": one token is `window_ms` units and
//! every elapsed millisecond refills `capacity` units. This keeps refill exact,
//! so after `window / capacity` of idle time exactly one token has accrued.
//! Refill and consumption always happen in a single atomic step: a Lua script
//! in Redis, a mutex-guarded section in memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{QueueError, QueueResult};

/// Atomically refill, then take `ARGV[4]` tokens if available.
/// Returns `{allowed, level}`.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local full = capacity * window

local level = full
local last = now
local state = redis.call('HMGET', KEYS[1], 'level', 'last')
if state[1] then
  level = tonumber(state[1])
  last = tonumber(state[2]) or now
  if now > last then
    level = math.min(full, level + (now - last) * capacity)
    last = now
  end
end

local allowed = 0
if cost > 0 then
  if level >= window * cost then
    level = level - window * cost
    allowed = 1
  end
  redis.call('HSET', KEYS[1], 'level', level, 'last', last)
  redis.call('PEXPIRE', KEYS[1], window * 2)
end
return {allowed, level}
"#;

/// Metric names.
pub mod names {
    pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "mm_rate_limit_rejections_total";
    pub const RATE_LIMIT_DEGRADED_TOTAL: &str = "mm_rate_limit_degraded_total";
}

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Jobs admitted per window (bucket capacity)
    pub capacity: u32,
    /// Window over which the full capacity refills
    pub window: Duration,
    /// Key prefix in the coordination store
    pub key_prefix: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            window: Duration::from_secs(60),
            key_prefix: "rate_limit".to_string(),
        }
    }
}

impl RateLimitConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            capacity: std::env::var("RATE_LIMIT_JOBS_PER_MINUTE")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &u32| *n > 0)
                .unwrap_or(10),
            window: Duration::from_secs(
                std::env::var("RATE_LIMIT_WINDOW_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|n: &u64| *n > 0)
                    .unwrap_or(60),
            ),
            key_prefix: std::env::var("RATE_LIMIT_KEY_PREFIX")
                .unwrap_or_else(|_| "rate_limit".to_string()),
        }
    }

    fn window_ms(&self) -> u64 {
        (self.window.as_millis() as u64).max(1)
    }

    fn full_units(&self) -> u64 {
        u64::from(self.capacity) * self.window_ms()
    }
}

/// Bucket level after an atomic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    pub allowed: bool,
    /// Remaining units, `0..=capacity * window_ms`.
    pub level: u64,
}

/// Storage for token buckets. Implementations must apply refill and
/// consumption as one atomic operation per key.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Refill, then take one token if at least one whole token is available.
    async fn take(&self, key: &str, now_ms: i64, capacity: u64, window_ms: u64) -> QueueResult<BucketState>;

    /// Refilled level without consuming or persisting anything.
    async fn peek(&self, key: &str, now_ms: i64, capacity: u64, window_ms: u64) -> QueueResult<BucketState>;

    /// Drop the bucket, restoring full capacity.
    async fn clear(&self, key: &str) -> QueueResult<()>;
}

/// Token buckets as Redis hashes, updated by a Lua script.
pub struct RedisBucketStore {
    client: redis::Client,
    script: redis::Script,
}

impl RedisBucketStore {
    pub fn new(redis_url: &str) -> QueueResult<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            script: redis::Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }

    async fn run(&self, key: &str, now_ms: i64, capacity: u64, window_ms: u64, cost: u64) -> QueueResult<BucketState> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let (allowed, level): (i64, i64) = self
            .script
            .key(key)
            .arg(now_ms)
            .arg(capacity)
            .arg(window_ms)
            .arg(cost)
            .invoke_async(&mut conn)
            .await?;
        Ok(BucketState {
            allowed: allowed == 1,
            level: level.max(0) as u64,
        })
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn take(&self, key: &str, now_ms: i64, capacity: u64, window_ms: u64) -> QueueResult<BucketState> {
        self.run(key, now_ms, capacity, window_ms, 1).await
    }

    async fn peek(&self, key: &str, now_ms: i64, capacity: u64, window_ms: u64) -> QueueResult<BucketState> {
        self.run(key, now_ms, capacity, window_ms, 0).await
    }

    async fn clear(&self, key: &str) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("DEL").arg(key).query_async::<()>(&mut conn).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    level: u64,
    last_ms: i64,
}

impl Bucket {
    fn refilled(self, now_ms: i64, capacity: u64, window_ms: u64) -> Bucket {
        if now_ms <= self.last_ms {
            return self;
        }
        let elapsed = (now_ms - self.last_ms) as u64;
        let level = self
            .level
            .saturating_add(elapsed.saturating_mul(capacity))
            .min(capacity * window_ms);
        Bucket {
            level,
            last_ms: now_ms,
        }
    }
}

/// In-process bucket store. Expired buckets are not swept; a bucket idle for
/// a full window is indistinguishable from a fresh one anyway.
#[derive(Debug, Clone, Default)]
pub struct MemoryBucketStore {
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_buckets<T>(&self, f: impl FnOnce(&mut HashMap<String, Bucket>) -> T) -> QueueResult<T> {
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| QueueError::connection_failed("bucket store poisoned"))?;
        Ok(f(&mut buckets))
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn take(&self, key: &str, now_ms: i64, capacity: u64, window_ms: u64) -> QueueResult<BucketState> {
        self.with_buckets(|buckets| {
            let current = buckets.get(key).copied().unwrap_or(Bucket {
                level: capacity * window_ms,
                last_ms: now_ms,
            });
            let mut bucket = current.refilled(now_ms, capacity, window_ms);
            let allowed = bucket.level >= window_ms;
            if allowed {
                bucket.level -= window_ms;
            }
            buckets.insert(key.to_string(), bucket);
            BucketState {
                allowed,
                level: bucket.level,
            }
        })
    }

    async fn peek(&self, key: &str, now_ms: i64, capacity: u64, window_ms: u64) -> QueueResult<BucketState> {
        self.with_buckets(|buckets| {
            let level = buckets
                .get(key)
                .map(|b| b.refilled(now_ms, capacity, window_ms).level)
                .unwrap_or(capacity * window_ms);
            BucketState {
                allowed: level >= window_ms,
                level,
            }
        })
    }

    async fn clear(&self, key: &str) -> QueueResult<()> {
        self.with_buckets(|buckets| {
            buckets.remove(key);
        })
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    pub allowed: bool,
    pub limit: u32,
    /// Whole tokens left after this call.
    pub remaining: u32,
    /// When the next whole token becomes available.
    pub reset_at: DateTime<Utc>,
    /// The store was unavailable and the request was let through.
    pub degraded: bool,
}

impl Admission {
    /// Seconds until `reset_at`, rounded up.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let ms = (self.reset_at - now).num_milliseconds().max(0) as u64;
        ms.div_ceil(1000)
    }
}

/// Per-identity admission control.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn BucketStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn BucketStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn key(&self, identity: &str) -> String {
        format!("{}:{}", self.config.key_prefix, identity)
    }

    /// Admit or reject one job for `identity` at the current time.
    pub async fn admit(&self, identity: &str) -> Admission {
        self.admit_at(identity, Utc::now().timestamp_millis()).await
    }

    /// Admit or reject one job for `identity` at `now_ms`.
    ///
    /// Fails open: if the bucket store errors the job is admitted and the
    /// degraded mode is logged and counted.
    pub async fn admit_at(&self, identity: &str, now_ms: i64) -> Admission {
        let capacity = u64::from(self.config.capacity);
        let window_ms = self.config.window_ms();
        match self.store.take(&self.key(identity), now_ms, capacity, window_ms).await {
            Ok(state) => {
                if !state.allowed {
                    counter!(names::RATE_LIMIT_REJECTIONS_TOTAL).increment(1);
                    debug!(identity = %identity, "Rate limit exceeded");
                }
                self.admission(state, now_ms)
            }
            Err(e) => {
                counter!(names::RATE_LIMIT_DEGRADED_TOTAL).increment(1);
                warn!(
                    identity = %identity,
                    error = %e,
                    "Rate limiter unavailable, admitting request (fail-open)"
                );
                Admission {
                    allowed: true,
                    limit: self.config.capacity,
                    remaining: self.config.capacity.saturating_sub(1),
                    reset_at: ms_to_datetime(now_ms + window_ms as i64),
                    degraded: true,
                }
            }
        }
    }

    /// Current bucket for `identity` without consuming a token.
    pub async fn status(&self, identity: &str) -> QueueResult<Admission> {
        let now_ms = Utc::now().timestamp_millis();
        let state = self
            .store
            .peek(
                &self.key(identity),
                now_ms,
                u64::from(self.config.capacity),
                self.config.window_ms(),
            )
            .await?;
        Ok(self.admission(state, now_ms))
    }

    /// Operator override: restore full capacity for `identity`.
    pub async fn reset(&self, identity: &str) -> QueueResult<()> {
        self.store.clear(&self.key(identity)).await?;
        debug!(identity = %identity, "Rate limit reset");
        Ok(())
    }

    fn admission(&self, state: BucketState, now_ms: i64) -> Admission {
        let window_ms = self.config.window_ms();
        let capacity = u64::from(self.config.capacity);
        let remaining = (state.level / window_ms) as u32;

        let until_next_token_ms = if state.level >= self.config.full_units() {
            0
        } else {
            let missing = window_ms - state.level % window_ms;
            missing.div_ceil(capacity.max(1))
        };

        Admission {
            allowed: state.allowed,
            limit: self.config.capacity,
            remaining,
            reset_at: ms_to_datetime(now_ms + until_next_token_ms as i64),
            degraded: false,
        }
    }
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}
