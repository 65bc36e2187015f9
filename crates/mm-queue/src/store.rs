//! Durable job records.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tracing::debug;

use mm_models::{Job, JobId};

use crate::error::QueueResult;

/// TTL for job records (7 days).
pub const JOB_RECORD_TTL_SECS: u64 = 7 * 24 * 3600;

/// Take the lease when free or already ours; refresh its expiry either way.
const ACQUIRE_LEASE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false or current == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return 1
end
return 0
"#;

/// Delete the lease only if we still hold it.
const RELEASE_LEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Persistence for [`Job`] records. The status query reads from here.
///
/// Besides the records themselves the store keeps a per-owner index, one-shot
/// markers and the processing lease that makes a single worker the writer of
/// a job.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save(&self, job: &Job) -> QueueResult<()>;

    async fn load(&self, id: &JobId) -> QueueResult<Option<Job>>;

    /// Records owned by `owner`, newest first.
    async fn jobs_for_owner(&self, owner: &str) -> QueueResult<Vec<Job>>;

    /// Set a named marker on a job. Returns `false` when it was already set.
    async fn mark(&self, id: &JobId, marker: &str) -> QueueResult<bool>;

    async fn is_marked(&self, id: &JobId, marker: &str) -> QueueResult<bool>;

    /// Take or refresh the processing lease for `holder`. Returns `false`
    /// while another holder has an unexpired lease.
    async fn acquire_lease(&self, id: &JobId, holder: &str, ttl: Duration) -> QueueResult<bool>;

    /// Give the lease up if `holder` still has it.
    async fn release_lease(&self, id: &JobId, holder: &str) -> QueueResult<()>;
}

/// Job records stored as JSON strings under `{prefix}:{job_id}`.
///
/// The owner index is a sorted set `{prefix}:owner:{owner}` scored by
/// creation time; ids whose record expired are pruned when read.
pub struct RedisJobStore {
    client: redis::Client,
    prefix: String,
    ttl_secs: u64,
    acquire: redis::Script,
    release: redis::Script,
}

impl RedisJobStore {
    pub fn new(redis_url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            prefix: "mm:job".to_string(),
            ttl_secs: JOB_RECORD_TTL_SECS,
            acquire: redis::Script::new(ACQUIRE_LEASE_SCRIPT),
            release: redis::Script::new(RELEASE_LEASE_SCRIPT),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn key(&self, id: &JobId) -> String {
        format!("{}:{}", self.prefix, id)
    }

    pub fn owner_key(&self, owner: &str) -> String {
        format!("{}:owner:{}", self.prefix, owner)
    }

    fn marker_key(&self, id: &JobId, marker: &str) -> String {
        format!("{}:{}:{}", self.prefix, id, marker)
    }

    fn lease_key(&self, id: &JobId) -> String {
        format!("{}:{}:lease", self.prefix, id)
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn save(&self, job: &Job) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(job)?;
        let mut pipe = redis::pipe();
        pipe.atomic().set_ex(self.key(&job.id), payload, self.ttl_secs).ignore();
        if let Some(owner) = &job.owner_id {
            let owner_key = self.owner_key(owner);
            pipe.zadd(&owner_key, job.id.as_str(), job.created_at.timestamp_millis())
                .ignore()
                .expire(&owner_key, self.ttl_secs as i64)
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        debug!(job_id = %job.id, status = %job.status, progress = job.progress, "Saved job record");
        Ok(())
    }

    async fn load(&self, id: &JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload: Option<String> = conn.get(self.key(id)).await?;
        payload
            .map(|p| serde_json::from_str(&p).map_err(Into::into))
            .transpose()
    }

    async fn jobs_for_owner(&self, owner: &str) -> QueueResult<Vec<Job>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let owner_key = self.owner_key(owner);
        let ids: Vec<String> = conn.zrevrange(&owner_key, 0, -1).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.key(&JobId::from(id.as_str()))).collect();
        let payloads: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        let mut jobs = Vec::with_capacity(ids.len());
        let mut expired = Vec::new();
        for (id, payload) in ids.into_iter().zip(payloads) {
            match payload {
                Some(p) => jobs.push(serde_json::from_str::<Job>(&p)?),
                None => expired.push(id),
            }
        }
        if !expired.is_empty() {
            debug!(owner = %owner, pruned = expired.len(), "Pruning expired jobs from owner index");
            conn.zrem::<_, _, ()>(&owner_key, expired).await?;
        }
        Ok(jobs)
    }

    async fn mark(&self, id: &JobId, marker: &str) -> QueueResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let set: Option<String> = redis::cmd("SET")
            .arg(self.marker_key(id, marker))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn is_marked(&self, id: &JobId, marker: &str) -> QueueResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let exists: bool = conn.exists(self.marker_key(id, marker)).await?;
        Ok(exists)
    }

    async fn acquire_lease(&self, id: &JobId, holder: &str, ttl: Duration) -> QueueResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let acquired: i64 = self
            .acquire
            .key(self.lease_key(id))
            .arg(holder)
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(acquired == 1)
    }

    async fn release_lease(&self, id: &JobId, holder: &str) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: i64 = self
            .release
            .key(self.lease_key(id))
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryRecords {
    jobs: HashMap<JobId, Job>,
    markers: HashSet<(JobId, String)>,
    leases: HashMap<JobId, (String, Instant)>,
}

/// In-memory job records. Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    records: Arc<RwLock<MemoryRecords>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, job: &Job) -> QueueResult<()> {
        self.records.write().await.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn load(&self, id: &JobId) -> QueueResult<Option<Job>> {
        Ok(self.records.read().await.jobs.get(id).cloned())
    }

    async fn jobs_for_owner(&self, owner: &str) -> QueueResult<Vec<Job>> {
        let records = self.records.read().await;
        let mut jobs: Vec<Job> = records
            .jobs
            .values()
            .filter(|job| job.owner_id.as_deref() == Some(owner))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn mark(&self, id: &JobId, marker: &str) -> QueueResult<bool> {
        Ok(self
            .records
            .write()
            .await
            .markers
            .insert((id.clone(), marker.to_string())))
    }

    async fn is_marked(&self, id: &JobId, marker: &str) -> QueueResult<bool> {
        Ok(self
            .records
            .read()
            .await
            .markers
            .contains(&(id.clone(), marker.to_string())))
    }

    async fn acquire_lease(&self, id: &JobId, holder: &str, ttl: Duration) -> QueueResult<bool> {
        let mut records = self.records.write().await;
        let now = Instant::now();
        if let Some((current, expires)) = records.leases.get(id) {
            if current != holder && *expires > now {
                return Ok(false);
            }
        }
        records.leases.insert(id.clone(), (holder.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_lease(&self, id: &JobId, holder: &str) -> QueueResult<()> {
        let mut records = self.records.write().await;
        if records.leases.get(id).is_some_and(|(current, _)| current == holder) {
            records.leases.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mm_models::{GenerationParams, InputRef};

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryJobStore::new();
        let job = Job::new(InputRef::prompt("x"), None, GenerationParams::default());
        assert!(store.load(&job.id).await.unwrap().is_none());
        store.save(&job).await.unwrap();
        assert_eq!(store.load(&job.id).await.unwrap(), Some(job));
    }

    #[tokio::test]
    async fn test_owner_index_is_newest_first_and_scoped() {
        let store = MemoryJobStore::new();
        let mut older = Job::new(InputRef::prompt("a"), Some("u1".into()), GenerationParams::default());
        older.created_at = older.created_at - chrono::Duration::seconds(10);
        let newer = Job::new(InputRef::prompt("b"), Some("u1".into()), GenerationParams::default());
        let other = Job::new(InputRef::prompt("c"), Some("u2".into()), GenerationParams::default());
        let anonymous = Job::new(InputRef::prompt("d"), None, GenerationParams::default());
        for job in [&older, &newer, &other, &anonymous] {
            store.save(job).await.unwrap();
        }

        let ids: Vec<JobId> = store
            .jobs_for_owner("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![newer.id.clone(), older.id.clone()]);
        assert!(store.jobs_for_owner("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_marker_is_set_once() {
        let store = MemoryJobStore::new();
        let id = JobId::new();
        assert!(!store.is_marked(&id, "compute_enqueued").await.unwrap());
        assert!(store.mark(&id, "compute_enqueued").await.unwrap());
        assert!(!store.mark(&id, "compute_enqueued").await.unwrap());
        assert!(store.is_marked(&id, "compute_enqueued").await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_excludes_other_holders_until_released_or_expired() {
        let store = MemoryJobStore::new();
        let id = JobId::new();
        let ttl = Duration::from_secs(60);

        assert!(store.acquire_lease(&id, "a", ttl).await.unwrap());
        assert!(store.acquire_lease(&id, "a", ttl).await.unwrap());
        assert!(!store.acquire_lease(&id, "b", ttl).await.unwrap());

        store.release_lease(&id, "b").await.unwrap();
        assert!(!store.acquire_lease(&id, "b", ttl).await.unwrap());

        store.release_lease(&id, "a").await.unwrap();
        assert!(store.acquire_lease(&id, "b", Duration::from_millis(1)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.acquire_lease(&id, "a", ttl).await.unwrap());
    }

    #[test]
    fn test_redis_keys() {
        let store = RedisJobStore::new("redis://localhost:6379").unwrap();
        assert_eq!(store.key(&JobId::from("abc")), "mm:job:abc");
        assert_eq!(store.owner_key("u1"), "mm:job:owner:u1");
        assert_eq!(store.lease_key(&JobId::from("abc")), "mm:job:abc:lease");
    }

    // Requires a running Redis: cargo test -p mm-queue -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_redis_owner_index_marker_and_lease() {
        let store = RedisJobStore::new("redis://127.0.0.1:6379")
            .unwrap()
            .with_prefix(format!("mm:test:{}", uuid::Uuid::new_v4()));
        let owner = uuid::Uuid::new_v4().to_string();
        let first = Job::new(InputRef::prompt("a"), Some(owner.clone()), GenerationParams::default());
        let mut second = Job::new(InputRef::prompt("b"), Some(owner.clone()), GenerationParams::default());
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();
        store.save(&second).await.unwrap();

        let ids: Vec<JobId> = store
            .jobs_for_owner(&owner)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![second.id.clone(), first.id.clone()]);

        assert!(store.mark(&first.id, "compute_enqueued").await.unwrap());
        assert!(!store.mark(&first.id, "compute_enqueued").await.unwrap());
        assert!(store.is_marked(&first.id, "compute_enqueued").await.unwrap());

        let ttl = Duration::from_secs(30);
        assert!(store.acquire_lease(&first.id, "1-0", ttl).await.unwrap());
        assert!(!store.acquire_lease(&first.id, "2-0", ttl).await.unwrap());
        store.release_lease(&first.id, "2-0").await.unwrap();
        assert!(!store.acquire_lease(&first.id, "2-0", ttl).await.unwrap());
        store.release_lease(&first.id, "1-0").await.unwrap();
        assert!(store.acquire_lease(&first.id, "2-0", ttl).await.unwrap());
    }
}
