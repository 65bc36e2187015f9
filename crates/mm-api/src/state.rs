//! Application state.

use std::sync::Arc;

use mm_queue::{
    ProgressChannel, ProgressSource, QueueConfig, QueueManager, QueueResult, RateLimiter,
    RedisBucketStore, RedisJobQueue, RedisJobStore,
};
use mm_storage::{LocalFsStore, ObjectStore};

use crate::auth::JwtKeys;
use crate::config::ApiConfig;
use crate::gateway::ConnectionRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub manager: QueueManager,
    pub rate_limiter: RateLimiter,
    pub objects: Arc<dyn ObjectStore>,
    pub progress: Arc<dyn ProgressSource>,
    pub jwt: Arc<JwtKeys>,
    pub gateway: Arc<ConnectionRegistry>,
}

impl AppState {
    /// Assemble state from already-built collaborators.
    pub fn new(
        config: ApiConfig,
        manager: QueueManager,
        rate_limiter: RateLimiter,
        objects: Arc<dyn ObjectStore>,
        progress: Arc<dyn ProgressSource>,
    ) -> Self {
        let jwt = Arc::new(JwtKeys::new(&config.jwt_secret));
        let gateway = Arc::new(ConnectionRegistry::new(config.ws_send_buffer));
        Self {
            config,
            manager,
            rate_limiter,
            objects,
            progress,
            jwt,
            gateway,
        }
    }

    /// Production wiring: Redis for queues, records, buckets and pub/sub;
    /// the local filesystem for objects.
    pub fn connect(config: ApiConfig) -> QueueResult<Self> {
        let queue = RedisJobQueue::new(QueueConfig {
            redis_url: config.redis_url.clone(),
            ..QueueConfig::from_env()
        })?;
        let store = RedisJobStore::new(&config.redis_url)?;
        let buckets = RedisBucketStore::new(&config.redis_url)?;
        let progress = ProgressChannel::new(&config.redis_url)?;

        let manager = QueueManager::new(Arc::new(queue), Arc::new(store));
        let rate_limiter = RateLimiter::new(Arc::new(buckets), config.rate_limit.clone());

        Ok(Self::new(
            config,
            manager,
            rate_limiter,
            Arc::new(LocalFsStore::from_env()),
            Arc::new(progress),
        ))
    }
}
