//! Progress events via Redis Pub/Sub.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use mm_models::{JobId, ProgressUpdate};

use crate::error::QueueResult;

/// Pattern matching every job channel.
pub const JOB_CHANNEL_PATTERN: &str = "job:*";

/// Stream of progress updates for every job.
pub type ProgressFeed = Pin<Box<dyn Stream<Item = ProgressUpdate> + Send>>;

/// Destination for progress updates.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn publish(&self, update: &ProgressUpdate) -> QueueResult<()>;
}

/// Source of progress updates for the realtime gateway.
#[async_trait]
pub trait ProgressSource: Send + Sync {
    async fn subscribe_all(&self) -> QueueResult<ProgressFeed>;
}

/// Channel for publishing/subscribing to progress events.
pub struct ProgressChannel {
    client: redis::Client,
}

impl ProgressChannel {
    /// Create a new progress channel.
    pub fn new(redis_url: &str) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    /// Get the channel name for a job.
    pub fn channel_name(job_id: &JobId) -> String {
        format!("job:{}", job_id)
    }
}

#[async_trait]
impl ProgressSink for ProgressChannel {
    async fn publish(&self, update: &ProgressUpdate) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let channel = Self::channel_name(&update.job_id);
        let payload = serde_json::to_string(update)?;

        debug!("Publishing progress event to {}", channel);
        conn.publish::<_, _, ()>(channel, payload).await?;

        Ok(())
    }
}

#[async_trait]
impl ProgressSource for ProgressChannel {
    /// Pattern-subscribe to every job channel.
    async fn subscribe_all(&self) -> QueueResult<ProgressFeed> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(JOB_CHANNEL_PATTERN).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            match serde_json::from_str(&payload) {
                Ok(update) => Some(update),
                Err(e) => {
                    warn!(channel = %msg.get_channel_name(), "Dropping malformed progress event: {}", e);
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

/// In-process progress bus backed by a broadcast channel.
#[derive(Debug, Clone)]
pub struct MemoryProgressBus {
    sender: broadcast::Sender<ProgressUpdate>,
}

impl MemoryProgressBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Raw receiver, for tests that want every event.
    pub fn receiver(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.sender.subscribe()
    }
}

impl Default for MemoryProgressBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ProgressSink for MemoryProgressBus {
    async fn publish(&self, update: &ProgressUpdate) -> QueueResult<()> {
        // No subscribers is not an error; delivery is best-effort.
        let _ = self.sender.send(update.clone());
        Ok(())
    }
}

#[async_trait]
impl ProgressSource for MemoryProgressBus {
    async fn subscribe_all(&self) -> QueueResult<ProgressFeed> {
        let receiver = self.sender.subscribe();
        let stream = futures_util::stream::unfold(receiver, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(update) => return Some((update, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Progress subscriber lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mm_models::JobStatus;

    fn update(job: &str, progress: u8) -> ProgressUpdate {
        ProgressUpdate {
            job_id: JobId::from(job),
            owner_id: Some("u".into()),
            status: JobStatus::Processing,
            progress,
            stage: None,
            message: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_channel_name() {
        assert_eq!(ProgressChannel::channel_name(&JobId::from("abc")), "job:abc");
    }

    #[tokio::test]
    async fn test_memory_bus_delivers_in_order() {
        let bus = MemoryProgressBus::new(16);
        let mut feed = bus.subscribe_all().await.unwrap();
        bus.publish(&update("a", 10)).await.unwrap();
        bus.publish(&update("a", 20)).await.unwrap();

        assert_eq!(feed.next().await.unwrap().progress, 10);
        assert_eq!(feed.next().await.unwrap().progress, 20);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = MemoryProgressBus::new(4);
        assert!(bus.publish(&update("a", 1)).await.is_ok());
    }
}
