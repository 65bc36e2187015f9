//! Realtime gateway: owner-keyed connection registry and progress fan-out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use mm_models::{ProgressUpdate, ServerMessage};
use mm_queue::ProgressSource;

use crate::metrics;

/// Identifies one live socket of a user.
pub type ConnectionId = Uuid;

/// Delay before re-subscribing after the progress feed ends.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

/// Live connections keyed by identity, then by connection id.
///
/// An identity entry exists only while it has at least one connection.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, HashMap<ConnectionId, mpsc::Sender<ServerMessage>>>>,
    buffer: usize,
}

/// Snapshot for `GET /api/ws/stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub total_connections: usize,
    pub total_users: usize,
    pub users: HashMap<String, usize>,
}

impl ConnectionRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Register a connection and return its id with the receiving end of its
    /// outbound queue.
    pub async fn register(&self, identity: &str) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();
        let total = {
            let mut connections = self.connections.write().await;
            connections.entry(identity.to_string()).or_default().insert(id, tx);
            connections.values().map(HashMap::len).sum::<usize>()
        };
        metrics::set_ws_active_connections(total);
        info!(user = %identity, connection = %id, "WebSocket client registered");
        (id, rx)
    }

    /// Remove a connection; the identity goes with its last connection.
    pub async fn unregister(&self, identity: &str, id: ConnectionId) {
        let total = {
            let mut connections = self.connections.write().await;
            if let Some(user) = connections.get_mut(identity) {
                user.remove(&id);
                if user.is_empty() {
                    connections.remove(identity);
                }
            }
            connections.values().map(HashMap::len).sum::<usize>()
        };
        metrics::set_ws_active_connections(total);
        info!(user = %identity, connection = %id, "WebSocket client disconnected");
    }

    /// Forward an update to every connection of the job's owner. Returns the
    /// number of connections it was queued on.
    ///
    /// Updates without an owner are dropped. A connection whose queue is full
    /// misses the update; a closed one is pruned.
    pub async fn dispatch(&self, update: &ProgressUpdate) -> usize {
        let Some(owner) = update.owner_id.as_deref() else {
            debug!(job_id = %update.job_id, "Dropping progress update without owner");
            return 0;
        };

        let message = ServerMessage::progress(update);
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let connections = self.connections.read().await;
            let Some(user) = connections.get(owner) else {
                debug!(user = %owner, job_id = %update.job_id, "No clients connected for user");
                return 0;
            };
            for (id, tx) in user {
                match tx.try_send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(user = %owner, connection = %id, "WebSocket send buffer full, dropping update");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        for id in closed {
            self.unregister(owner, id).await;
        }
        if delivered > 0 {
            metrics::record_ws_message_sent("progress", delivered);
        }
        delivered
    }

    pub async fn connection_count(&self, identity: &str) -> usize {
        self.connections
            .read()
            .await
            .get(identity)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub async fn stats(&self) -> GatewayStats {
        let connections = self.connections.read().await;
        let users: HashMap<String, usize> = connections
            .iter()
            .map(|(identity, conns)| (identity.clone(), conns.len()))
            .collect();
        GatewayStats {
            total_connections: users.values().sum(),
            total_users: users.len(),
            users,
        }
    }
}

/// Feed every published progress update into the registry until the task is
/// aborted. Re-subscribes when the feed ends or cannot be opened.
pub fn spawn_dispatcher(
    registry: Arc<ConnectionRegistry>,
    source: Arc<dyn ProgressSource>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match source.subscribe_all().await {
                Ok(mut feed) => {
                    info!("Gateway subscribed to job progress channels");
                    while let Some(update) = feed.next().await {
                        registry.dispatch(&update).await;
                    }
                    warn!("Progress feed ended, re-subscribing");
                }
                Err(e) => warn!("Failed to subscribe to progress channels: {}", e),
            }
            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
        }
    })
}
