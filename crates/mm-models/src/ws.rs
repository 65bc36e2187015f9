//! Realtime client protocol.
//!
//! Server messages are flat JSON objects
//! `{type, jobId, status, progress, stage, message, timestamp}` with the
//! fields that do not apply omitted.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{JobId, JobStatus, ProgressUpdate};

/// Server message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessageType {
    /// Welcome message after a successful handshake
    Connected,
    /// Job progress update
    Progress,
    /// Reply to a client ping
    Pong,
    /// Subscribe acknowledgement
    Subscribed,
    /// Unsubscribe acknowledgement
    Unsubscribed,
    /// Protocol error
    Error,
}

impl ServerMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerMessageType::Connected => "connected",
            ServerMessageType::Progress => "progress",
            ServerMessageType::Pong => "pong",
            ServerMessageType::Subscribed => "subscribed",
            ServerMessageType::Unsubscribed => "unsubscribed",
            ServerMessageType::Error => "error",
        }
    }
}

/// Message sent from the gateway to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: ServerMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ServerMessage {
    fn bare(kind: ServerMessageType) -> Self {
        Self {
            kind,
            job_id: None,
            status: None,
            progress: None,
            stage: None,
            message: None,
            timestamp: Utc::now(),
        }
    }

    /// Welcome message.
    pub fn connected(identity: &str) -> Self {
        Self {
            message: Some(format!("Connected as {identity}")),
            ..Self::bare(ServerMessageType::Connected)
        }
    }

    /// Progress message for a published update.
    pub fn progress(update: &ProgressUpdate) -> Self {
        Self {
            kind: ServerMessageType::Progress,
            job_id: Some(update.job_id.clone()),
            status: Some(update.status),
            progress: Some(update.progress.min(100)),
            stage: update.stage.clone(),
            message: update.message.clone(),
            timestamp: update.timestamp,
        }
    }

    pub fn pong() -> Self {
        Self::bare(ServerMessageType::Pong)
    }

    pub fn subscribed(job_id: JobId) -> Self {
        Self {
            job_id: Some(job_id),
            ..Self::bare(ServerMessageType::Subscribed)
        }
    }

    pub fn unsubscribed(job_id: JobId) -> Self {
        Self {
            job_id: Some(job_id),
            ..Self::bare(ServerMessageType::Unsubscribed)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::bare(ServerMessageType::Error)
        }
    }
}

/// Message sent from a client to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Subscribe {
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
    Unsubscribe {
        #[serde(rename = "jobId")]
        job_id: JobId,
    },
}

impl ClientMessage {
    /// The reply owed to this message. Subscriptions are acknowledged only;
    /// delivery is routed by owner identity.
    pub fn reply(self) -> ServerMessage {
        match self {
            ClientMessage::Ping => ServerMessage::pong(),
            ClientMessage::Subscribe { job_id } => ServerMessage::subscribed(job_id),
            ClientMessage::Unsubscribe { job_id } => ServerMessage::unsubscribed(job_id),
        }
    }
}
