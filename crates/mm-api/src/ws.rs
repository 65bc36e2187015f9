//! WebSocket endpoint for live job progress.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use tokio::time::interval;
use tracing::{debug, warn};

use mm_models::{ClientMessage, ServerMessage};

use crate::auth::{request_token, AuthUser};
use crate::error::{ApiError, ApiResult};
use crate::gateway::GatewayStats;
use crate::metrics;
use crate::state::AppState;

/// Identity resolved at handshake. Rejection happens before the upgrade, so
/// unauthenticated clients are never registered.
pub struct WsIdentity(pub AuthUser);

#[axum::async_trait]
impl FromRequestParts<AppState> for WsIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(token) = request_token(parts, state).await else {
            metrics::record_ws_auth_failure();
            warn!("WebSocket connection rejected: no token");
            return Err(ApiError::unauthorized("Missing token"));
        };
        match state.jwt.verify(&token) {
            Ok(claims) => Ok(WsIdentity(AuthUser::from(claims))),
            Err(e) => {
                metrics::record_ws_auth_failure();
                warn!("WebSocket connection rejected: invalid token");
                Err(e)
            }
        }
    }
}

/// `GET /ws`: authenticate, then upgrade.
pub async fn ws_handler(
    WsIdentity(user): WsIdentity,
    State(state): State<AppState>,
    ws: Option<WebSocketUpgrade>,
) -> ApiResult<Response> {
    let ws = ws.ok_or_else(|| ApiError::bad_request("Expected a WebSocket upgrade request"))?;
    metrics::record_ws_connection();
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, user.user_id))
        .into_response())
}

/// `GET /api/ws/stats`: connection counts per user.
pub async fn ws_stats(State(state): State<AppState>) -> Json<GatewayStats> {
    Json(state.gateway.stats().await)
}

/// Reply owed to one client text frame.
pub fn reply_to_frame(text: &str) -> ServerMessage {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message.reply(),
        Err(e) => {
            debug!("Unparsable client frame: {}", e);
            ServerMessage::error("Invalid message format")
        }
    }
}

fn encode(message: &ServerMessage) -> Option<Message> {
    serde_json::to_string(message).ok().map(Message::Text)
}

async fn handle_socket(socket: WebSocket, state: AppState, identity: String) {
    let (conn_id, mut outbound) = state.gateway.register(&identity).await;
    let (mut sender, mut receiver) = socket.split();

    let welcome = ServerMessage::connected(&identity);
    if let Some(frame) = encode(&welcome) {
        if sender.send(frame).await.is_err() {
            state.gateway.unregister(&identity, conn_id).await;
            return;
        }
    }

    let mut heartbeat = interval(state.config.ws_heartbeat_interval);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(message) = queued else { break };
                let Some(frame) = encode(&message) else { continue };
                if sender.send(frame).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        metrics::record_ws_message_received();
                        let reply = reply_to_frame(&text);
                        let Some(frame) = encode(&reply) else { continue };
                        if sender.send(frame).await.is_err() {
                            break;
                        }
                        metrics::record_ws_message_sent(reply.kind.as_str(), 1);
                    }
                    Some(Ok(Message::Binary(_))) => {
                        metrics::record_ws_message_received();
                        let Some(frame) = encode(&ServerMessage::error("Invalid message format")) else { continue };
                        if sender.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(user = %identity, "WebSocket receive error: {}", e);
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.gateway.unregister(&identity, conn_id).await;
}
