//! Axum HTTP/WS API server.
//!
//! This crate provides:
//! - Rate-limited job admission and status queries
//! - The realtime gateway fanning progress out to job owners
//! - Operator endpoints for rate limits and queues
//! - Prometheus metrics

pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod security;
pub mod state;
pub mod ws;

pub use auth::{AuthUser, Claims, JwtKeys};
pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use gateway::{spawn_dispatcher, ConnectionRegistry, GatewayStats};
pub use routes::create_router;
pub use state::AppState;
