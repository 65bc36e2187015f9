//! API configuration.

use std::time::Duration;

use mm_queue::RateLimitConfig;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// CORS origins
    pub cors_origins: Vec<String>,
    /// Redis URL for queues, job records, rate limits and pub/sub
    pub redis_url: String,
    /// HS256 secret for access tokens
    pub jwt_secret: String,
    /// Per-identity job admission limit
    pub rate_limit: RateLimitConfig,
    /// Max request body size
    pub max_body_size: usize,
    /// Outbound message buffer per WebSocket connection
    pub ws_send_buffer: usize,
    /// Interval between server pings on idle sockets
    pub ws_heartbeat_interval: Duration,
    /// Environment (development/production)
    pub environment: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            cors_origins: vec!["*".to_string()],
            redis_url: "redis://127.0.0.1:6379".to_string(),
            jwt_secret: "dev-secret-change-me".to_string(),
            rate_limit: RateLimitConfig::default(),
            max_body_size: 1024 * 1024, // 1MB
            ws_send_buffer: 32,
            ws_heartbeat_interval: Duration::from_secs(30),
            environment: "development".to_string(),
        }
    }
}

impl ApiConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("API_HOST").unwrap_or(defaults.host),
            port: std::env::var("API_PORT")
                .or_else(|_| std::env::var("PORT"))
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.cors_origins),
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            jwt_secret: std::env::var("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            rate_limit: RateLimitConfig::from_env(),
            max_body_size: std::env::var("MAX_BODY_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_body_size),
            ws_send_buffer: std::env::var("WS_SEND_BUFFER")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.ws_send_buffer),
            ws_heartbeat_interval: Duration::from_secs(
                std::env::var("WS_HEARTBEAT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            environment: std::env::var("ENVIRONMENT").unwrap_or(defaults.environment),
        }
    }

    /// Check if running in production mode.
    pub fn is_production(&self) -> bool {
        self.environment.to_lowercase() == "production"
    }
}
