use std::env;

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub websocket_url: String,
    pub api_base_url: String,
    pub upload_url: String,
    /// Ceiling on consecutive connection attempts before the manager gives up
    /// and reports offline.
    pub max_connect_attempts: u32,
    /// First retry delay; doubled on each failed attempt up to `retry_delay_cap_ms`.
    pub retry_delay_ms: u64,
    pub retry_delay_cap_ms: u64,
    /// Per-attempt bound covering the socket handshake and the auth exchange.
    pub connect_timeout_ms: u64,
}

impl ChatConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            websocket_url: env::var("CHAT_WEBSOCKET_URL")
                .unwrap_or_else(|_| "ws://127.0.0.1:5001".to_string()),
            api_base_url: env::var("CHAT_API_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:5000/api".to_string()),
            upload_url: env::var("CHAT_UPLOAD_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:5000/api/uploads/audio".to_string()),
            max_connect_attempts: env::var("CHAT_MAX_CONNECT_ATTEMPTS")
                .ok().and_then(|v| v.parse().ok()).unwrap_or(3),
            retry_delay_ms: env::var("CHAT_RETRY_DELAY_MS")
                .ok().and_then(|v| v.parse().ok()).unwrap_or(2000),
            retry_delay_cap_ms: env::var("CHAT_RETRY_DELAY_CAP_MS")
                .ok().and_then(|v| v.parse().ok()).unwrap_or(30_000),
            connect_timeout_ms: env::var("CHAT_CONNECT_TIMEOUT_MS")
                .ok().and_then(|v| v.parse().ok()).unwrap_or(10_000),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
