//! HTTP surface of llamabridge.
//!
//! This crate serves the OpenAI-compatible API over axum:
//!
//! - `POST /v1/chat/completions` -- chat completions, plain or streamed as
//!   server-sent events.
//! - `POST /v1/embeddings` -- embeddings, when the engine provides them.
//! - `GET /v1/models` -- the served model.
//! - `GET /health` -- liveness and version.

use std::time::Duration;

use llamabridge_core::config::ServerConfig;

pub mod api;
pub mod server;
pub mod state;

pub use server::WebServer;
pub use state::AppState;

/// Web server configuration.
#[derive(Debug, Clone)]
pub struct WebConfig {
    /// The address to bind the HTTP server to.
    pub bind_addr: String,
    /// The port to listen on.
    pub port: u16,
    /// Upper bound on one request; streamed responses are cut off when it
    /// elapses.
    pub request_timeout: Option<Duration>,
    /// Whether to answer cross-origin requests.
    pub cors: bool,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            port: 8000,
            request_timeout: Some(Duration::from_secs(300)),
            cors: true,
        }
    }
}

impl From<&ServerConfig> for WebConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            bind_addr: config.bind_addr.clone(),
            port: config.port,
            request_timeout: (config.request_timeout_secs > 0)
                .then(|| Duration::from_secs(config.request_timeout_secs)),
            cors: config.cors,
        }
    }
}
