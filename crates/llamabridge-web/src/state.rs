//! Shared application state for the web server.
//!
//! [`AppState`] is wrapped in an `Arc` and shared across all request
//! handlers.  The completion adapter inside it holds the only engine handle.

use llamabridge_core::CompletionAdapter;

use crate::WebConfig;

/// Shared state accessible from every axum handler.
#[derive(Clone)]
pub struct AppState {
    /// Runs completions and embeddings against the engine.
    pub adapter: CompletionAdapter,

    /// Web server configuration.
    pub config: WebConfig,

    /// Unix time the server started, reported as the model's `created`.
    pub started_at: i64,
}

impl AppState {
    pub fn new(adapter: CompletionAdapter, config: WebConfig) -> Self {
        Self {
            adapter,
            config,
            started_at: chrono::Utc::now().timestamp(),
        }
    }

    /// The configured model name, used when a request does not name one.
    pub fn model_id(&self) -> &str {
        &self.adapter.config().engine.model_id
    }
}
