//! Main web server setup and startup.
//!
//! [`WebServer`] composes the axum router, registers all routes, and runs
//! the HTTP listener.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::http::Method;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use llamabridge_core::CompletionAdapter;

use crate::WebConfig;
use crate::api;
use crate::state::AppState;

/// The llamabridge HTTP server.
pub struct WebServer {
    config: WebConfig,
    state: Arc<AppState>,
}

impl WebServer {
    /// Create a server around a completion adapter.
    pub fn new(config: WebConfig, adapter: CompletionAdapter) -> Self {
        let state = Arc::new(AppState::new(adapter, config.clone()));
        Self { config, state }
    }

    /// Return the `host:port` string this server will bind to.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.config.bind_addr, self.config.port)
    }

    /// Build the axum router with all routes registered.
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/v1/chat/completions", post(api::chat_completions))
            .route("/v1/embeddings", post(api::embeddings))
            .route("/v1/models", get(api::models))
            .route("/health", get(api::health))
            .fallback(api::not_found);

        let router = if self.config.cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any);
            router.layer(cors)
        } else {
            router
        };

        router.with_state(Arc::clone(&self.state))
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let router = self.router();
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(
                addr = %addr,
                model = %self.state.model_id(),
                "starting web server"
            );
        }
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
    }

    /// Bind the configured address and serve until Ctrl-C.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP listener cannot be bound.
    pub async fn start(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr()).await?;
        self.serve(listener, async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
            }
        })
        .await
    }
}
