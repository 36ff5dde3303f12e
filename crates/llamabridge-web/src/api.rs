//! OpenAI-compatible route handlers.
//!
//! Handlers translate between HTTP and the completion adapter.  Errors leave
//! as OpenAI error envelopes: request problems are `400`, engine failures
//! `500`, missing engine capabilities `501`.  Once a stream has started,
//! failures travel inside the stream instead.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use llamabridge_core::api::{
    ChatCompletionRequest, ChatCompletionResponse, EmbeddingRequest, EmbeddingResponse, ErrorBody,
    ModelList,
};
use llamabridge_core::types::estimate_tokens;
use llamabridge_core::{BridgeError, CompletionRequest, encode_stream};

use crate::state::AppState;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A [`BridgeError`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub BridgeError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            BridgeError::InvalidRequest { .. }
            | BridgeError::UnsupportedRole { .. }
            | BridgeError::Json(_) => StatusCode::BAD_REQUEST,
            BridgeError::EngineUnsupported { .. } => StatusCode::NOT_IMPLEMENTED,
            BridgeError::Engine { .. } | BridgeError::Config { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(BridgeError::invalid(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self.0, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self.0, "request rejected");
        }
        (status, Json(ErrorBody::from_error(&self.0))).into_response()
    }
}

// ---------------------------------------------------------------------------
// POST /v1/chat/completions
// ---------------------------------------------------------------------------

/// Run a chat completion, as one JSON body or as an event stream.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(wire) = body?;
    let request = wire.into_request(&state.adapter.config().sampling, state.model_id())?;

    if request.sampling.stream {
        stream_completion(&state, &request).await
    } else {
        let completion = state.adapter.complete(&request);
        let result = match state.config.request_timeout {
            Some(limit) => tokio::time::timeout(limit, completion)
                .await
                .map_err(|_| BridgeError::engine("generation timed out"))??,
            None => completion.await?,
        };
        Ok(Json(ChatCompletionResponse::from(&result)).into_response())
    }
}

async fn stream_completion(
    state: &AppState,
    request: &CompletionRequest,
) -> Result<Response, ApiError> {
    // The limit covers the wait for an engine permit as well as generation.
    let deadline = state
        .config
        .request_timeout
        .map(|limit| tokio::time::Instant::now() + limit);

    let cancel = CancellationToken::new();
    let started = state.adapter.complete_stream(request, cancel.clone());
    let chunks = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, started)
            .await
            .map_err(|_| BridgeError::engine("generation timed out"))??,
        None => started.await?,
    };

    if let Some(deadline) = deadline {
        let timer = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!("streaming request timed out");
                    timer.cancel();
                }
                _ = timer.cancelled() => {}
            }
        });
    }

    // Dropping the body (client disconnect) cancels the token and stops the
    // timer.
    let guard = cancel.drop_guard();
    let frames = encode_stream(chunks).map(move |frame| {
        let _ = &guard;
        Ok::<_, Infallible>(frame.to_sse())
    });

    Ok((
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Body::from_stream(frames),
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// POST /v1/embeddings
// ---------------------------------------------------------------------------

pub async fn embeddings(
    State(state): State<Arc<AppState>>,
    body: Result<Json<EmbeddingRequest>, JsonRejection>,
) -> Result<Json<EmbeddingResponse>, ApiError> {
    let Json(request) = body?;
    let inputs = request.input.into_vec();
    let vectors = state.adapter.embed(&inputs).await?;
    let prompt_tokens = inputs.iter().map(|input| estimate_tokens(input)).sum();
    let model = request
        .model
        .unwrap_or_else(|| state.model_id().to_owned());
    Ok(Json(EmbeddingResponse::new(model, vectors, prompt_tokens)))
}

// ---------------------------------------------------------------------------
// GET /v1/models, GET /health
// ---------------------------------------------------------------------------

pub async fn models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    Json(ModelList::single(state.model_id(), state.started_at))
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "model": state.model_id(),
    }))
}

pub async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody::new("invalid_request_error", "unknown endpoint")),
    )
        .into_response()
}
