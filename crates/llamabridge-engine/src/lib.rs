//! llama.cpp backend for llamabridge.
//!
//! [`LlamaCppEngine`] drives a running llama.cpp `server` over HTTP: prompts
//! go to `POST /completion` with streaming enabled and the server-sent events
//! come back as [`GenerationEvent`](llamabridge_core::GenerationEvent)s.
//! Embeddings use `POST /embedding`.

pub mod error;
pub mod llama_cpp;

pub use error::{EngineClientError, Result};
pub use llama_cpp::{LlamaCppConfig, LlamaCppEngine, LlamaStreamParser};
