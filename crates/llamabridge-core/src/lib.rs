//! Core of llamabridge: OpenAI-style chat completions over a local
//! text-completion model.
//!
//! ## Architecture
//!
//! ```text
//!  ChatCompletionRequest ──> CompletionAdapter ──> PromptComposer ──> Engine
//!                                   │                                   │
//!                                   │<────── GenerationEvent stream ────┘
//!                                   v
//!                         FunctionCallExtractor
//!                                   │
//!                 CompletionResult  │  ResponseChunk stream ──> encoder (SSE)
//! ```
//!
//! ## Modules
//!
//! - [`types`] -- Domain types: messages, sampling, generation events, intents.
//! - [`api`] -- OpenAI wire types and conversion at the boundary.
//! - [`prompt`] -- Prompt templates and composition.
//! - [`extract`] -- Function-call extraction state machine.
//! - [`engine`] -- The engine trait and the scripted engine.
//! - [`adapter`] -- Request lifecycle, streaming and concurrency limits.
//! - [`encoder`] -- Server-sent event framing.
//! - [`config`] -- TOML configuration with environment overrides.
//! - [`error`] -- Bridge error types.

pub mod adapter;
pub mod api;
pub mod config;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod extract;
pub mod prompt;
pub mod types;

// Re-export the most commonly used types at the crate root.
pub use adapter::{
    CallFragment, ChunkBody, ChunkDelta, ChunkMeta, ChunkStream, CompletionAdapter,
    CompletionResult, ResponseChunk,
};
pub use config::{BridgeConfig, EngineKind};
pub use encoder::{Frame, encode, encode_stream};
pub use engine::{Engine, GenerationStream, ScriptedEngine};
pub use error::{BridgeError, Result};
pub use extract::{
    ArgumentStyle, CallSyntax, Emission, ExtractorState, FunctionCallExtractor, extract,
};
pub use prompt::{ComposedPrompt, PromptComposer, PromptTemplate};
pub use types::{
    CallArguments, ChatMessage, CompletionRequest, DeclarationStyle, ExtractedIntent,
    FinishReason, FunctionCall, FunctionCallIntent, FunctionDeclaration, GenerationEvent, Role,
    SamplingConfig, StopReason, Usage,
};
