//! Completion adapter.
//!
//! Owns the lifecycle of one chat completion: validate the request, compose
//! the prompt, run the engine, and read the output through a
//! [`FunctionCallExtractor`].  Non-streaming callers get one
//! [`CompletionResult`]; streaming callers get a lazy [`ChunkStream`] that
//! only pulls from the engine when the transport asks for the next chunk.
//!
//! Engine access is gated by a semaphore sized from
//! `engine.max_concurrent`.  The permit lives as long as the generation, so
//! dropping a chunk stream (client went away) frees the engine.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::engine::Engine;
use crate::error::{BridgeError, Result};
use crate::extract::{Emission, FunctionCallExtractor};
use crate::prompt::{ComposedPrompt, PromptComposer};
use crate::types::{
    CompletionRequest, DeclarationStyle, ExtractedIntent, FinishReason, Role, StopReason, Usage,
    estimate_tokens,
};

// ---------------------------------------------------------------------------
// Results and chunks
// ---------------------------------------------------------------------------

/// Outcome of a non-streaming completion.  Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResult {
    pub id: String,
    /// Unix timestamp (seconds).
    pub created: i64,
    pub model: String,
    pub intent: ExtractedIntent,
    pub stop_reason: StopReason,
    pub usage: Usage,
    pub style: DeclarationStyle,
    /// Id reported for the call in `tool_calls`.
    pub tool_call_id: String,
}

impl CompletionResult {
    pub fn finish_reason(&self) -> FinishReason {
        FinishReason::resolve(self.stop_reason, self.intent.call().is_some(), self.style)
    }
}

/// Fields shared by every chunk of one streamed response.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMeta {
    pub id: String,
    pub created: i64,
    pub model: String,
    pub style: DeclarationStyle,
    pub tool_call_id: String,
}

/// One incremental unit of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseChunk {
    pub meta: Arc<ChunkMeta>,
    /// Position in the stream, starting at 0.
    pub index: u64,
    pub body: ChunkBody,
}

impl ResponseChunk {
    /// A finish or error chunk; nothing follows it.
    pub fn is_terminal(&self) -> bool {
        matches!(self.body, ChunkBody::Finish { .. } | ChunkBody::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkBody {
    Delta(ChunkDelta),
    /// Last chunk of a clean stream.
    Finish {
        reason: FinishReason,
        usage: Option<Usage>,
    },
    /// Last chunk of a stream the engine broke off.
    Error(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkDelta {
    pub role: Option<Role>,
    pub content: Option<String>,
    pub call: Option<CallFragment>,
}

/// Part of a function call.  The name arrives first, then the arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallFragment {
    pub name: Option<String>,
    pub arguments: Option<String>,
    pub malformed: bool,
}

/// Lazily produced chunks of one response.
pub type ChunkStream = BoxStream<'static, ResponseChunk>;

/// Numbers chunks as they are produced.
struct ChunkBuilder {
    meta: Arc<ChunkMeta>,
    next_index: u64,
}

impl ChunkBuilder {
    fn next(&mut self, body: ChunkBody) -> ResponseChunk {
        let chunk = ResponseChunk {
            meta: Arc::clone(&self.meta),
            index: self.next_index,
            body,
        };
        self.next_index += 1;
        chunk
    }

    fn emission(&mut self, emission: Emission) -> Vec<ResponseChunk> {
        match emission {
            Emission::Text(text) => vec![self.next(ChunkBody::Delta(ChunkDelta {
                content: Some(text),
                ..ChunkDelta::default()
            }))],
            Emission::Call(call) => {
                let name = self.next(ChunkBody::Delta(ChunkDelta {
                    call: Some(CallFragment {
                        name: Some(call.name.clone()),
                        arguments: Some(String::new()),
                        malformed: false,
                    }),
                    ..ChunkDelta::default()
                }));
                let arguments = self.next(ChunkBody::Delta(ChunkDelta {
                    call: Some(CallFragment {
                        name: None,
                        arguments: Some(call.arguments.to_wire()),
                        malformed: call.malformed,
                    }),
                    ..ChunkDelta::default()
                }));
                vec![name, arguments]
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Runs chat completions against one engine.  Cheap to clone.
#[derive(Clone)]
pub struct CompletionAdapter {
    engine: Arc<dyn Engine>,
    composer: PromptComposer,
    config: Arc<BridgeConfig>,
    permits: Arc<Semaphore>,
}

impl CompletionAdapter {
    /// Build an adapter; fails if the prompt or call syntax configuration
    /// does not resolve.
    pub fn new(engine: Arc<dyn Engine>, config: Arc<BridgeConfig>) -> Result<Self> {
        let composer = PromptComposer::new(
            config.prompt.resolve()?,
            config.function_call.resolve()?,
        );
        let permits = Arc::new(Semaphore::new(config.engine.max_concurrent.max(1)));
        Ok(Self {
            engine,
            composer,
            config,
            permits,
        })
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn composer(&self) -> &PromptComposer {
        &self.composer
    }

    /// Reject requests that cannot be served, before touching the engine.
    pub fn validate(request: &CompletionRequest) -> Result<()> {
        if request.messages.is_empty() {
            return Err(BridgeError::invalid("messages must not be empty"));
        }

        let mut seen = HashSet::new();
        for function in &request.functions {
            if function.name.trim().is_empty() {
                return Err(BridgeError::invalid("function names must not be empty"));
            }
            if !seen.insert(function.name.as_str()) {
                return Err(BridgeError::invalid(format!(
                    "duplicate function name '{}'",
                    function.name
                )));
            }
        }

        for (index, message) in request.messages.iter().enumerate() {
            if message.role == Role::Function && message.name.is_none() {
                return Err(BridgeError::invalid(format!(
                    "messages[{index}]: function message requires a name"
                )));
            }
        }

        let sampling = &request.sampling;
        if sampling.max_tokens == 0 {
            return Err(BridgeError::invalid("max_tokens must be positive"));
        }
        if !(sampling.temperature.is_finite() && sampling.temperature >= 0.0) {
            return Err(BridgeError::invalid("temperature must be a non-negative number"));
        }
        if !(sampling.top_p.is_finite() && (0.0..=1.0).contains(&sampling.top_p)) {
            return Err(BridgeError::invalid("top_p must be within 0..=1"));
        }
        Ok(())
    }

    /// Validate and compose.  Exposed for `llamabridge render`.
    pub fn prepare(&self, request: &CompletionRequest) -> Result<ComposedPrompt> {
        Self::validate(request)?;
        self.composer
            .compose(&request.messages, &request.functions, &request.sampling.stop)
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| BridgeError::engine("engine is shutting down"))
    }

    /// Run a completion to the end and return the parsed result.
    pub async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResult> {
        let composed = self.prepare(request)?;
        let id = completion_id();
        tracing::info!(
            request_id = %id,
            model = %request.model,
            messages = request.messages.len(),
            functions = request.functions.len(),
            stream = false,
            "completion started"
        );

        let _permit = self.acquire().await?;
        let mut events = self
            .engine
            .generate(&composed.prompt, &composed.stop, &request.sampling)
            .await?;

        let mut extractor = FunctionCallExtractor::new(self.composer.syntax().clone());
        let mut generated = String::new();
        let mut outcome = None;
        while let Some(event) = events.next().await {
            let event = event.inspect_err(|e| {
                tracing::warn!(request_id = %id, error = %e, "generation failed");
            })?;
            generated.push_str(&event.text);
            extractor.feed(&event.text);
            if let Some(stop) = event.stop {
                outcome = Some((stop, event.usage));
                break;
            }
        }
        extractor.finish();

        let (stop_reason, reported) = outcome.unwrap_or_else(|| {
            tracing::warn!(request_id = %id, "engine stream ended without a stop reason");
            (StopReason::EndOfSequence, None)
        });
        let usage = reported.unwrap_or_else(|| estimate_usage(&composed.prompt, &generated));

        let result = CompletionResult {
            id,
            created: chrono::Utc::now().timestamp(),
            model: request.model.clone(),
            intent: extractor.intent(),
            stop_reason,
            usage,
            style: request.style,
            tool_call_id: tool_call_id(),
        };
        tracing::info!(
            request_id = %result.id,
            finish_reason = ?result.finish_reason(),
            completion_tokens = usage.completion_tokens,
            "completion finished"
        );
        Ok(result)
    }

    /// Start a streaming completion.
    ///
    /// Validation, prompt composition and engine start-up happen before this
    /// returns, so their errors are ordinary `Err`s.  Later engine failures
    /// end the stream with a [`ChunkBody::Error`] chunk.  Once `cancel`
    /// fires, the stream stops pulling from the engine and ends without a
    /// finish chunk.
    pub async fn complete_stream(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkStream> {
        let composed = self.prepare(request)?;
        let meta = Arc::new(ChunkMeta {
            id: completion_id(),
            created: chrono::Utc::now().timestamp(),
            model: request.model.clone(),
            style: request.style,
            tool_call_id: tool_call_id(),
        });
        tracing::info!(
            request_id = %meta.id,
            model = %request.model,
            messages = request.messages.len(),
            functions = request.functions.len(),
            stream = true,
            "completion started"
        );

        let permit = self.acquire().await?;
        let mut events = self
            .engine
            .generate(&composed.prompt, &composed.stop, &request.sampling)
            .await?;

        let syntax = self.composer.syntax().clone();
        let include_usage = request.include_usage;
        let prompt = composed.prompt;

        let stream = async_stream::stream! {
            let _permit = permit;
            let request_id = meta.id.clone();
            let mut builder = ChunkBuilder { meta, next_index: 0 };
            let mut extractor = FunctionCallExtractor::new(syntax);
            let mut generated = String::new();
            let mut outcome = None;

            yield builder.next(ChunkBody::Delta(ChunkDelta {
                role: Some(Role::Assistant),
                ..ChunkDelta::default()
            }));

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::info!(request_id = %request_id, "stream cancelled");
                        return;
                    }
                    next = events.next() => next,
                };
                match next {
                    Some(Ok(event)) => {
                        generated.push_str(&event.text);
                        for emission in extractor.feed(&event.text) {
                            for chunk in builder.emission(emission) {
                                yield chunk;
                            }
                        }
                        if let Some(stop) = event.stop {
                            outcome = Some((stop, event.usage));
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(request_id = %request_id, error = %e, "generation failed mid-stream");
                        yield builder.next(ChunkBody::Error(e.to_string()));
                        return;
                    }
                    None => {
                        tracing::warn!(request_id = %request_id, "engine stream ended without a stop reason");
                        break;
                    }
                }
            }

            for emission in extractor.finish() {
                for chunk in builder.emission(emission) {
                    yield chunk;
                }
            }

            let (stop, reported) = outcome.unwrap_or((StopReason::EndOfSequence, None));
            let has_call = extractor.intent().call().is_some();
            let reason = FinishReason::resolve(stop, has_call, builder.meta.style);
            let usage = include_usage
                .then(|| reported.unwrap_or_else(|| estimate_usage(&prompt, &generated)));
            tracing::info!(request_id = %request_id, finish_reason = ?reason, "completion finished");
            yield builder.next(ChunkBody::Finish { reason, usage });
        };
        Ok(stream.boxed())
    }

    /// Embed inputs with the engine, under the same concurrency limit.
    pub async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Err(BridgeError::invalid("input must not be empty"));
        }
        let _permit = self.acquire().await?;
        self.engine.embed(inputs).await
    }
}

fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::now_v7().simple())
}

fn tool_call_id() -> String {
    format!("call_{}", Uuid::now_v7().simple())
}

fn estimate_usage(prompt: &str, generated: &str) -> Usage {
    Usage {
        prompt_tokens: estimate_tokens(prompt),
        completion_tokens: estimate_tokens(generated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, FunctionDeclaration, SamplingConfig};

    fn request(messages: Vec<ChatMessage>) -> CompletionRequest {
        CompletionRequest {
            model: "m".into(),
            messages,
            functions: Vec::new(),
            style: DeclarationStyle::Functions,
            sampling: SamplingConfig {
                temperature: 0.2,
                top_p: 0.95,
                max_tokens: 16,
                stop: Vec::new(),
                stream: false,
                top_k: None,
                repeat_penalty: None,
                presence_penalty: None,
                frequency_penalty: None,
                seed: None,
            },
            include_usage: false,
        }
    }

    fn declaration(name: &str) -> FunctionDeclaration {
        FunctionDeclaration {
            name: name.into(),
            description: String::new(),
            parameters: serde_json::json!({}),
        }
    }

    #[test]
    fn empty_conversation_is_invalid() {
        let err = CompletionAdapter::validate(&request(Vec::new())).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRequest { .. }));
    }

    #[test]
    fn duplicate_function_names_are_invalid() {
        let mut req = request(vec![ChatMessage::user("hi")]);
        req.functions = vec![declaration("a"), declaration("a")];
        let err = CompletionAdapter::validate(&req).unwrap_err();
        assert!(err.to_string().contains("duplicate function name 'a'"));
    }

    #[test]
    fn blank_function_name_is_invalid() {
        let mut req = request(vec![ChatMessage::user("hi")]);
        req.functions = vec![declaration(" ")];
        assert!(CompletionAdapter::validate(&req).is_err());
    }

    #[test]
    fn zero_max_tokens_is_invalid() {
        let mut req = request(vec![ChatMessage::user("hi")]);
        req.sampling.max_tokens = 0;
        assert!(CompletionAdapter::validate(&req).is_err());
    }

    #[test]
    fn nan_temperature_is_invalid() {
        let mut req = request(vec![ChatMessage::user("hi")]);
        req.sampling.temperature = f32::NAN;
        assert!(CompletionAdapter::validate(&req).is_err());
    }

    #[test]
    fn unnamed_function_message_is_invalid() {
        let mut result = ChatMessage::function_result("f", "ok");
        result.name = None;
        let req = request(vec![ChatMessage::user("hi"), result]);
        assert!(CompletionAdapter::validate(&req).is_err());
    }

    #[test]
    fn ids_carry_openai_prefixes() {
        assert!(completion_id().starts_with("chatcmpl-"));
        assert!(tool_call_id().starts_with("call_"));
        assert_ne!(completion_id(), completion_id());
    }
}
