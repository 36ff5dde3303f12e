//! HTTP client for the llama.cpp server.
//!
//! The server streams `POST /completion` output as server-sent events:
//!
//! ```text
//! data: {"content":"Hel","stop":false}
//!
//! data: {"content":"","stop":true,"stopped_eos":true,"tokens_predicted":2,"tokens_evaluated":9}
//! ```
//!
//! The last event has `stop: true` and says why generation ended.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use llamabridge_core::config::EngineConfig;
use llamabridge_core::{
    BridgeError, Engine, GenerationEvent, GenerationStream, SamplingConfig, StopReason, Usage,
};

use crate::error::{EngineClientError, Result};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Connection settings for one llama.cpp server.
#[derive(Debug, Clone)]
pub struct LlamaCppConfig {
    /// Server root, e.g. `http://127.0.0.1:8080`.
    pub base_url: String,
    /// Name reported for the loaded model.
    pub model_id: String,
    pub connect_timeout: Duration,
    /// Let the server reuse the KV cache of a shared prompt prefix.
    pub cache_prompt: bool,
}

impl Default for LlamaCppConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".into(),
            model_id: "local-model".into(),
            connect_timeout: Duration::from_secs(10),
            cache_prompt: true,
        }
    }
}

impl From<&EngineConfig> for LlamaCppConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            model_id: config.model_id.clone(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Stream parsing
// ---------------------------------------------------------------------------

/// One `data:` payload of the completion stream.
#[derive(Debug, Default, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
    #[serde(default)]
    stopped_eos: bool,
    #[serde(default)]
    stopped_word: bool,
    #[serde(default)]
    stopped_limit: bool,
    /// Newer servers: `eos`, `word`, `limit` or `none`.
    #[serde(default)]
    stop_type: Option<String>,
    #[serde(default)]
    tokens_evaluated: Option<u32>,
    #[serde(default)]
    tokens_predicted: Option<u32>,
    #[serde(default)]
    error: Option<Value>,
}

impl CompletionChunk {
    fn stop_reason(&self) -> StopReason {
        match self.stop_type.as_deref() {
            Some("limit") => return StopReason::MaxTokens,
            Some("word") => return StopReason::StopSequence,
            Some("eos") => return StopReason::EndOfSequence,
            _ => {}
        }
        if self.stopped_limit {
            StopReason::MaxTokens
        } else if self.stopped_word {
            StopReason::StopSequence
        } else {
            StopReason::EndOfSequence
        }
    }
}

/// Turns llama.cpp SSE lines into generation events.
#[derive(Debug, Default)]
pub struct LlamaStreamParser {
    fragments: u32,
    finished: bool,
}

impl LlamaStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once the terminal event was parsed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one line (with or without its line ending).
    ///
    /// Returns `Ok(Some(event))` for content and the terminal event,
    /// `Ok(None)` for blank lines, comments and other SSE fields.
    pub fn feed_line(&mut self, line: &[u8]) -> Result<Option<GenerationEvent>> {
        let line = std::str::from_utf8(line).map_err(|e| EngineClientError::Stream {
            reason: format!("invalid UTF-8 in stream: {e}"),
        })?;
        let line = line.trim_end();

        if line.is_empty() || line.starts_with(':') {
            return Ok(None);
        }
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim();
        if data == "[DONE]" {
            return Ok(None);
        }

        let chunk: CompletionChunk =
            serde_json::from_str(data).map_err(|e| EngineClientError::Parse {
                reason: format!("invalid JSON in stream data: {e}"),
            })?;

        if let Some(error) = &chunk.error {
            return Err(EngineClientError::Stream {
                reason: error_message(error),
            });
        }

        if !chunk.stop {
            if chunk.content.is_empty() {
                return Ok(None);
            }
            self.fragments += 1;
            return Ok(Some(GenerationEvent::fragment(chunk.content)));
        }

        self.finished = true;
        let reason = chunk.stop_reason();
        let mut event = GenerationEvent {
            text: chunk.content.clone(),
            stop: Some(reason),
            usage: None,
        };
        if chunk.tokens_evaluated.is_some() || chunk.tokens_predicted.is_some() {
            event = event.with_usage(Usage {
                prompt_tokens: chunk.tokens_evaluated.unwrap_or_default(),
                completion_tokens: chunk.tokens_predicted.unwrap_or(self.fragments),
            });
        }
        Ok(Some(event))
    }
}

fn error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .map(str::to_owned)
        .unwrap_or_else(|| error.to_string())
}

/// Pull the vector out of an embedding response.
///
/// Older servers answer `{"embedding": [..]}`; newer ones answer
/// `[{"index": 0, "embedding": [[..]]}]`.
fn parse_embedding(value: &Value) -> Option<Vec<f32>> {
    let embedding = match value {
        Value::Array(items) => items.first()?.get("embedding")?,
        other => other.get("embedding")?,
    };
    let values = match embedding.as_array()?.first() {
        Some(Value::Array(inner)) => inner,
        _ => embedding.as_array()?,
    };
    values
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// An [`Engine`] backed by a llama.cpp server.
#[derive(Debug, Clone)]
pub struct LlamaCppEngine {
    http: reqwest::Client,
    completion_url: Url,
    embedding_url: Url,
    model_id: String,
    cache_prompt: bool,
}

impl LlamaCppEngine {
    pub fn new(config: LlamaCppConfig) -> Result<Self> {
        let mut base = config.base_url.trim().to_owned();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base).map_err(|e| EngineClientError::InvalidUrl {
            reason: format!("{}: {e}", config.base_url),
        })?;
        let join = |path: &str| {
            base.join(path).map_err(|e| EngineClientError::InvalidUrl {
                reason: format!("{path}: {e}"),
            })
        };

        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| EngineClientError::RequestFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            completion_url: join("completion")?,
            embedding_url: join("embedding")?,
            model_id: config.model_id,
            cache_prompt: config.cache_prompt,
        })
    }

    /// The `/completion` endpoint this engine posts to.
    pub fn completion_url(&self) -> &Url {
        &self.completion_url
    }

    /// Request body for `/completion`.
    pub fn request_body(&self, prompt: &str, stop: &[String], sampling: &SamplingConfig) -> Value {
        let mut body = json!({
            "prompt": prompt,
            "stream": true,
            "n_predict": sampling.max_tokens,
            "temperature": sampling.temperature,
            "top_p": sampling.top_p,
            "stop": stop,
            "cache_prompt": self.cache_prompt,
        });
        let optional = [
            ("top_k", sampling.top_k.map(Value::from)),
            ("repeat_penalty", sampling.repeat_penalty.map(Value::from)),
            ("presence_penalty", sampling.presence_penalty.map(Value::from)),
            ("frequency_penalty", sampling.frequency_penalty.map(Value::from)),
            ("seed", sampling.seed.map(Value::from)),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                body[key] = value;
            }
        }
        body
    }

    async fn post(&self, url: &Url, body: &Value) -> Result<reqwest::Response> {
        let resp = self
            .http
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| EngineClientError::RequestFailed {
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl Engine for LlamaCppEngine {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(
        &self,
        prompt: &str,
        stop: &[String],
        sampling: &SamplingConfig,
    ) -> llamabridge_core::Result<GenerationStream> {
        let body = self.request_body(prompt, stop, sampling);
        tracing::debug!(
            url = %self.completion_url,
            prompt_len = prompt.len(),
            n_predict = sampling.max_tokens,
            "starting llama.cpp completion"
        );
        let resp = self.post(&self.completion_url, &body).await?;
        let mut bytes = resp.bytes_stream();

        let stream = async_stream::stream! {
            let mut parser = LlamaStreamParser::new();
            let mut buffer: Vec<u8> = Vec::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(BridgeError::from(EngineClientError::Stream {
                            reason: format!("stream read error: {e}"),
                        }));
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline).collect();
                    match parser.feed_line(&line) {
                        Ok(Some(event)) => {
                            let last = event.is_final();
                            yield Ok(event);
                            if last {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            yield Err(BridgeError::from(e));
                            return;
                        }
                    }
                }
            }

            // A final line may arrive without its newline.
            match parser.feed_line(&buffer) {
                Ok(Some(event)) if event.is_final() => {
                    yield Ok(event);
                    return;
                }
                Ok(Some(event)) => yield Ok(event),
                Ok(None) => {}
                Err(e) => {
                    yield Err(BridgeError::from(e));
                    return;
                }
            }
            yield Err(BridgeError::from(EngineClientError::Stream {
                reason: "stream ended before a stop event".into(),
            }));
        };
        Ok(stream.boxed())
    }

    async fn embed(&self, inputs: &[String]) -> llamabridge_core::Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(inputs.len());
        for input in inputs {
            let resp = self
                .post(&self.embedding_url, &json!({ "content": input }))
                .await?;
            let value: Value = resp.json().await.map_err(|e| EngineClientError::Parse {
                reason: format!("invalid embedding response: {e}"),
            })?;
            let vector = parse_embedding(&value).ok_or_else(|| EngineClientError::Parse {
                reason: "embedding response has no numeric `embedding` array".into(),
            })?;
            vectors.push(vector);
        }
        tracing::debug!(inputs = inputs.len(), "llama.cpp embeddings computed");
        Ok(vectors)
    }
}
