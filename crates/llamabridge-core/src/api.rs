//! OpenAI-compatible wire types.
//!
//! Request bodies are parsed leniently (optional fields, `stop` as a string
//! or an array, `content` as a string or text parts) and converted into the
//! checked [`CompletionRequest`] at this boundary.  Response types serialize
//! to exactly the shapes OpenAI clients expect.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::adapter::CompletionResult;
use crate::config::SamplingDefaults;
use crate::error::{BridgeError, Result};
use crate::types::{
    ChatMessage, CompletionRequest, DeclarationStyle, FinishReason, FunctionCall,
    FunctionCallIntent, FunctionDeclaration, Role, SamplingConfig, Usage,
};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Body of `POST /v1/chat/completions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<WireMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub functions: Option<Vec<FunctionDeclaration>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<WireTool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSpec>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// `stop` may be one string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSpec {
    One(String),
    Many(Vec<String>),
}

impl StopSpec {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(stop) => vec![stop],
            Self::Many(stops) => stops,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: bool,
}

/// A message as sent by the client.  The role stays a string until
/// conversion so unknown roles can be reported precisely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// Message content: plain text or a list of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl MessageContent {
    /// Text parts joined; other part types are rejected.
    fn into_text(self, index: usize) -> Result<String> {
        match self {
            Self::Text(text) => Ok(text),
            Self::Parts(parts) => {
                let mut text = String::new();
                for part in parts {
                    if part.kind != "text" {
                        return Err(BridgeError::invalid(format!(
                            "messages[{index}]: content part type '{}' is not supported",
                            part.kind
                        )));
                    }
                    text.push_str(part.text.as_deref().unwrap_or_default());
                }
                Ok(text)
            }
        }
    }
}

/// An entry of the `tools` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDeclaration,
}

impl ChatCompletionRequest {
    /// Convert into a checked request, filling sampling gaps from
    /// `defaults` and the model name from `default_model`.
    pub fn into_request(
        self,
        defaults: &SamplingDefaults,
        default_model: &str,
    ) -> Result<CompletionRequest> {
        let (functions, style) = match (self.functions, self.tools) {
            (Some(_), Some(_)) => {
                return Err(BridgeError::invalid(
                    "send either `functions` or `tools`, not both",
                ));
            }
            (Some(functions), None) => (functions, DeclarationStyle::Functions),
            (None, Some(tools)) => {
                let functions = tools
                    .into_iter()
                    .map(|tool| match tool.kind.as_str() {
                        "function" => Ok(tool.function),
                        other => Err(BridgeError::invalid(format!(
                            "tool type '{other}' is not supported"
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                (functions, DeclarationStyle::Tools)
            }
            (None, None) => (Vec::new(), DeclarationStyle::Functions),
        };

        let messages = convert_messages(self.messages)?;

        let sampling = SamplingConfig {
            temperature: self.temperature.unwrap_or(defaults.temperature),
            top_p: self.top_p.unwrap_or(defaults.top_p),
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            stop: self.stop.map(StopSpec::into_vec).unwrap_or_default(),
            stream: self.stream,
            top_k: self.top_k.or(defaults.top_k),
            repeat_penalty: self.repeat_penalty.or(defaults.repeat_penalty),
            presence_penalty: self.presence_penalty,
            frequency_penalty: self.frequency_penalty,
            seed: self.seed,
        };

        Ok(CompletionRequest {
            model: self
                .model
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| default_model.to_owned()),
            messages,
            functions,
            style,
            sampling,
            include_usage: self.stream_options.is_some_and(|o| o.include_usage),
        })
    }
}

/// Map wire messages to domain messages.
///
/// `tool` results often identify their function only by `tool_call_id`;
/// the name is recovered from the assistant turn that issued the call.
fn convert_messages(wire: Vec<WireMessage>) -> Result<Vec<ChatMessage>> {
    let mut call_names: HashMap<String, String> = HashMap::new();
    let mut messages = Vec::with_capacity(wire.len());

    for (index, message) in wire.into_iter().enumerate() {
        let role: Role = message.role.parse()?;
        let content = message
            .content
            .map(|content| content.into_text(index))
            .transpose()?;

        let mut function_call = message.function_call;
        if let Some(tool_calls) = message.tool_calls {
            for call in &tool_calls {
                call_names.insert(call.id.clone(), call.function.name.clone());
            }
            if function_call.is_none() {
                function_call = tool_calls.into_iter().next().map(|call| FunctionCall {
                    name: call.function.name,
                    arguments: call.function.arguments,
                });
            }
        }

        let name = message.name.or_else(|| {
            message
                .tool_call_id
                .as_ref()
                .and_then(|id| call_names.get(id).cloned())
        });

        messages.push(ChatMessage {
            role,
            content,
            name,
            function_call,
        });
    }
    Ok(messages)
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// A function call as OpenAI clients receive it: arguments are a
/// JSON-encoded string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFunctionCall {
    pub name: String,
    pub arguments: String,
    /// Only present (and `true`) when the call could not be read cleanly.
    #[serde(default, skip_serializing_if = "is_false")]
    pub malformed: bool,
}

impl From<&FunctionCallIntent> for WireFunctionCall {
    fn from(call: &FunctionCallIntent) -> Self {
        Self {
            name: call.name.clone(),
            arguments: call.arguments.to_wire(),
            malformed: call.malformed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: WireFunctionCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl From<Usage> for WireUsage {
    fn from(usage: Usage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens(),
        }
    }
}

/// Non-streaming response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: WireUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: String,
    pub content: Option<String>,
    pub function_call: Option<WireFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
}

impl From<&CompletionResult> for ChatCompletionResponse {
    fn from(result: &CompletionResult) -> Self {
        let call = result.intent.call();
        let function_call = call.map(WireFunctionCall::from);
        let tool_calls = match (result.style, &function_call) {
            (DeclarationStyle::Tools, Some(function)) => Some(vec![WireToolCall {
                id: result.tool_call_id.clone(),
                kind: "function".into(),
                function: function.clone(),
            }]),
            _ => None,
        };

        Self {
            id: result.id.clone(),
            object: "chat.completion".into(),
            created: result.created,
            model: result.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: Role::Assistant.as_str().into(),
                    content: result.intent.content().map(str::to_owned),
                    function_call,
                    tool_calls,
                },
                finish_reason: result.finish_reason(),
            }],
            usage: result.usage.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Stream chunks
// ---------------------------------------------------------------------------

/// One `chat.completion.chunk` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: WireDelta,
    pub finish_reason: Option<FinishReason>,
}

/// Incremental message content.  Absent fields are omitted, so the final
/// chunk serializes an empty `{}` delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCallFragment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallFragment>>,
}

/// Part of a streamed function call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallFragment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub malformed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFragment {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub function: FunctionCallFragment,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// OpenAI error envelope: `{"error": {"message", "type", ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub param: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

impl ErrorBody {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                kind: kind.into(),
                param: None,
                code: None,
            },
        }
    }

    /// The error type string for a bridge error.
    pub fn from_error(error: &BridgeError) -> Self {
        let kind = match error {
            BridgeError::InvalidRequest { .. }
            | BridgeError::UnsupportedRole { .. }
            | BridgeError::Json(_) => "invalid_request_error",
            BridgeError::Engine { .. } => "engine_error",
            BridgeError::EngineUnsupported { .. } => "not_implemented_error",
            BridgeError::Config { .. } => "server_error",
        };
        Self::new(kind, error.to_string())
    }
}

// ---------------------------------------------------------------------------
// Embeddings and models
// ---------------------------------------------------------------------------

/// Body of `POST /v1/embeddings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub input: EmbeddingInput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    One(String),
    Many(Vec<String>),
}

impl EmbeddingInput {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(input) => vec![input],
            Self::Many(inputs) => inputs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub object: String,
    pub data: Vec<EmbeddingData>,
    pub model: String,
    pub usage: EmbeddingUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingData {
    pub object: String,
    pub index: u32,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingUsage {
    pub prompt_tokens: u32,
    pub total_tokens: u32,
}

impl EmbeddingResponse {
    pub fn new(model: impl Into<String>, vectors: Vec<Vec<f32>>, prompt_tokens: u32) -> Self {
        let data = vectors
            .into_iter()
            .enumerate()
            .map(|(index, embedding)| EmbeddingData {
                object: "embedding".into(),
                index: index as u32,
                embedding,
            })
            .collect();
        Self {
            object: "list".into(),
            data,
            model: model.into(),
            usage: EmbeddingUsage {
                prompt_tokens,
                total_tokens: prompt_tokens,
            },
        }
    }
}

/// `GET /v1/models`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelCard>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

impl ModelList {
    /// A list holding just the served model.
    pub fn single(id: impl Into<String>, created: i64) -> Self {
        Self {
            object: "list".into(),
            data: vec![ModelCard {
                id: id.into(),
                object: "model".into(),
                created,
                owned_by: "llamabridge".into(),
            }],
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}
