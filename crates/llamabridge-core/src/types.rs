//! Core domain types.
//!
//! These model a chat-completion request after it has been pulled off the
//! wire and checked, and the values flowing back out of the engine.  The
//! OpenAI-shaped wire format lives in [`crate::api`]; this module stays free
//! of transport concerns.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions that shape model behavior.
    System,
    /// Input from the human user.
    User,
    /// Output from the model.
    Assistant,
    /// Result of a function invocation, fed back to the model.
    Function,
}

impl Role {
    /// The lowercase wire name of the role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Function => "function",
        }
    }
}

impl FromStr for Role {
    type Err = BridgeError;

    /// Parse a wire role.  `developer` is accepted as a system alias and
    /// `tool` as a function alias; anything else is rejected.
    fn from_str(role: &str) -> Result<Self, Self::Err> {
        match role {
            "system" | "developer" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "function" | "tool" => Ok(Self::Function),
            other => Err(BridgeError::UnsupportedRole {
                role: other.to_owned(),
            }),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A function call recorded in the conversation history.
///
/// `arguments` is kept as the client sent it: a JSON-encoded string that is
/// not guaranteed to parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Name of the invoked function.
    pub name: String,
    /// JSON-encoded arguments.
    pub arguments: String,
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    /// Who produced this message.
    pub role: Role,

    /// Text content.  Assistant messages that only carry a function call
    /// have no content.
    pub content: Option<String>,

    /// For [`Role::Function`] messages, the function that produced it.
    pub name: Option<String>,

    /// A function call made by the assistant in an earlier turn.
    pub function_call: Option<FunctionCall>,
}

impl ChatMessage {
    fn new(role: Role, content: Option<String>) -> Self {
        Self {
            role,
            content,
            name: None,
            function_call: None,
        }
    }

    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, Some(content.into()))
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, Some(content.into()))
    }

    /// Create an assistant text message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, Some(content.into()))
    }

    /// Create an assistant message that only carries a function call.
    pub fn assistant_call(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            function_call: Some(FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            }),
            ..Self::new(Role::Assistant, None)
        }
    }

    /// Create a function result message.
    pub fn function_result(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(Role::Function, Some(content.into()))
        }
    }

    /// The content, or an empty string when there is none.
    pub fn content_text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Function declarations
// ---------------------------------------------------------------------------

/// A function the model may call, as declared by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    /// Unique function name within one request.
    pub name: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// JSON Schema describing the parameters.
    #[serde(default)]
    pub parameters: Value,
}

/// Which OpenAI dialect the client used to declare functions.
///
/// Responses answer in the same dialect: legacy `functions` clients get a
/// bare `function_call`, `tools` clients additionally get `tool_calls`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeclarationStyle {
    /// The legacy top-level `functions` array.
    #[default]
    Functions,
    /// The `tools` array with `type: "function"` entries.
    Tools,
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

/// Sampling parameters for one generation.  Fixed once a request begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub top_p: f32,
    /// Maximum number of tokens to generate.  Always positive.
    pub max_tokens: u32,
    /// Caller-supplied stop sequences, in order, without duplicates.
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub stream: bool,
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

// ---------------------------------------------------------------------------
// Completion request
// ---------------------------------------------------------------------------

/// A chat-completion request after it has been read off the wire.
///
/// Created per inbound call and dropped once the response has been sent or
/// the client has gone away.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// The model name the client asked for (echoed back in responses).
    pub model: String,
    /// The conversation, oldest message first.
    pub messages: Vec<ChatMessage>,
    /// Functions the model may call.
    pub functions: Vec<FunctionDeclaration>,
    /// How the client declared `functions`.
    pub style: DeclarationStyle,
    /// Sampling parameters.
    pub sampling: SamplingConfig,
    /// Whether the final stream chunk should report token usage.
    pub include_usage: bool,
}

// ---------------------------------------------------------------------------
// Generation events
// ---------------------------------------------------------------------------

/// Why the engine stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model emitted its end-of-sequence token.
    EndOfSequence,
    /// A stop sequence matched.
    StopSequence,
    /// The `max_tokens` limit was reached.
    MaxTokens,
}

/// One event from the engine's token stream.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationEvent {
    /// Generated text; may be empty on the terminal event.
    pub text: String,
    /// Present on the terminal event only.
    pub stop: Option<StopReason>,
    /// Token usage reported by the engine, if it reports any.
    pub usage: Option<Usage>,
}

impl GenerationEvent {
    /// A non-terminal text fragment.
    pub fn fragment(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            stop: None,
            usage: None,
        }
    }

    /// A terminal event without trailing text.
    pub fn finished(reason: StopReason) -> Self {
        Self {
            text: String::new(),
            stop: Some(reason),
            usage: None,
        }
    }

    /// Attach engine-reported usage.
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Returns `true` if this event ends the generation.
    pub fn is_final(&self) -> bool {
        self.stop.is_some()
    }
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

/// Token usage for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the composed prompt.
    pub prompt_tokens: u32,
    /// Tokens generated.
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Rough token estimate for engines that do not report prompt usage.
///
/// Uses the common four-characters-per-token rule of thumb.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    chars.div_ceil(4)
}

// ---------------------------------------------------------------------------
// Extracted intent
// ---------------------------------------------------------------------------

/// The arguments of a recovered function call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallArguments {
    /// The payload parsed as JSON.
    Json(Value),
    /// The payload did not parse; this is the text as the model wrote it.
    Raw(String),
}

impl CallArguments {
    /// The JSON-encoded argument string the OpenAI contract expects.
    pub fn to_wire(&self) -> String {
        match self {
            Self::Json(value) => value.to_string(),
            Self::Raw(raw) => raw.clone(),
        }
    }
}

/// A function call recovered from generated text.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCallIntent {
    pub name: String,
    pub arguments: CallArguments,
    /// Set when the name or arguments could not be recovered cleanly.
    /// The caller decides whether to reject such a call.
    pub malformed: bool,
}

/// The final reading of one completed generation.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractedIntent {
    /// The model answered in plain text.
    PlainText { content: String },
    /// The model asked for a function call.  `content` holds any text the
    /// model wrote around the call, if it was not blank.
    FunctionCall {
        call: FunctionCallIntent,
        content: Option<String>,
    },
}

impl ExtractedIntent {
    /// The assistant text, if any.
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::PlainText { content } => Some(content),
            Self::FunctionCall { content, .. } => content.as_deref(),
        }
    }

    /// The recovered call, if any.
    pub fn call(&self) -> Option<&FunctionCallIntent> {
        match self {
            Self::PlainText { .. } => None,
            Self::FunctionCall { call, .. } => Some(call),
        }
    }
}

/// The OpenAI `finish_reason` values this bridge produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    FunctionCall,
    ToolCalls,
}

impl FinishReason {
    /// Derive the finish reason from how generation stopped and what was
    /// extracted.  A recovered call wins over the engine's stop reason.
    pub fn resolve(stop: StopReason, has_call: bool, style: DeclarationStyle) -> Self {
        match (has_call, style) {
            (true, DeclarationStyle::Functions) => Self::FunctionCall,
            (true, DeclarationStyle::Tools) => Self::ToolCalls,
            (false, _) => match stop {
                StopReason::MaxTokens => Self::Length,
                StopReason::EndOfSequence | StopReason::StopSequence => Self::Stop,
            },
        }
    }
}
