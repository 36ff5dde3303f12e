//! Server-sent event encoding for streamed completions.
//!
//! [`encode`] turns one [`ResponseChunk`] into the JSON of a
//! `chat.completion.chunk` (or an error envelope).  [`encode_stream`] wraps a
//! chunk stream into [`Frame`]s and appends the `[DONE]` sentinel after the
//! terminal chunk.  A stream that stops early, because it was cancelled,
//! gets no sentinel.

use futures::StreamExt;
use futures::stream::BoxStream;

use crate::adapter::{CallFragment, ChunkBody, ChunkStream, ResponseChunk};
use crate::api::{
    ChatCompletionChunk, ChunkChoice, ErrorBody, FunctionCallFragment, ToolCallFragment,
    WireDelta,
};
use crate::error::Result;
use crate::types::DeclarationStyle;

/// Payload of the terminal sentinel event.
pub const DONE: &str = "[DONE]";

/// One server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A JSON payload.
    Data(String),
    /// The terminal sentinel.
    Done,
}

impl Frame {
    /// The event payload.
    pub fn data(&self) -> &str {
        match self {
            Self::Data(json) => json,
            Self::Done => DONE,
        }
    }

    /// `data: <payload>\n\n`
    pub fn to_sse(&self) -> String {
        format!("data: {}\n\n", self.data())
    }
}

/// Serialize one chunk.
pub fn encode(chunk: &ResponseChunk) -> Result<String> {
    let json = match &chunk.body {
        ChunkBody::Error(message) => {
            serde_json::to_string(&ErrorBody::new("engine_error", message.as_str()))?
        }
        body => serde_json::to_string(&to_wire(chunk, body))?,
    };
    Ok(json)
}

fn to_wire(chunk: &ResponseChunk, body: &ChunkBody) -> ChatCompletionChunk {
    let meta = &chunk.meta;
    let (delta, finish_reason, usage) = match body {
        ChunkBody::Delta(delta) => {
            let function_call = delta.call.as_ref().map(fragment);
            let tool_calls = match (meta.style, &delta.call) {
                (DeclarationStyle::Tools, Some(call)) => {
                    let starts_call = call.name.is_some();
                    Some(vec![ToolCallFragment {
                        index: 0,
                        id: starts_call.then(|| meta.tool_call_id.clone()),
                        kind: starts_call.then(|| "function".to_owned()),
                        function: fragment(call),
                    }])
                }
                _ => None,
            };
            let delta = WireDelta {
                role: delta.role.map(|role| role.as_str().to_owned()),
                content: delta.content.clone(),
                function_call,
                tool_calls,
            };
            (delta, None, None)
        }
        ChunkBody::Finish { reason, usage } => {
            (WireDelta::default(), Some(*reason), usage.map(Into::into))
        }
        ChunkBody::Error(_) => (WireDelta::default(), None, None),
    };

    ChatCompletionChunk {
        id: meta.id.clone(),
        object: "chat.completion.chunk".into(),
        created: meta.created,
        model: meta.model.clone(),
        choices: vec![ChunkChoice {
            index: 0,
            delta,
            finish_reason,
        }],
        usage,
    }
}

fn fragment(call: &CallFragment) -> FunctionCallFragment {
    FunctionCallFragment {
        name: call.name.clone(),
        arguments: call.arguments.clone(),
        malformed: call.malformed,
    }
}

/// Encode a chunk stream into frames, in order and one frame per chunk,
/// followed by exactly one [`Frame::Done`] once a terminal chunk was sent.
pub fn encode_stream(chunks: ChunkStream) -> BoxStream<'static, Frame> {
    async_stream::stream! {
        let mut chunks = chunks;
        while let Some(chunk) = chunks.next().await {
            match encode(&chunk) {
                Ok(json) => yield Frame::Data(json),
                Err(e) => {
                    tracing::error!(error = %e, index = chunk.index, "failed to encode chunk");
                    yield Frame::Data(encode_failure());
                    yield Frame::Done;
                    return;
                }
            }
            if chunk.is_terminal() {
                yield Frame::Done;
                return;
            }
        }
    }
    .boxed()
}

fn encode_failure() -> String {
    serde_json::to_string(&ErrorBody::new("server_error", "failed to encode chunk"))
        .unwrap_or_else(|_| {
            r#"{"error":{"message":"failed to encode chunk","type":"server_error"}}"#.to_owned()
        })
}
