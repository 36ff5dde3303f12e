//! Integration tests for the completion pipeline.
//!
//! Requests go in through the OpenAI wire types, run against a
//! `ScriptedEngine`, and come back out as results, chunks or SSE frames.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use llamabridge_core::api::{ChatCompletionRequest, ChatCompletionResponse};
use llamabridge_core::{
    BridgeConfig, BridgeError, CallArguments, ChunkBody, CompletionAdapter, CompletionRequest,
    ExtractedIntent, FinishReason, Frame, ResponseChunk, ScriptedEngine, encode_stream,
};

// ═══════════════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════════════

fn adapter_with(engine: ScriptedEngine, config: BridgeConfig) -> CompletionAdapter {
    CompletionAdapter::new(Arc::new(engine), Arc::new(config)).expect("adapter")
}

fn adapter(fragments: &[&str]) -> (CompletionAdapter, ScriptedEngine) {
    let engine = ScriptedEngine::new("local-model", fragments.iter().copied());
    (adapter_with(engine.clone(), BridgeConfig::default()), engine)
}

fn request(body: Value) -> CompletionRequest {
    let wire: ChatCompletionRequest = serde_json::from_value(body).expect("wire request");
    let config = BridgeConfig::default();
    wire.into_request(&config.sampling, &config.engine.model_id)
        .expect("valid request")
}

fn weather_request(stream: bool) -> CompletionRequest {
    request(json!({
        "model": "gpt-3.5-turbo",
        "stream": stream,
        "messages": [{"role": "user", "content": "What's the weather in Paris?"}],
        "functions": [{
            "name": "get_weather",
            "description": "Current weather for a city",
            "parameters": {
                "type": "object",
                "properties": {"location": {"type": "string"}},
                "required": ["location"]
            }
        }]
    }))
}

async fn collect_chunks(adapter: &CompletionAdapter, request: &CompletionRequest) -> Vec<ResponseChunk> {
    adapter
        .complete_stream(request, CancellationToken::new())
        .await
        .expect("stream starts")
        .collect()
        .await
}

fn streamed_text(chunks: &[ResponseChunk]) -> String {
    chunks
        .iter()
        .filter_map(|c| match &c.body {
            ChunkBody::Delta(d) => d.content.as_deref(),
            _ => None,
        })
        .collect()
}

/// (name, arguments) reassembled from call fragments.
fn streamed_call(chunks: &[ResponseChunk]) -> Option<(String, String)> {
    let mut name = None;
    let mut arguments = String::new();
    for chunk in chunks {
        if let ChunkBody::Delta(delta) = &chunk.body {
            if let Some(call) = &delta.call {
                if let Some(n) = &call.name {
                    name = Some(n.clone());
                }
                arguments.push_str(call.arguments.as_deref().unwrap_or_default());
            }
        }
    }
    name.map(|n| (n, arguments))
}

fn finish_reason(chunks: &[ResponseChunk]) -> Option<FinishReason> {
    chunks.iter().find_map(|c| match c.body {
        ChunkBody::Finish { reason, .. } => Some(reason),
        _ => None,
    })
}

// ═══════════════════════════════════════════════════════════════════════
//  Scenario A: plain text, non-streaming
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn plain_completion_returns_text() {
    let (adapter, engine) = adapter(&["The capital ", "of France ", "is Paris."]);
    let req = request(json!({
        "model": "gpt-3.5-turbo",
        "messages": [{"role": "user", "content": "Capital of France?"}]
    }));

    let result = adapter.complete(&req).await.expect("completion");
    assert_eq!(
        result.intent,
        ExtractedIntent::PlainText {
            content: "The capital of France is Paris.".into()
        }
    );
    assert_eq!(result.finish_reason(), FinishReason::Stop);
    assert_eq!(result.usage.completion_tokens, 3);
    assert!(result.id.starts_with("chatcmpl-"));

    let prompt = engine.last_prompt().expect("prompt recorded");
    assert!(prompt.ends_with("<|im_start|>assistant\n"));
    assert!(!prompt.contains("<FUNCTIONS>"));

    let body = serde_json::to_value(ChatCompletionResponse::from(&result)).unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "gpt-3.5-turbo");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "The capital of France is Paris.");
    assert_eq!(body["choices"][0]["message"]["function_call"], Value::Null);
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["completion_tokens"], 3);
}

// ═══════════════════════════════════════════════════════════════════════
//  Scenario B: function call, non-streaming
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn function_call_is_extracted() {
    let (adapter, engine) = adapter(&["<functioncall> get_weather(", "{\"location\": \"Paris\"})"]);
    let result = adapter.complete(&weather_request(false)).await.expect("completion");

    let call = result.intent.call().expect("function call");
    assert_eq!(call.name, "get_weather");
    assert_eq!(call.arguments, CallArguments::Json(json!({"location": "Paris"})));
    assert!(!call.malformed);
    assert_eq!(result.finish_reason(), FinishReason::FunctionCall);

    assert!(engine.last_prompt().unwrap().contains("<FUNCTIONS>"));

    let body = serde_json::to_value(ChatCompletionResponse::from(&result)).unwrap();
    let message = &body["choices"][0]["message"];
    assert_eq!(message["content"], Value::Null);
    assert_eq!(message["function_call"]["name"], "get_weather");
    let arguments: Value =
        serde_json::from_str(message["function_call"]["arguments"].as_str().unwrap()).unwrap();
    assert_eq!(arguments, json!({"location": "Paris"}));
    assert!(message["function_call"].get("malformed").is_none());
    assert!(message.get("tool_calls").is_none());
    assert_eq!(body["choices"][0]["finish_reason"], "function_call");
}

#[tokio::test]
async fn tools_dialect_answers_with_tool_calls() {
    let (adapter, _) = adapter(&["<functioncall> get_weather({\"location\": \"Paris\"})"]);
    let req = request(json!({
        "messages": [{"role": "user", "content": "Weather?"}],
        "tools": [{"type": "function", "function": {"name": "get_weather", "parameters": {}}}]
    }));
    let result = adapter.complete(&req).await.expect("completion");
    let body = serde_json::to_value(ChatCompletionResponse::from(&result)).unwrap();
    let message = &body["choices"][0]["message"];
    assert_eq!(message["tool_calls"][0]["type"], "function");
    assert_eq!(message["tool_calls"][0]["function"]["name"], "get_weather");
    assert!(message["tool_calls"][0]["id"].as_str().unwrap().starts_with("call_"));
    assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
}

// ═══════════════════════════════════════════════════════════════════════
//  Scenario C: function call, streaming
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn streamed_call_matches_non_streamed() {
    let fragments = ["<func", "tioncall> get_", "weather({\"loc", "ation\": \"Paris\"})"];

    let (adapter, _) = self::adapter(&fragments);
    let whole = adapter.complete(&weather_request(false)).await.unwrap();
    let expected = whole.intent.call().unwrap();

    let chunks = collect_chunks(&adapter, &weather_request(true)).await;
    let (name, arguments) = streamed_call(&chunks).expect("streamed call");
    assert_eq!(name, expected.name);
    assert_eq!(arguments, expected.arguments.to_wire());
    assert_eq!(streamed_text(&chunks), "");
    assert_eq!(finish_reason(&chunks), Some(FinishReason::FunctionCall));

    // Role first, finish last, indices contiguous.
    assert!(matches!(&chunks[0].body, ChunkBody::Delta(d) if d.role.is_some()));
    assert!(chunks.last().unwrap().is_terminal());
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.index, i as u64);
    }
}

#[tokio::test]
async fn streamed_text_concatenates_to_engine_output() {
    let fragments = ["I think ", "<b>", "it is ", "<func", "ky</b>"];
    let (adapter, _) = adapter(&fragments);
    let req = request(json!({
        "stream": true,
        "messages": [{"role": "user", "content": "Describe it"}]
    }));
    let chunks = collect_chunks(&adapter, &req).await;
    assert_eq!(streamed_text(&chunks), fragments.concat());
    assert_eq!(finish_reason(&chunks), Some(FinishReason::Stop));
    assert!(streamed_call(&chunks).is_none());
}

#[tokio::test]
async fn include_usage_reports_on_finish_chunk() {
    let (adapter, _) = adapter(&["Hi", "!"]);
    let req = request(json!({
        "stream": true,
        "stream_options": {"include_usage": true},
        "messages": [{"role": "user", "content": "Hello"}]
    }));
    let chunks = collect_chunks(&adapter, &req).await;
    let usage = chunks.iter().find_map(|c| match c.body {
        ChunkBody::Finish { usage, .. } => usage,
        _ => None,
    });
    assert_eq!(usage.map(|u| u.completion_tokens), Some(2));
}

#[tokio::test]
async fn sse_frames_end_with_single_done() {
    let (adapter, _) = adapter(&["Hello", " world"]);
    let req = request(json!({
        "stream": true,
        "messages": [{"role": "user", "content": "Hi"}]
    }));
    let chunks = adapter
        .complete_stream(&req, CancellationToken::new())
        .await
        .unwrap();
    let frames: Vec<Frame> = encode_stream(chunks).collect().await;

    assert_eq!(frames.last(), Some(&Frame::Done));
    assert_eq!(frames.iter().filter(|f| **f == Frame::Done).count(), 1);
    let last_data: Value = serde_json::from_str(frames[frames.len() - 2].data()).unwrap();
    assert_eq!(last_data["choices"][0]["finish_reason"], "stop");
    assert_eq!(last_data["choices"][0]["delta"], json!({}));
}

// ═══════════════════════════════════════════════════════════════════════
//  Malformed calls and limits
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn truncated_call_is_malformed() {
    let engine = ScriptedEngine::new(
        "local-model",
        ["<functioncall> get_weather(", "{\"location\": ", "\"Par", "is"],
    );
    let adapter = adapter_with(engine, BridgeConfig::default());
    let mut req = weather_request(false);
    req.sampling.max_tokens = 3;

    let result = adapter.complete(&req).await.unwrap();
    let call = result.intent.call().expect("call");
    assert!(call.malformed);
    assert_eq!(call.arguments, CallArguments::Raw("{\"location\": \"Par".into()));

    let body = serde_json::to_value(ChatCompletionResponse::from(&result)).unwrap();
    let wire = &body["choices"][0]["message"]["function_call"];
    assert_eq!(wire["malformed"], true);
    assert_eq!(wire["arguments"], "{\"location\": \"Par");
}

#[tokio::test]
async fn max_tokens_gives_length_finish() {
    let engine = ScriptedEngine::new("local-model", ["a", "b", "c", "d"]);
    let adapter = adapter_with(engine, BridgeConfig::default());
    let mut req = request(json!({"messages": [{"role": "user", "content": "x"}]}));
    req.sampling.max_tokens = 2;
    let result = adapter.complete(&req).await.unwrap();
    assert_eq!(result.finish_reason(), FinishReason::Length);
    assert_eq!(result.intent.content(), Some("ab"));
}

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn invalid_request_never_reaches_engine() {
    let (adapter, engine) = adapter(&["unused"]);
    let mut req = request(json!({"messages": [{"role": "user", "content": "x"}]}));
    req.messages.clear();
    let err = adapter.complete(&req).await.unwrap_err();
    assert!(matches!(err, BridgeError::InvalidRequest { .. }));
    assert!(adapter.complete_stream(&req, CancellationToken::new()).await.is_err());
    assert_eq!(engine.calls(), 0);
}

#[tokio::test]
async fn engine_failure_is_an_error_non_streaming() {
    let engine = ScriptedEngine::new("local-model", ["a", "b"]).failing_after(1);
    let adapter = adapter_with(engine, BridgeConfig::default());
    let req = request(json!({"messages": [{"role": "user", "content": "x"}]}));
    let err = adapter.complete(&req).await.unwrap_err();
    assert!(matches!(err, BridgeError::Engine { .. }));
}

#[tokio::test]
async fn engine_failure_mid_stream_ends_with_error_chunk() {
    let engine = ScriptedEngine::new("local-model", ["partial ", "answer"]).failing_after(1);
    let adapter = adapter_with(engine, BridgeConfig::default());
    let req = request(json!({
        "stream": true,
        "messages": [{"role": "user", "content": "x"}]
    }));
    let chunks = collect_chunks(&adapter, &req).await;
    assert_eq!(streamed_text(&chunks), "partial ");
    assert!(matches!(chunks.last().unwrap().body, ChunkBody::Error(_)));
    assert!(finish_reason(&chunks).is_none());

    let chunks = adapter
        .complete_stream(&req, CancellationToken::new())
        .await
        .unwrap();
    let frames: Vec<Frame> = encode_stream(chunks).collect().await;
    assert_eq!(frames.last(), Some(&Frame::Done));
    let error: Value = serde_json::from_str(frames[frames.len() - 2].data()).unwrap();
    assert_eq!(error["error"]["type"], "engine_error");
}

// ═══════════════════════════════════════════════════════════════════════
//  Cancellation and concurrency
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn cancellation_stops_without_finish_chunk() {
    let engine = ScriptedEngine::new("local-model", ["one ", "two ", "three"])
        .with_delay(Duration::from_millis(20));
    let adapter = adapter_with(engine, BridgeConfig::default());
    let req = request(json!({
        "stream": true,
        "messages": [{"role": "user", "content": "count"}]
    }));

    let cancel = CancellationToken::new();
    let mut stream = adapter.complete_stream(&req, cancel.clone()).await.unwrap();
    let first = stream.next().await.expect("role chunk");
    assert!(matches!(first.body, ChunkBody::Delta(_)));

    cancel.cancel();
    let rest: Vec<ResponseChunk> = stream.collect().await;
    assert!(rest.is_empty());
}

#[tokio::test]
async fn dropping_stream_releases_engine_permit() {
    let (adapter, _) = adapter(&["busy"]);
    let req = request(json!({
        "stream": true,
        "messages": [{"role": "user", "content": "x"}]
    }));

    let held = adapter
        .complete_stream(&req, CancellationToken::new())
        .await
        .unwrap();

    let blocked = tokio::time::timeout(Duration::from_millis(50), adapter.complete(&req)).await;
    assert!(blocked.is_err(), "second generation must wait for the permit");

    drop(held);
    let result = tokio::time::timeout(Duration::from_secs(1), adapter.complete(&req))
        .await
        .expect("permit released")
        .unwrap();
    assert_eq!(result.intent.content(), Some("busy"));
}

#[tokio::test]
async fn concurrent_requests_are_independent() {
    let mut config = BridgeConfig::default();
    config.engine.max_concurrent = 4;
    let engine = ScriptedEngine::new("local-model", ["<functioncall> f(", "{\"n\": 1})"]);
    let adapter = adapter_with(engine, config);

    let plain = request(json!({"messages": [{"role": "user", "content": "x"}]}));
    let with_functions = request(json!({
        "messages": [{"role": "user", "content": "x"}],
        "functions": [{"name": "f"}]
    }));

    let (a, b) = tokio::join!(adapter.complete(&plain), adapter.complete(&with_functions));
    assert_eq!(a.unwrap().intent.call().map(|c| c.name.clone()), Some("f".into()));
    assert_eq!(b.unwrap().finish_reason(), FinishReason::FunctionCall);
}

// ═══════════════════════════════════════════════════════════════════════
//  Tagged call syntax
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn tagged_syntax_from_config() {
    let config = BridgeConfig::from_toml_str("[function_call]\npreset = \"tagged\"\n").unwrap();
    let engine = ScriptedEngine::new(
        "local-model",
        [
            "<tool_call>\n{\"name\": \"get_weather\", ",
            "\"arguments\": {\"location\": \"Paris\"}}\n</tool",
            "_call>",
        ],
    );
    let adapter = adapter_with(engine.clone(), config);
    let result = adapter.complete(&weather_request(false)).await.unwrap();
    let call = result.intent.call().expect("call");
    assert_eq!(call.name, "get_weather");
    assert!(!call.malformed);
    assert!(result.intent.content().is_none());
    assert!(engine.last_prompt().unwrap().contains("<tool_call>"));
}

// ═══════════════════════════════════════════════════════════════════════
//  Llama-2 functionary: bare JSON calls
// ═══════════════════════════════════════════════════════════════════════

fn functionary_config() -> BridgeConfig {
    BridgeConfig::from_toml_str(
        "[prompt]\npreset = \"llama2\"\n\n[function_call]\npreset = \"functionary\"\n",
    )
    .expect("llama2 functionary config")
}

const BARE_CALL: [&str; 3] = [
    "{\"function\": \"get_",
    "weather\", \"arguments\": {\"loc",
    "ation\": \"Paris\"}}",
];

#[tokio::test]
async fn bare_json_call_non_streaming() {
    let engine = ScriptedEngine::new("local-model", BARE_CALL);
    let adapter = adapter_with(engine.clone(), functionary_config());

    let result = adapter.complete(&weather_request(false)).await.unwrap();
    let call = result.intent.call().expect("call");
    assert_eq!(call.name, "get_weather");
    assert!(!call.malformed);
    assert_eq!(call.arguments, CallArguments::Json(json!({"location": "Paris"})));
    assert!(result.intent.content().is_none());
    assert_eq!(result.finish_reason(), FinishReason::FunctionCall);

    let prompt = engine.last_prompt().unwrap();
    assert!(prompt.starts_with("<s>[INST] <<SYS>>\n"));
    assert!(prompt.contains("<FUNCTIONS>"));
    assert!(prompt.contains("What's the weather in Paris? [/INST]"));
    assert!(!prompt.contains("<functioncall>"));
}

#[tokio::test]
async fn bare_json_call_streaming() {
    let engine = ScriptedEngine::new("local-model", BARE_CALL);
    let adapter = adapter_with(engine, functionary_config());

    let chunks = collect_chunks(&adapter, &weather_request(true)).await;
    let (name, arguments) = streamed_call(&chunks).expect("streamed call");
    assert_eq!(name, "get_weather");
    let arguments: Value = serde_json::from_str(&arguments).unwrap();
    assert_eq!(arguments, json!({"location": "Paris"}));
    // The held object never leaks as text.
    assert_eq!(streamed_text(&chunks), "");
    assert_eq!(finish_reason(&chunks), Some(FinishReason::FunctionCall));
}

#[tokio::test]
async fn functionary_text_reply_streams_unchanged() {
    let engine = ScriptedEngine::new(
        "local-model",
        ["It is ", "sunny {mostly}", " today.</s>ignored"],
    );
    let adapter = adapter_with(engine, functionary_config());

    let chunks = collect_chunks(&adapter, &weather_request(true)).await;
    assert!(streamed_call(&chunks).is_none());
    assert_eq!(streamed_text(&chunks), "It is sunny {mostly} today.");
    assert_eq!(finish_reason(&chunks), Some(FinishReason::Stop));
}

// ═══════════════════════════════════════════════════════════════════════
//  Backpressure
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn slow_consumer_does_not_drain_engine() {
    let fragments = vec!["w "; 100];
    let engine = ScriptedEngine::new("local-model", fragments);
    let adapter = adapter_with(engine.clone(), BridgeConfig::default());
    let req = request(json!({
        "stream": true,
        "max_tokens": 1000,
        "messages": [{"role": "user", "content": "talk"}]
    }));

    let taken: Vec<ResponseChunk> = adapter
        .complete_stream(&req, CancellationToken::new())
        .await
        .unwrap()
        .take(5)
        .collect()
        .await;
    assert_eq!(taken.len(), 5);

    // Role chunk plus four text chunks; the engine is only pulled on demand.
    let sent = engine.fragments_sent();
    assert!(sent <= 5, "engine ran ahead of the consumer: {sent} fragments");
    assert!(sent >= 4);
}
