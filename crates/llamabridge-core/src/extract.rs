//! Function-call extraction from generated text.
//!
//! Models served through this bridge were never given a native structured
//! output mode, so a function call arrives as ordinary text: an opening
//! marker, a function name and a JSON-ish argument blob, optionally followed
//! by a closing marker.  [`FunctionCallExtractor`] watches the token stream
//! for that shape and splits it into plain assistant text and at most one
//! [`FunctionCallIntent`].
//!
//! The extractor is fed fragments exactly as the engine produces them.  A
//! marker may be cut at any character boundary, so text that could still
//! turn into a marker is withheld until it is confirmed or ruled out.
//!
//! Some models (Llama-2 functionary fine-tunes) write no marker at all: the
//! whole reply is a bare `{"function": ..., "arguments": ...}` object.  An
//! anchored syntax with an empty marker treats a leading `{` as the trigger
//! and withholds the object until it either parses as a call or does not,
//! in which case it is released as ordinary text.
//! Nothing is ever dropped: every character either reaches the client as
//! text or is consumed into the resolved call.
//!
//! ```text
//!   Scanning ──prefix──> CandidateOpen ──marker──> AccumulatingArgs ──> ResolvedFunction
//!      ^                      │                                             (terminal)
//!      └────disconfirmed──────┘        finish() without a call ──> EmittingText (terminal)
//! ```

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{BridgeError, Result};
use crate::types::{CallArguments, ExtractedIntent, FunctionCallIntent};

// ---------------------------------------------------------------------------
// Call syntax
// ---------------------------------------------------------------------------

/// How the argument payload following the opening marker is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentStyle {
    /// `name({"key": "value"})`
    #[default]
    Parenthesized,
    /// `{"function": "name", "arguments": {...}}`, also accepting `name`
    /// and `parameters` as keys and string-encoded arguments.
    JsonObject,
}

/// The textual convention a model uses to express a function call.
///
/// There is no universal grammar for this; each fine-tune picks its own.
/// The syntax is therefore configuration rather than a constant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSyntax {
    /// Text that opens a function call.
    pub open_marker: String,
    /// Optional text that closes it.
    #[serde(default)]
    pub close_marker: Option<String>,
    /// Payload format after the opening marker.
    #[serde(default)]
    pub style: ArgumentStyle,
    /// Only recognise a call at the start of the generation (leading
    /// whitespace allowed).  Required when `open_marker` is empty.
    #[serde(default)]
    pub anchored: bool,
}

impl Default for CallSyntax {
    fn default() -> Self {
        Self {
            open_marker: "<functioncall>".into(),
            close_marker: None,
            style: ArgumentStyle::Parenthesized,
            anchored: false,
        }
    }
}

impl CallSyntax {
    /// Tag-delimited JSON objects, as emitted by Hermes-style fine-tunes.
    pub fn tagged() -> Self {
        Self {
            open_marker: "<tool_call>".into(),
            close_marker: Some("</tool_call>".into()),
            style: ArgumentStyle::JsonObject,
            anchored: false,
        }
    }

    /// A bare JSON object opening the reply, as Llama-2 functionary
    /// models write it.
    pub fn functionary() -> Self {
        Self {
            open_marker: String::new(),
            close_marker: None,
            style: ArgumentStyle::JsonObject,
            anchored: true,
        }
    }

    /// Whether the call starts with its payload rather than a marker.
    pub fn is_bare(&self) -> bool {
        self.open_marker.is_empty()
    }

    /// Check that the markers are usable.
    pub fn validate(&self) -> Result<()> {
        if self.is_bare() {
            if !self.anchored || self.style != ArgumentStyle::JsonObject {
                return Err(BridgeError::Config {
                    reason: "an empty function_call.open_marker needs anchored = true and style = \"json_object\"".into(),
                });
            }
        } else if self.open_marker.trim().is_empty() {
            return Err(BridgeError::Config {
                reason: "function_call.open_marker must not be blank".into(),
            });
        }
        if self
            .close_marker
            .as_deref()
            .is_some_and(|close| close.trim().is_empty())
        {
            return Err(BridgeError::Config {
                reason: "function_call.close_marker must not be blank when set".into(),
            });
        }
        Ok(())
    }

    /// Render a call the way the model is expected to write one.
    ///
    /// Used for assistant turns in the conversation history so the model
    /// keeps seeing its own convention.
    pub fn render_call(&self, name: &str, arguments: &str) -> String {
        let body = match self.style {
            ArgumentStyle::Parenthesized => format!("{name}({arguments})"),
            ArgumentStyle::JsonObject => {
                let arguments = serde_json::from_str::<Value>(arguments)
                    .unwrap_or_else(|_| Value::String(arguments.to_owned()));
                json!({ "function": name, "arguments": arguments }).to_string()
            }
        };
        let close = self.close_marker.as_deref().unwrap_or_default();
        if self.is_bare() {
            format!("{body}{close}")
        } else {
            format!("{} {body}{close}", self.open_marker)
        }
    }

    /// One line telling the model how to call a function.
    pub fn instruction(&self) -> String {
        format!(
            "To call a function, respond with {} and nothing else.",
            self.render_call("function_name", r#"{"argument": "value"}"#)
        )
    }
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

/// Where the extractor is in the text it has seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorState {
    /// Passing text through, looking for the opening marker.
    Scanning,
    /// Withholding text that is a strict prefix of the opening marker.
    CandidateOpen,
    /// Marker confirmed; buffering the call payload.
    AccumulatingArgs,
    /// A call was recovered.  Later text is trailing content.
    ResolvedFunction,
    /// Generation ended without a call.
    EmittingText,
}

/// Output of one [`FunctionCallExtractor::feed`] or
/// [`FunctionCallExtractor::finish`] step, in generation order.
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    /// Plain assistant text that is safe to send to the client.
    Text(String),
    /// The recovered function call.
    Call(FunctionCallIntent),
}

/// Incremental function-call detector for one generation.
///
/// Create one per in-flight generation; instances share nothing.
#[derive(Debug)]
pub struct FunctionCallExtractor {
    syntax: CallSyntax,
    state: ExtractorState,
    /// Withheld text: a marker candidate, or a possible closing marker
    /// right after a resolved call.
    held: String,
    /// Payload text after the opening marker.
    payload: String,
    balance: Balance,
    /// A closing marker may still follow the resolved call.
    closing: bool,
    /// Everything emitted as text.
    text: String,
    /// Everything consumed into the call, markers included.
    consumed: String,
    call: Option<FunctionCallIntent>,
    /// A call may still open.  Anchored syntaxes disarm after the first
    /// non-whitespace text.
    armed: bool,
    finished: bool,
}

impl FunctionCallExtractor {
    /// Create an extractor for the given call syntax.
    pub fn new(syntax: CallSyntax) -> Self {
        Self {
            syntax,
            state: ExtractorState::Scanning,
            held: String::new(),
            payload: String::new(),
            balance: Balance::default(),
            closing: false,
            text: String::new(),
            consumed: String::new(),
            call: None,
            armed: true,
            finished: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> ExtractorState {
        self.state
    }

    /// All text emitted so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// All text consumed into the function call so far.
    pub fn consumed_text(&self) -> &str {
        &self.consumed
    }

    /// Feed the next generated fragment.
    ///
    /// Returns what can be released to the client now.  Text that might
    /// still be part of a marker stays withheld.
    pub fn feed(&mut self, fragment: &str) -> Vec<Emission> {
        let mut out = Vec::new();
        if self.finished {
            tracing::warn!(len = fragment.len(), "fragment fed after finish, ignoring");
            return out;
        }
        for ch in fragment.chars() {
            self.step(ch, &mut out);
        }
        out
    }

    /// Signal end of generation and release everything still held.
    ///
    /// An unfinished call payload resolves as a malformed call carrying the
    /// raw argument text.  Calling this twice is a no-op.
    pub fn finish(&mut self) -> Vec<Emission> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.finished = true;

        match self.state {
            ExtractorState::Scanning | ExtractorState::EmittingText => {
                self.state = ExtractorState::EmittingText;
            }
            ExtractorState::CandidateOpen => {
                let held = std::mem::take(&mut self.held);
                self.emit(&held, &mut out);
                self.state = ExtractorState::EmittingText;
            }
            ExtractorState::AccumulatingArgs => {
                let call = parse_call(self.syntax.style, &self.payload, false);
                self.settle(call, &mut out);
                if self.state == ExtractorState::Scanning {
                    self.state = ExtractorState::EmittingText;
                }
            }
            ExtractorState::ResolvedFunction => {}
        }

        if self.closing {
            let held = std::mem::take(&mut self.held);
            self.emit(&held, &mut out);
            self.closing = false;
        }
        out
    }

    /// The intent as read so far; final once [`finish`](Self::finish) ran.
    pub fn intent(&self) -> ExtractedIntent {
        match &self.call {
            Some(call) => ExtractedIntent::FunctionCall {
                call: call.clone(),
                content: (!self.text.trim().is_empty()).then(|| self.text.clone()),
            },
            None => ExtractedIntent::PlainText {
                content: self.text.clone(),
            },
        }
    }

    // -- state machine -------------------------------------------------------

    fn step(&mut self, ch: char, out: &mut Vec<Emission>) {
        match self.state {
            ExtractorState::Scanning if !self.armed => self.emit_char(ch, out),
            ExtractorState::Scanning if self.syntax.is_bare() => {
                if ch == '{' {
                    self.state = ExtractorState::AccumulatingArgs;
                    self.accumulate(ch, out);
                } else {
                    self.emit_char(ch, out);
                    self.disarm_after(ch);
                }
            }
            ExtractorState::Scanning => {
                if self.syntax.open_marker.starts_with(ch) {
                    self.held.push(ch);
                    self.state = ExtractorState::CandidateOpen;
                    self.check_candidate(out);
                } else {
                    self.emit_char(ch, out);
                    self.disarm_after(ch);
                }
            }
            ExtractorState::CandidateOpen => {
                self.held.push(ch);
                self.check_candidate(out);
            }
            ExtractorState::AccumulatingArgs => self.accumulate(ch, out),
            ExtractorState::ResolvedFunction if self.closing => {
                self.held.push(ch);
                self.check_close(out);
            }
            ExtractorState::ResolvedFunction | ExtractorState::EmittingText => {
                self.emit_char(ch, out);
            }
        }
    }

    /// Decide whether the held text is the marker, still a prefix of it,
    /// or neither.
    fn check_candidate(&mut self, out: &mut Vec<Emission>) {
        let marker = self.syntax.open_marker.as_str();
        if self.held == marker {
            tracing::debug!(marker, "function-call marker confirmed");
            self.consumed.push_str(&self.held);
            self.held.clear();
            self.state = ExtractorState::AccumulatingArgs;
            return;
        }
        if marker.starts_with(self.held.as_str()) {
            return;
        }

        // Disconfirmed.  Release the shortest head after which the rest
        // could still begin a marker, and keep scanning from there.  An
        // anchored marker cannot begin later, so everything goes.
        let keep_from = if self.syntax.anchored {
            self.held.len()
        } else {
            self.held
                .char_indices()
                .skip(1)
                .map(|(i, _)| i)
                .find(|&i| marker.starts_with(&self.held[i..]))
                .unwrap_or(self.held.len())
        };
        let released: String = self.held.drain(..keep_from).collect();
        self.emit(&released, out);
        if self.syntax.anchored {
            self.armed = false;
        }
        if self.held.is_empty() {
            self.state = ExtractorState::Scanning;
        }
    }

    fn accumulate(&mut self, ch: char, out: &mut Vec<Emission>) {
        self.payload.push(ch);
        if self.balance.track(ch) {
            let call = parse_call(self.syntax.style, &self.payload, true);
            self.settle(call, out);
            return;
        }

        // A closing marker before the payload balanced ends the call early.
        let Some(close) = self.syntax.close_marker.as_deref() else {
            return;
        };
        if !self.balance.in_string && self.payload.ends_with(close) {
            let cut = self.payload.len() - close.len();
            let call = parse_call(self.syntax.style, &self.payload[..cut], false);
            self.resolve(call, out);
            self.closing = false;
        }
    }

    /// Swallow an optional closing marker (and whitespace before it) right
    /// after the call.  Anything else is flushed as trailing text.
    fn check_close(&mut self, out: &mut Vec<Emission>) {
        let close = self.syntax.close_marker.as_deref().unwrap_or_default();
        let candidate = self.held.trim_start();
        if candidate.is_empty() {
            return;
        }
        if candidate == close {
            self.consumed.push_str(&self.held);
            self.held.clear();
            self.closing = false;
            return;
        }
        if close.starts_with(candidate) {
            return;
        }
        let held = std::mem::take(&mut self.held);
        self.closing = false;
        self.emit(&held, out);
    }

    /// Resolve the payload as a call, unless a bare payload turns out not to
    /// name a function.  Then it was ordinary text all along.
    fn settle(&mut self, call: FunctionCallIntent, out: &mut Vec<Emission>) {
        if self.syntax.is_bare() && call.name.is_empty() {
            tracing::debug!(len = self.payload.len(), "leading object is not a function call");
            let payload = std::mem::take(&mut self.payload);
            self.armed = false;
            self.state = ExtractorState::Scanning;
            self.emit(&payload, out);
            return;
        }
        self.resolve(call, out);
    }

    fn disarm_after(&mut self, ch: char) {
        if self.syntax.anchored && !ch.is_whitespace() {
            self.armed = false;
        }
    }

    fn resolve(&mut self, call: FunctionCallIntent, out: &mut Vec<Emission>) {
        tracing::debug!(
            name = %call.name,
            malformed = call.malformed,
            "function call resolved"
        );
        self.consumed.push_str(&self.payload);
        self.payload.clear();
        self.state = ExtractorState::ResolvedFunction;
        self.closing = self.syntax.close_marker.is_some();
        self.call = Some(call.clone());
        out.push(Emission::Call(call));
    }

    fn emit_char(&mut self, ch: char, out: &mut Vec<Emission>) {
        let mut buf = [0u8; 4];
        self.emit(ch.encode_utf8(&mut buf), out);
    }

    /// Record text as emitted, merging with a directly preceding text
    /// emission.
    fn emit(&mut self, text: &str, out: &mut Vec<Emission>) {
        if text.is_empty() {
            return;
        }
        self.text.push_str(text);
        if let Some(Emission::Text(last)) = out.last_mut() {
            last.push_str(text);
        } else {
            out.push(Emission::Text(text.to_owned()));
        }
    }
}

/// Read a complete generation in one go.
pub fn extract(syntax: &CallSyntax, text: &str) -> ExtractedIntent {
    let mut extractor = FunctionCallExtractor::new(syntax.clone());
    extractor.feed(text);
    extractor.finish();
    extractor.intent()
}

// ---------------------------------------------------------------------------
// Payload balance tracking
// ---------------------------------------------------------------------------

/// Tracks bracket nesting of the payload, ignoring brackets inside JSON
/// strings, to tell when it is syntactically complete.
#[derive(Debug, Default)]
struct Balance {
    opened: bool,
    depth: u32,
    in_string: bool,
    escaped: bool,
}

impl Balance {
    /// Track one character.  Returns `true` when the outermost bracket
    /// group has just closed.
    fn track(&mut self, ch: char) -> bool {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if ch == '\\' {
                self.escaped = true;
            } else if ch == '"' {
                self.in_string = false;
            }
            return false;
        }
        match ch {
            '"' if self.opened => self.in_string = true,
            '(' | '{' | '[' => {
                self.opened = true;
                self.depth += 1;
            }
            ')' | '}' | ']' if self.opened => {
                self.depth = self.depth.saturating_sub(1);
                return self.depth == 0;
            }
            _ => {}
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

/// Finds a `"function"` or `"name"` string field in payload text that did
/// not parse as JSON.
fn salvage_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#""(?:function|name)"\s*:\s*"([^"\\]*)""#).ok())
        .as_ref()
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// `[A-Za-z_][A-Za-z0-9_.-]*`
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(is_name_char)
}

/// Turn a payload into a call.  `complete` means the brackets balanced.
fn parse_call(style: ArgumentStyle, payload: &str, complete: bool) -> FunctionCallIntent {
    match style {
        ArgumentStyle::Parenthesized => parse_parenthesized(payload, complete),
        ArgumentStyle::JsonObject => parse_json_object(payload, complete),
    }
}

fn parse_parenthesized(payload: &str, complete: bool) -> FunctionCallIntent {
    let Some(open) = payload.find('(') else {
        let trimmed = payload.trim_start();
        let name_len = trimmed
            .find(|c: char| !is_name_char(c))
            .unwrap_or(trimmed.len());
        return FunctionCallIntent {
            name: trimmed[..name_len].to_owned(),
            arguments: CallArguments::Raw(trimmed[name_len..].to_owned()),
            malformed: true,
        };
    };

    let name = payload[..open].trim().to_owned();
    // When complete, the last character is the bracket that balanced.
    let end = if complete {
        payload.len() - 1
    } else {
        payload.len()
    };
    let body = payload.get(open + 1..end).unwrap_or_default();

    let arguments = if complete {
        parse_arguments(body)
    } else {
        CallArguments::Raw(body.to_owned())
    };
    let malformed = !complete || !is_valid_name(&name) || !is_object(&arguments);
    FunctionCallIntent {
        name,
        arguments,
        malformed,
    }
}

fn parse_json_object(payload: &str, complete: bool) -> FunctionCallIntent {
    let body = payload.trim();
    let parsed = complete
        .then(|| serde_json::from_str::<Value>(body).ok())
        .flatten();

    let Some(Value::Object(map)) = parsed else {
        let name = salvage_pattern()
            .and_then(|pattern| pattern.captures(body))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_owned())
            .unwrap_or_default();
        return FunctionCallIntent {
            name,
            arguments: CallArguments::Raw(body.to_owned()),
            malformed: true,
        };
    };

    let name = map
        .get("function")
        .or_else(|| map.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let arguments = match map.get("arguments").or_else(|| map.get("parameters")) {
        None | Some(Value::Null) => CallArguments::Json(Value::Object(Map::new())),
        Some(Value::String(encoded)) => parse_arguments(encoded),
        Some(other) => CallArguments::Json(other.clone()),
    };
    let malformed = !is_valid_name(&name) || !is_object(&arguments);
    FunctionCallIntent {
        name,
        arguments,
        malformed,
    }
}

fn parse_arguments(body: &str) -> CallArguments {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return CallArguments::Json(Value::Object(Map::new()));
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => CallArguments::Json(value),
        Err(e) => {
            tracing::debug!(error = %e, "function-call arguments are not valid JSON");
            CallArguments::Raw(body.to_owned())
        }
    }
}

fn is_object(arguments: &CallArguments) -> bool {
    matches!(arguments, CallArguments::Json(Value::Object(_)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
