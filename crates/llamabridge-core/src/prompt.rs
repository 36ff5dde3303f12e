//! Prompt composition.
//!
//! A completion model sees one flat string.  [`PromptComposer`] renders a
//! conversation into that string with a role-tagging [`PromptTemplate`],
//! puts declared functions into a `<FUNCTIONS>` preamble and collects the
//! stop sequences that keep the model from writing the next user turn.
//!
//! Composition is pure: same input, same prompt.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{BridgeError, Result};
use crate::extract::CallSyntax;
use crate::types::{ChatMessage, FunctionDeclaration, Role};

/// Placeholder for the function name in [`PromptTemplate::function_prefix`].
pub const NAME_PLACEHOLDER: &str = "{name}";

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// Per-role delimiters used to flatten a conversation.
///
/// Every message renders as `<role prefix><content><turn_suffix>`.  The
/// prompt always ends with the bare assistant prefix so the model continues
/// as the assistant.
///
/// With `fold_system`, system messages get no turn of their own: their
/// content is wrapped in `system_prefix`/`system_suffix` and placed at the
/// start of the next user (or function) turn, as Llama-2 expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub system_prefix: String,
    pub user_prefix: String,
    pub assistant_prefix: String,
    /// May contain `{name}`, replaced with the function's name.
    pub function_prefix: String,
    pub turn_suffix: String,
    /// Closes user and function turns instead of `turn_suffix`.
    #[serde(default)]
    pub user_suffix: Option<String>,
    #[serde(default)]
    pub fold_system: bool,
    /// Closes a folded system block.
    #[serde(default)]
    pub system_suffix: String,
    /// Replaces the stops derived from the delimiters.
    #[serde(default)]
    pub stops: Option<Vec<String>>,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::chatml()
    }
}

impl PromptTemplate {
    /// ChatML delimiters.
    pub fn chatml() -> Self {
        Self {
            system_prefix: "<|im_start|>system\n".into(),
            user_prefix: "<|im_start|>user\n".into(),
            assistant_prefix: "<|im_start|>assistant\n".into(),
            function_prefix: "<|im_start|>function name={name}\n".into(),
            turn_suffix: "<|im_end|>\n".into(),
            user_suffix: None,
            fold_system: false,
            system_suffix: String::new(),
            stops: None,
        }
    }

    /// `role: content` lines, for models without special tokens.
    pub fn plain() -> Self {
        Self {
            system_prefix: "system: ".into(),
            user_prefix: "user: ".into(),
            assistant_prefix: "assistant: ".into(),
            function_prefix: "function {name}: ".into(),
            turn_suffix: "\n".into(),
            user_suffix: None,
            fold_system: false,
            system_suffix: String::new(),
            stops: None,
        }
    }

    /// Llama-2 chat: `<s>[INST] <<SYS>>\n{system}\n<</SYS>>\n\n{user} [/INST] {reply}</s>`.
    ///
    /// Function results are replayed as user turns.  Stops are `user:` and
    /// `</s>`, which functionary fine-tunes emit when they run on.
    pub fn llama2() -> Self {
        Self {
            system_prefix: "<<SYS>>\n".into(),
            user_prefix: "<s>[INST] ".into(),
            assistant_prefix: " ".into(),
            function_prefix: "<s>[INST] Here is the response to that function call:\n\n".into(),
            turn_suffix: "</s>".into(),
            user_suffix: Some(" [/INST]".into()),
            fold_system: true,
            system_suffix: "\n<</SYS>>\n\n".into(),
            stops: Some(vec!["user:".into(), "</s>".into()]),
        }
    }

    /// Look up a built-in template by name.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "chatml" => Some(Self::chatml()),
            "plain" => Some(Self::plain()),
            "llama2" => Some(Self::llama2()),
            _ => None,
        }
    }

    /// Stops implied by the template: the user-turn delimiter and, unless
    /// it is only whitespace, the turn terminator.  Explicit `stops` win.
    pub fn stop_sequences(&self) -> Vec<String> {
        if let Some(stops) = &self.stops {
            return stops.iter().filter(|s| !s.is_empty()).cloned().collect();
        }
        [self.user_prefix.trim(), self.turn_suffix.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }

    fn prefix_for(&self, role: Role, name: Option<&str>) -> String {
        match role {
            Role::System => self.system_prefix.clone(),
            Role::User => self.user_prefix.clone(),
            Role::Assistant => self.assistant_prefix.clone(),
            Role::Function => self
                .function_prefix
                .replace(NAME_PLACEHOLDER, name.unwrap_or_default()),
        }
    }

    fn suffix_for(&self, role: Role) -> &str {
        match (role, &self.user_suffix) {
            (Role::User | Role::Function, Some(suffix)) => suffix,
            _ => &self.turn_suffix,
        }
    }
}

// ---------------------------------------------------------------------------
// Composer
// ---------------------------------------------------------------------------

/// The flat prompt and the stops to pass to the engine with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedPrompt {
    pub prompt: String,
    pub stop: Vec<String>,
}

/// Renders conversations with a fixed template and call syntax.
#[derive(Debug, Clone, Default)]
pub struct PromptComposer {
    template: PromptTemplate,
    syntax: CallSyntax,
}

impl PromptComposer {
    pub fn new(template: PromptTemplate, syntax: CallSyntax) -> Self {
        Self { template, syntax }
    }

    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    pub fn syntax(&self) -> &CallSyntax {
        &self.syntax
    }

    /// Compose the prompt for `messages`, advertising `functions`.
    ///
    /// `caller_stops` are appended after the template's stops; order is
    /// kept and duplicates dropped.
    pub fn compose(
        &self,
        messages: &[ChatMessage],
        functions: &[FunctionDeclaration],
        caller_stops: &[String],
    ) -> Result<ComposedPrompt> {
        let mut prompt = String::new();
        // System text waiting for the next user turn, when folding.
        let mut folded: Vec<String> = Vec::new();

        if !functions.is_empty() {
            let preamble = self.function_preamble(functions)?;
            if self.template.fold_system {
                folded.push(preamble);
            } else {
                self.push_segment(&mut prompt, Role::System, None, &preamble);
            }
        }

        for (index, message) in messages.iter().enumerate() {
            let body = self.render_body(message);
            let name = match message.role {
                Role::Function => Some(message.name.as_deref().ok_or_else(|| {
                    BridgeError::invalid(format!("messages[{index}]: function message requires a name"))
                })?),
                _ => None,
            };
            if !self.template.fold_system {
                self.push_segment(&mut prompt, message.role, name, &body);
                continue;
            }
            match message.role {
                Role::System => folded.push(body),
                Role::User | Role::Function => {
                    let body = format!("{}{body}", self.system_block(&mut folded));
                    self.push_segment(&mut prompt, message.role, name, &body);
                }
                Role::Assistant => {
                    self.flush_system(&mut prompt, &mut folded);
                    self.push_segment(&mut prompt, message.role, name, &body);
                }
            }
        }
        self.flush_system(&mut prompt, &mut folded);

        prompt.push_str(&self.template.assistant_prefix);

        let mut stop = self.template.stop_sequences();
        for extra in caller_stops {
            if !extra.is_empty() && !stop.contains(extra) {
                stop.push(extra.clone());
            }
        }

        tracing::trace!(
            messages = messages.len(),
            functions = functions.len(),
            prompt_len = prompt.len(),
            "prompt composed"
        );
        Ok(ComposedPrompt { prompt, stop })
    }

    fn push_segment(&self, prompt: &mut String, role: Role, name: Option<&str>, body: &str) {
        prompt.push_str(&self.template.prefix_for(role, name));
        prompt.push_str(body);
        prompt.push_str(self.template.suffix_for(role));
    }

    /// Wrap and drain pending system text; empty when there is none.
    fn system_block(&self, folded: &mut Vec<String>) -> String {
        if folded.is_empty() {
            return String::new();
        }
        let block = format!(
            "{}{}{}",
            self.template.system_prefix,
            folded.join("\n\n"),
            self.template.system_suffix
        );
        folded.clear();
        block
    }

    /// System text with no user turn to join gets a user turn of its own.
    fn flush_system(&self, prompt: &mut String, folded: &mut Vec<String>) {
        if folded.is_empty() {
            return;
        }
        let block = self.system_block(folded);
        self.push_segment(prompt, Role::User, None, &block);
    }

    /// Assistant turns that made a call are replayed in the call syntax.
    fn render_body(&self, message: &ChatMessage) -> String {
        let content = message.content_text();
        match &message.function_call {
            Some(call) => {
                let rendered = self.syntax.render_call(&call.name, &call.arguments);
                if content.trim().is_empty() {
                    rendered
                } else {
                    format!("{content}\n{rendered}")
                }
            }
            None => content.to_owned(),
        }
    }

    /// `<FUNCTIONS>` block plus the call instruction.
    fn function_preamble(&self, functions: &[FunctionDeclaration]) -> Result<String> {
        let listing: Vec<Value> = functions.iter().map(describe_function).collect();
        Ok(format!(
            "<FUNCTIONS>\n{}\n</FUNCTIONS>\n\n{}",
            to_pretty_json(&listing)?,
            self.syntax.instruction()
        ))
    }
}

/// `{"function", "description", "arguments": [{"name", "type", "required"}]}`
fn describe_function(function: &FunctionDeclaration) -> Value {
    let required: Vec<&str> = function
        .parameters
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let arguments: Vec<Value> = function
        .parameters
        .get("properties")
        .and_then(Value::as_object)
        .map(|properties| {
            properties
                .iter()
                .map(|(name, schema)| {
                    json!({
                        "name": name,
                        "type": schema.get("type").cloned().unwrap_or_else(|| json!("any")),
                        "required": required.contains(&name.as_str()),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    json!({
        "function": function.name,
        "description": function.description,
        "arguments": arguments,
    })
}

/// Four-space indented JSON.
fn to_pretty_json(value: &impl Serialize) -> Result<String> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;
    String::from_utf8(buf).map_err(|e| BridgeError::invalid(format!("non-utf8 function schema: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weather() -> FunctionDeclaration {
        FunctionDeclaration {
            name: "get_weather".into(),
            description: "Current weather for a city".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "location": {"type": "string"},
                    "unit": {"type": "string", "enum": ["c", "f"]}
                },
                "required": ["location"]
            }),
        }
    }

    #[test]
    fn renders_each_message_in_order() {
        let composer = PromptComposer::default();
        let messages = vec![
            ChatMessage::system("Be brief."),
            ChatMessage::user("Hi"),
            ChatMessage::assistant("Hello!"),
            ChatMessage::user("Bye"),
        ];
        let composed = composer.compose(&messages, &[], &[]).unwrap();
        assert_eq!(
            composed.prompt,
            "<|im_start|>system\nBe brief.<|im_end|>\n\
             <|im_start|>user\nHi<|im_end|>\n\
             <|im_start|>assistant\nHello!<|im_end|>\n\
             <|im_start|>user\nBye<|im_end|>\n\
             <|im_start|>assistant\n"
        );
        assert_eq!(composed.stop, vec!["<|im_start|>user", "<|im_end|>"]);
    }

    #[test]
    fn preamble_only_when_functions_declared() {
        let composer = PromptComposer::default();
        let messages = vec![ChatMessage::user("Weather in Paris?")];

        let without = composer.compose(&messages, &[], &[]).unwrap();
        assert!(!without.prompt.contains("<FUNCTIONS>"));
        assert_eq!(without.prompt.matches("<|im_start|>").count(), 2);

        let with = composer.compose(&messages, &[weather()], &[]).unwrap();
        assert!(with.prompt.starts_with("<|im_start|>system\n<FUNCTIONS>\n"));
        assert_eq!(with.prompt.matches("<|im_start|>").count(), 3);
        assert!(with.prompt.contains("\"function\": \"get_weather\""));
        assert!(with.prompt.contains("\"required\": true"));
        assert!(with.prompt.contains("<functioncall> function_name("));
    }

    #[test]
    fn preamble_uses_four_space_indent() {
        let composer = PromptComposer::default();
        let composed = composer
            .compose(&[ChatMessage::user("x")], &[weather()], &[])
            .unwrap();
        assert!(composed.prompt.contains("[\n    {\n        \"arguments\""));
    }

    #[test]
    fn function_message_requires_name() {
        let composer = PromptComposer::default();
        let mut message = ChatMessage::function_result("get_weather", "sunny");
        message.name = None;
        let err = composer
            .compose(&[ChatMessage::user("x"), message], &[], &[])
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRequest { .. }));
    }

    #[test]
    fn replays_calls_and_results() {
        let composer = PromptComposer::default();
        let messages = vec![
            ChatMessage::user("Weather in Paris?"),
            ChatMessage::assistant_call("get_weather", r#"{"location":"Paris"}"#),
            ChatMessage::function_result("get_weather", r#"{"temp":21}"#),
        ];
        let composed = composer.compose(&messages, &[], &[]).unwrap();
        assert!(composed.prompt.contains(
            "<|im_start|>assistant\n<functioncall> get_weather({\"location\":\"Paris\"})<|im_end|>\n"
        ));
        assert!(
            composed
                .prompt
                .contains("<|im_start|>function name=get_weather\n{\"temp\":21}<|im_end|>\n")
        );
    }

    #[test]
    fn caller_stops_are_merged_without_duplicates() {
        let composer = PromptComposer::new(PromptTemplate::plain(), CallSyntax::default());
        let stops = vec!["END".to_owned(), "user:".to_owned(), "END".to_owned()];
        let composed = composer
            .compose(&[ChatMessage::user("hi")], &[], &stops)
            .unwrap();
        assert_eq!(composed.stop, vec!["user:", "END"]);
        assert_eq!(composed.prompt, "user: hi\nassistant: ");
    }

    #[test]
    fn llama2_folds_system_into_first_user_turn() {
        let composer = PromptComposer::new(PromptTemplate::llama2(), CallSyntax::functionary());
        let messages = vec![
            ChatMessage::system("Be brief."),
            ChatMessage::user("Hi"),
            ChatMessage::assistant("Hello!"),
            ChatMessage::user("Bye"),
        ];
        let composed = composer.compose(&messages, &[], &[]).unwrap();
        assert_eq!(
            composed.prompt,
            "<s>[INST] <<SYS>>\nBe brief.\n<</SYS>>\n\nHi [/INST] Hello!</s>\
             <s>[INST] Bye [/INST] "
        );
        assert_eq!(composed.stop, vec!["user:", "</s>"]);
    }

    #[test]
    fn llama2_puts_functions_in_the_system_block() {
        let composer = PromptComposer::new(PromptTemplate::llama2(), CallSyntax::functionary());
        let messages = vec![ChatMessage::system("Be brief."), ChatMessage::user("Weather?")];
        let composed = composer.compose(&messages, &[weather()], &[]).unwrap();
        assert!(composed.prompt.starts_with("<s>[INST] <<SYS>>\n<FUNCTIONS>\n"));
        assert_eq!(composed.prompt.matches("<<SYS>>").count(), 1);
        assert!(composed.prompt.contains("</FUNCTIONS>"));
        assert!(composed.prompt.contains("\n\nBe brief.\n<</SYS>>\n\nWeather? [/INST] "));
        assert!(composed.prompt.contains(r#"respond with {"#));
        assert!(!composed.prompt.contains("<functioncall>"));
    }

    #[test]
    fn llama2_replays_calls_and_results_as_turns() {
        let composer = PromptComposer::new(PromptTemplate::llama2(), CallSyntax::functionary());
        let messages = vec![
            ChatMessage::user("Weather in Paris?"),
            ChatMessage::assistant_call("get_weather", r#"{"location":"Paris"}"#),
            ChatMessage::function_result("get_weather", "sunny"),
        ];
        let composed = composer.compose(&messages, &[], &[]).unwrap();
        assert!(composed.prompt.starts_with("<s>[INST] Weather in Paris? [/INST] {"));
        assert!(composed.prompt.contains("\"function\":\"get_weather\""));
        assert!(composed.prompt.ends_with(
            "</s><s>[INST] Here is the response to that function call:\n\nsunny [/INST] "
        ));
    }

    #[test]
    fn trailing_system_message_gets_its_own_turn() {
        let composer = PromptComposer::new(PromptTemplate::llama2(), CallSyntax::functionary());
        let composed = composer
            .compose(&[ChatMessage::system("Only rules.")], &[], &[])
            .unwrap();
        assert_eq!(
            composed.prompt,
            "<s>[INST] <<SYS>>\nOnly rules.\n<</SYS>>\n\n [/INST] "
        );
    }

    #[test]
    fn explicit_stops_replace_derived_ones() {
        let template = PromptTemplate {
            stops: Some(vec!["###".into()]),
            ..PromptTemplate::plain()
        };
        assert_eq!(template.stop_sequences(), vec!["###"]);
        assert_eq!(PromptTemplate::preset("llama2"), Some(PromptTemplate::llama2()));
    }

    #[test]
    fn composition_is_deterministic() {
        let composer = PromptComposer::default();
        let messages = vec![ChatMessage::user("Weather?")];
        let a = composer.compose(&messages, &[weather()], &[]).unwrap();
        let b = composer.compose(&messages, &[weather()], &[]).unwrap();
        assert_eq!(a, b);
    }
}
