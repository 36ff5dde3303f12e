//! Bridge configuration.
//!
//! [`BridgeConfig`] is read from a TOML file with five sections:
//!
//! ```toml
//! [server]
//! bind_addr = "127.0.0.1"
//! port = 8000
//! request_timeout_secs = 300
//!
//! [engine]
//! kind = "llama_cpp"          # or "scripted"
//! base_url = "http://127.0.0.1:8080"
//! model_id = "local-model"
//! max_concurrent = 1
//!
//! [sampling]
//! temperature = 0.2
//! top_p = 0.95
//! max_tokens = 512
//!
//! [prompt]
//! preset = "chatml"           # or "plain", "llama2", or set [prompt.template]
//!
//! [function_call]
//! preset = "functioncall"     # or "tagged", "functionary"
//! ```
//!
//! Every field has a default, so an empty file is valid.  `LLAMABRIDGE_*`
//! environment variables override the file, and the CLI overrides both.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::extract::{ArgumentStyle, CallSyntax};
use crate::prompt::PromptTemplate;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "LLAMABRIDGE_";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub sampling: SamplingDefaults,
    pub prompt: PromptConfig,
    pub function_call: FunctionCallConfig,
}

/// `[server]`: where the HTTP surface listens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// `0` picks a free port.
    pub port: u16,
    /// Upper bound on one request, streaming included.  `0` disables it.
    pub request_timeout_secs: u64,
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            port: 8000,
            request_timeout_secs: 300,
            cors: true,
        }
    }
}

impl ServerConfig {
    /// `bind_addr:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

/// Which engine implementation backs the bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// A llama.cpp `server` reachable over HTTP.
    #[default]
    LlamaCpp,
    /// The in-process scripted engine.
    Scripted,
}

/// `[engine]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,
    /// Base URL of the llama.cpp server.
    pub base_url: String,
    /// Model name reported by `/v1/models` and `/health`.
    pub model_id: String,
    /// Generations allowed to run against the engine at once.
    pub max_concurrent: usize,
    /// Fragments replayed by the scripted engine.
    pub scripted_reply: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::LlamaCpp,
            base_url: "http://127.0.0.1:8080".into(),
            model_id: "local-model".into(),
            max_concurrent: 1,
            scripted_reply: vec!["Hello from llamabridge.".into()],
        }
    }
}

/// `[sampling]`: values used when a request leaves them out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingDefaults {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub top_k: Option<u32>,
    pub repeat_penalty: Option<f32>,
}

impl Default for SamplingDefaults {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            top_p: 0.95,
            max_tokens: 512,
            top_k: Some(40),
            repeat_penalty: Some(1.1),
        }
    }
}

/// `[prompt]`: a named preset, or a full custom template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub preset: String,
    /// Takes precedence over `preset` when present.
    pub template: Option<PromptTemplate>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            preset: "chatml".into(),
            template: None,
        }
    }
}

impl PromptConfig {
    /// Resolve the template to use.
    pub fn resolve(&self) -> Result<PromptTemplate> {
        if let Some(template) = &self.template {
            return Ok(template.clone());
        }
        PromptTemplate::preset(&self.preset).ok_or_else(|| BridgeError::Config {
            reason: format!("unknown prompt preset '{}'", self.preset),
        })
    }
}

/// `[function_call]`: a named syntax preset with optional overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionCallConfig {
    pub preset: String,
    pub open_marker: Option<String>,
    pub close_marker: Option<String>,
    pub style: Option<ArgumentStyle>,
    pub anchored: Option<bool>,
}

impl Default for FunctionCallConfig {
    fn default() -> Self {
        Self {
            preset: "functioncall".into(),
            open_marker: None,
            close_marker: None,
            style: None,
            anchored: None,
        }
    }
}

impl FunctionCallConfig {
    /// Resolve the call syntax: preset first, then field overrides.
    pub fn resolve(&self) -> Result<CallSyntax> {
        let mut syntax = match self.preset.as_str() {
            "functioncall" => CallSyntax::default(),
            "tagged" => CallSyntax::tagged(),
            "functionary" => CallSyntax::functionary(),
            other => {
                return Err(BridgeError::Config {
                    reason: format!("unknown function_call preset '{other}'"),
                });
            }
        };
        if let Some(open) = &self.open_marker {
            syntax.open_marker = open.clone();
        }
        if let Some(close) = &self.close_marker {
            syntax.close_marker = (!close.is_empty()).then(|| close.clone());
        }
        if let Some(style) = self.style {
            syntax.style = style;
        }
        if let Some(anchored) = self.anchored {
            syntax.anchored = anchored;
        }
        syntax.validate()?;
        Ok(syntax)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl BridgeConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            tracing::debug!("no config file given, using defaults");
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(path).map_err(|e| BridgeError::Config {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| BridgeError::Config {
            reason: format!("failed to parse TOML config: {e}"),
        })
    }

    /// Apply `LLAMABRIDGE_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
    }

    /// Apply overrides from `lookup`, which maps a full variable name such
    /// as `LLAMABRIDGE_PORT` to its value.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));

        if let Some(bind) = var("BIND") {
            self.server.bind_addr = bind;
        }
        if let Some(port) = var("PORT") {
            self.server.port = parse_override("PORT", &port)?;
        }
        if let Some(url) = var("ENGINE_URL") {
            self.engine.base_url = url;
        }
        if let Some(model) = var("MODEL") {
            self.engine.model_id = model;
        }
        if let Some(limit) = var("MAX_CONCURRENT") {
            self.engine.max_concurrent = parse_override("MAX_CONCURRENT", &limit)?;
        }
        Ok(())
    }

    /// Check cross-field constraints and that presets resolve.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: &str| {
            Err(BridgeError::Config {
                reason: reason.to_owned(),
            })
        };
        if self.engine.max_concurrent == 0 {
            return fail("engine.max_concurrent must be at least 1");
        }
        if self.engine.model_id.trim().is_empty() {
            return fail("engine.model_id must not be blank");
        }
        if self.sampling.max_tokens == 0 {
            return fail("sampling.max_tokens must be positive");
        }
        if !(self.sampling.temperature.is_finite() && self.sampling.temperature >= 0.0) {
            return fail("sampling.temperature must be a non-negative number");
        }
        if !(self.sampling.top_p.is_finite() && (0.0..=1.0).contains(&self.sampling.top_p)) {
            return fail("sampling.top_p must be within 0..=1");
        }
        self.prompt.resolve()?;
        self.function_call.resolve()?;
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| BridgeError::Config {
        reason: format!("{ENV_PREFIX}{name}: invalid value '{value}'"),
    })
}
