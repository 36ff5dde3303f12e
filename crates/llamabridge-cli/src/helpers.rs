//! Shared helpers for the CLI subcommands.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use llamabridge_core::{BridgeConfig, Engine, EngineKind, ScriptedEngine};
use llamabridge_engine::{LlamaCppConfig, LlamaCppEngine};

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the global tracing subscriber.
pub fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Flags that override the file and the environment.
#[derive(Debug, Default)]
pub struct Overrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub engine_url: Option<String>,
    pub model: Option<String>,
}

/// Load configuration: file (or defaults), then `LLAMABRIDGE_*` variables,
/// then command-line flags.
pub fn load_config(path: Option<&Path>, overrides: Overrides) -> Result<BridgeConfig> {
    let mut config = BridgeConfig::load(path).context("failed to load configuration")?;
    config
        .apply_env()
        .context("invalid LLAMABRIDGE_* environment override")?;

    if let Some(bind) = overrides.bind {
        config.server.bind_addr = bind;
    }
    if let Some(port) = overrides.port {
        config.server.port = port;
    }
    if let Some(url) = overrides.engine_url {
        config.engine.base_url = url;
    }
    if let Some(model) = overrides.model {
        config.engine.model_id = model;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Build the engine selected by `[engine] kind`.
pub fn build_engine(config: &BridgeConfig) -> Result<Arc<dyn Engine>> {
    let engine: Arc<dyn Engine> = match config.engine.kind {
        EngineKind::LlamaCpp => {
            let engine = LlamaCppEngine::new(LlamaCppConfig::from(&config.engine))
                .context("failed to create llama.cpp engine")?;
            tracing::info!(base_url = %config.engine.base_url, "using llama.cpp engine");
            Arc::new(engine)
        }
        EngineKind::Scripted => {
            tracing::info!(
                fragments = config.engine.scripted_reply.len(),
                "using scripted engine"
            );
            Arc::new(
                ScriptedEngine::new(
                    config.engine.model_id.clone(),
                    config.engine.scripted_reply.iter().cloned(),
                )
                .with_embeddings(16),
            )
        }
    };
    Ok(engine)
}
