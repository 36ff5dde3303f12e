//! CLI entry point for llamabridge.
//!
//! This binary provides the `llamabridge` command: `serve` runs the HTTP
//! server, `render` shows the prompt a request turns into.

mod cli;
mod helpers;

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use llamabridge_core::api::ChatCompletionRequest;
use llamabridge_core::CompletionAdapter;
use llamabridge_web::{WebConfig, WebServer};

use crate::cli::{Cli, Commands};
use crate::helpers::{Overrides, build_engine, init_tracing, load_config};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    match cli.command {
        Commands::Serve {
            config,
            bind,
            port,
            engine_url,
            model,
        } => {
            let overrides = Overrides {
                bind,
                port,
                engine_url,
                model,
            };
            cmd_serve(config.as_deref(), overrides).await
        }
        Commands::Render { request, config } => cmd_render(&request, config.as_deref()),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: serve
// ---------------------------------------------------------------------------

async fn cmd_serve(config_path: Option<&Path>, overrides: Overrides) -> Result<()> {
    let config = load_config(config_path, overrides)?;
    info!(
        engine = ?config.engine.kind,
        model = %config.engine.model_id,
        max_concurrent = config.engine.max_concurrent,
        "configuration loaded"
    );

    let engine = build_engine(&config)?;
    let web_config = WebConfig::from(&config.server);
    let adapter = CompletionAdapter::new(engine, Arc::new(config))
        .context("failed to build completion adapter")?;

    WebServer::new(web_config, adapter)
        .start()
        .await
        .context("web server failed")?;

    info!("llamabridge stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: render
// ---------------------------------------------------------------------------

fn cmd_render(request_path: &Path, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path, Overrides::default())?;

    let body = if request_path == Path::new("-") {
        let mut body = String::new();
        std::io::stdin()
            .read_to_string(&mut body)
            .context("failed to read request from stdin")?;
        body
    } else {
        std::fs::read_to_string(request_path)
            .with_context(|| format!("failed to read {}", request_path.display()))?
    };

    let wire: ChatCompletionRequest =
        serde_json::from_str(&body).context("request is not a valid chat completion body")?;
    let request = wire
        .into_request(&config.sampling, &config.engine.model_id)
        .context("invalid request")?;

    // Composing does not contact the engine.
    let engine = build_engine(&config)?;
    let adapter = CompletionAdapter::new(engine, Arc::new(config))
        .context("failed to build completion adapter")?;
    let composed = adapter.prepare(&request).context("invalid request")?;

    print!("{}", composed.prompt);
    eprintln!();
    eprintln!(
        "stop sequences: {}",
        serde_json::to_string(&composed.stop).context("failed to encode stop sequences")?
    );
    Ok(())
}
