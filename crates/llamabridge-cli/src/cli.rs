//! CLI argument definitions for llamabridge.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// llamabridge -- an OpenAI-compatible API over a local model.
#[derive(Parser)]
#[command(
    name = "llamabridge",
    version,
    about = "llamabridge -- OpenAI-compatible API over a local model",
    long_about = "Serves /v1/chat/completions (with function calling and streaming), \
                  /v1/embeddings and /v1/models on top of a llama.cpp server."
)]
pub struct Cli {
    /// Default log level when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server.
    Serve {
        /// Path to a TOML configuration file.
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Address to bind the HTTP server to.
        #[arg(long)]
        bind: Option<String>,

        /// Port to listen on.
        #[arg(long, short)]
        port: Option<u16>,

        /// Base URL of the llama.cpp server.
        #[arg(long)]
        engine_url: Option<String>,

        /// Model name reported to clients.
        #[arg(long)]
        model: Option<String>,
    },

    /// Print the prompt a chat completion request would send to the engine.
    Render {
        /// Request body as JSON; `-` reads standard input.
        request: PathBuf,

        /// Path to a TOML configuration file.
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}
