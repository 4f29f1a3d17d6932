//! CLI definitions for grex.
//!
//! Uses clap for argument parsing with derive macros.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// grex - Incremental group chat activity extractor
#[derive(Parser, Debug)]
#[command(name = "grex")]
#[command(version)]
#[command(about = "Incrementally extract the activity of a group chat")]
#[command(long_about = r#"
grex pulls the history of one group chat from a messaging session bridge,
enriches every message with reactions, media metadata and links, and keeps a
crash-safe JSON checkpoint that report generators can read at any time.

Quick start:
  1. Start the session bridge and authenticate it
  2. Run: grex run --chat <chat-id>
  3. Inspect progress: grex status
"#)]
pub struct Cli {
    /// Directory holding the checkpoint files
    #[arg(long, env = "GREX_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Configuration file (defaults to ~/.config/grex/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (defaults to `output.format` from the config)
    #[arg(long, short = 'f', global = true)]
    pub format: Option<OutputFormat>,

    /// Be verbose (repeat for trace output)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Be quiet (errors only)
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Cold start, then monitor for new messages until interrupted
    Run(RunArgs),

    /// Summarize the stored checkpoint
    Status(StatusArgs),

    /// Show or manage configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Chat to extract
    #[arg(long, short = 'c', env = "GREX_CHAT_ID")]
    pub chat: Option<String>,

    /// Session bridge base URL
    #[arg(long, env = "GREX_UPSTREAM_URL")]
    pub upstream: Option<String>,

    /// Seconds between monitor polls
    #[arg(long)]
    pub interval: Option<u64>,

    /// Reaction monitor dataset
    #[arg(long)]
    pub reactions_file: Option<PathBuf>,

    /// Skip media downloads
    #[arg(long)]
    pub no_media: bool,

    /// Query live reactions before trusting the inline list
    #[arg(long)]
    pub prefer_live_reactions: bool,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Number of recent errors to show
    #[arg(long, short = 'n', default_value = "5")]
    pub errors: usize,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Show the effective configuration
    #[arg(long)]
    pub show: bool,

    /// Write a default configuration file
    #[arg(long)]
    pub init: bool,

    /// Print the configuration file location
    #[arg(long)]
    pub path: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}

#[derive(ValueEnum, Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    JsonPretty,
}
