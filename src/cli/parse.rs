//! CLI parse: clap types for Librarian. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Librarian CLI - chat-completion gateway to persistent remote agents
#[derive(Parser)]
#[command(name = "librarian")]
#[command(about = "Load-managed gateway from chat-completion models to persistent remote agents")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory searched for librarian.toml and config/{LIBRARIAN_ENV}.toml
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Disable logging entirely
    #[arg(long, short = 'q')]
    pub quiet: bool,

    /// Enable verbose logging (default: off)
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List logical models and the agents behind them
    Models {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Print the resolved configuration as TOML
    Config,
    /// Send one message through the dispatcher and print the reply
    Chat {
        /// Logical model name
        #[arg(long, default_value = "gpt-4")]
        model: String,
        /// Print the reply as it streams in
        #[arg(long)]
        stream: bool,
        /// Maximum seconds to wait for an available agent
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Message text
        message: String,
    },
}
