use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use super::{chat::ChatCommand, conversations::ConversationsCommand, run::RunCommand};
use parley::config::Config;

/// Parley - chat with GLM models from your terminal
#[derive(Parser)]
#[command(
    name = "parley",
    version,
    about = "Chat with GLM models from your terminal",
    long_about = r#"Parley streams answers from a GLM chat model and keeps every conversation in a local SQLite database.

Examples:
  parley chat                         # Start a new conversation
  parley chat --conversation <ID>     # Continue a conversation
  parley run "explain borrowing"      # Run a single prompt
  parley conversations list           # Show stored conversations"#
)]
pub struct Cli {
    /// Directory holding the conversation database
    #[arg(long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'd', long = "debug", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Chat interactively
    Chat(ChatCommand),
    /// Run a single prompt non-interactively
    Run(RunCommand),
    /// Inspect stored conversations
    #[command(subcommand)]
    Conversations(ConversationsCommand),
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        if self.debug {
            debug!("Debug logging enabled");
        }

        // Initialize configuration
        let mut config = Config::init().await?;
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        debug!("Configuration initialized, data dir {}", config.data_dir.display());

        match self.command {
            Commands::Chat(chat_cmd) => chat_cmd.execute(config).await,
            Commands::Run(run_cmd) => run_cmd.execute(config).await,
            Commands::Conversations(conversations_cmd) => conversations_cmd.execute(&config).await,
        }
    }
}
