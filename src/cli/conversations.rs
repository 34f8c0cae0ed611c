use anyhow::{anyhow, Result};
use clap::Subcommand;

use super::render::format_message;
use parley::{app::App, config::Config};

/// Inspect stored conversations
#[derive(Subcommand)]
pub enum ConversationsCommand {
    /// List conversations, most recently active first
    List {
        /// Maximum number of conversations to show
        #[arg(short = 'n', long = "limit", default_value_t = 20)]
        limit: u32,
    },
    /// Print the transcript of a conversation
    Show {
        /// Conversation ID
        id: String,
    },
    /// Delete a conversation and its messages
    Delete {
        /// Conversation ID
        id: String,
    },
}

impl ConversationsCommand {
    pub async fn execute(&self, config: &Config) -> Result<()> {
        let store = App::open_store(config).await?;

        match self {
            ConversationsCommand::List { limit } => {
                let conversations = store.list_conversations(Some(*limit)).await?;
                if conversations.is_empty() {
                    println!("No conversations yet.");
                }
                for conversation in conversations {
                    println!(
                        "{}  {}  {}",
                        conversation.id,
                        conversation.updated_at.format("%Y-%m-%d %H:%M"),
                        conversation.title
                    );
                }
            }
            ConversationsCommand::Show { id } => {
                let conversation = store
                    .get_conversation(id)
                    .await?
                    .ok_or_else(|| anyhow!("Conversation not found: {}", id))?;
                println!("{}", conversation.title);
                println!();
                for message in store.list_messages(id).await? {
                    println!("{}", format_message(&message));
                }
            }
            ConversationsCommand::Delete { id } => {
                if store.delete_conversation(id).await? {
                    println!("Deleted conversation {}", id);
                } else {
                    return Err(anyhow!("Conversation not found: {}", id));
                }
            }
        }

        Ok(())
    }
}
