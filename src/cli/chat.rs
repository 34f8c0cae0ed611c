use anyhow::{Context, Result};
use clap::Args;
use std::io::{self, Write};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use super::render::{follow_turn, format_message, StreamPrinter};
use parley::{
    app::App,
    config::Config,
    session::{SessionEngine, SessionError},
};

const RETRY_HINT: &str = "Type /retry to try again.";

/// Chat interactively
#[derive(Args)]
pub struct ChatCommand {
    /// Continue an existing conversation
    #[arg(short = 'c', long = "conversation")]
    pub conversation: Option<String>,
}

impl ChatCommand {
    pub async fn execute(&self, config: Config) -> Result<()> {
        let app = App::init(config).await?;

        let session = match &self.conversation {
            Some(id) => app
                .open_session(id)
                .await
                .with_context(|| format!("Failed to open conversation {}", id))?,
            None => app.new_session().await?,
        };

        println!("Conversation {}", session.conversation_id());
        println!("Commands: /retry, /history, /quit. Ctrl-C stops a streaming reply.");

        let result = repl(&session).await;

        session.close().await;
        app.shutdown();
        result
    }
}

async fn repl(session: &SessionEngine) -> Result<()> {
    let mut subscription = session.subscribe();
    let mut printer = StreamPrinter::new(io::stdout()).with_retry_hint(RETRY_HINT);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        let line = line.trim();

        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/history" => {
                for message in session.messages().await? {
                    println!("{}", format_message(&message));
                }
            }
            "/retry" => match session.last_failed().await? {
                Some(failed) => {
                    let handle = session.retry(&failed.id).await?;
                    follow_turn(session, handle, &mut subscription, &mut printer).await?;
                }
                None => println!("Nothing to retry."),
            },
            text => match session.submit_user_message(text).await {
                Ok(handle) => {
                    follow_turn(session, handle, &mut subscription, &mut printer).await?;
                }
                Err(SessionError::EmptyMessage) => continue,
                Err(e) => return Err(e.into()),
            },
        }
    }

    debug!("Leaving chat for conversation {}", session.conversation_id());
    Ok(())
}
