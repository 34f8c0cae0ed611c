use anyhow::{anyhow, Result};
use clap::Args;
use std::io::{self, Read};
use tracing::{debug, info};

use super::render::{describe_failure, follow_turn, StreamPrinter};
use parley::{app::App, config::Config, session::TurnOutcome};

/// Run a single prompt non-interactively
#[derive(Args)]
pub struct RunCommand {
    /// The prompt to run. If not provided, will read from stdin
    pub prompt: Vec<String>,
}

impl RunCommand {
    pub async fn execute(&self, config: Config) -> Result<()> {
        debug!("Executing run command");

        // Get the prompt either from arguments or stdin
        let prompt = self.get_prompt()?;

        if prompt.trim().is_empty() {
            return Err(anyhow!("No prompt provided. Use arguments or pipe input via stdin."));
        }

        info!("Running prompt: {}", prompt.chars().take(50).collect::<String>());

        let app = App::init(config).await?;
        let session = app.new_session().await?;
        let mut subscription = session.subscribe();
        let mut printer = StreamPrinter::new(io::stdout());

        let handle = session.submit_user_message(&prompt).await?;
        let outcome = follow_turn(&session, handle, &mut subscription, &mut printer).await;

        session.close().await;
        app.shutdown();

        match outcome? {
            TurnOutcome::Completed(_) => Ok(()),
            TurnOutcome::Failed(message) => Err(anyhow!(
                "reply did not complete {}",
                describe_failure(message.failure.as_ref())
            )),
            TurnOutcome::Unsaved(_) => Err(anyhow!("reply could not be saved")),
            TurnOutcome::Aborted => Err(anyhow!("reply was aborted")),
        }
    }

    fn get_prompt(&self) -> Result<String> {
        if !self.prompt.is_empty() {
            // Join all arguments into a single prompt
            Ok(self.prompt.join(" "))
        } else {
            // Read from stdin
            debug!("Reading prompt from stdin");
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .map_err(|e| anyhow!("Failed to read from stdin: {}", e))?;
            Ok(buffer)
        }
    }
}
