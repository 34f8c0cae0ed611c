use anyhow::Result;
use std::io::Write;

use parley::{
    observer::{SessionSnapshot, Subscription},
    session::{SessionEngine, TurnHandle, TurnOutcome},
    store::{Failure, FailureKind, Message, MessageStatus, Role},
};

/// Shown when a reply was displayed but never reached the store
pub const UNSAVED_NOTE: &str = "[warning: this reply could not be saved]";

/// Prints a streaming assistant reply incrementally
pub struct StreamPrinter<W: Write> {
    out: W,
    message_id: Option<String>,
    printed: usize,
    retry_hint: Option<&'static str>,
}

impl<W: Write> StreamPrinter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            message_id: None,
            printed: 0,
            retry_hint: None,
        }
    }

    /// Hint printed under a failed reply that can be retried
    pub fn with_retry_hint(mut self, hint: &'static str) -> Self {
        self.retry_hint = Some(hint);
        self
    }

    /// Print a line of its own under the reply
    pub fn note(&mut self, text: &str) -> std::io::Result<()> {
        writeln!(self.out, "{}", text)?;
        self.out.flush()
    }

    pub fn render(&mut self, snapshot: &SessionSnapshot) -> std::io::Result<()> {
        let Some(message) = &snapshot.message else {
            return Ok(());
        };
        if message.role != Role::Assistant {
            return Ok(());
        }

        if self.message_id.as_deref() != Some(message.id.as_str()) {
            self.message_id = Some(message.id.clone());
            self.printed = 0;
        }

        // Content only ever grows while a reply streams
        if let Some(fresh) = message.content.get(self.printed..) {
            if !fresh.is_empty() {
                self.out.write_all(fresh.as_bytes())?;
                self.printed = message.content.len();
            }
        }

        if snapshot.terminal {
            match (&message.status, &message.failure) {
                (MessageStatus::Failed, Some(failure)) if failure.kind == FailureKind::Cancelled => {
                    writeln!(self.out, " [stopped]")?;
                }
                (MessageStatus::Failed, failure) => {
                    if self.printed > 0 {
                        writeln!(self.out)?;
                    }
                    writeln!(self.out, "{}", describe_failure(failure.as_ref()))?;
                    if let Some(hint) = self.retry_hint {
                        writeln!(self.out, "{}", hint)?;
                    }
                }
                _ => writeln!(self.out)?,
            }
            self.message_id = None;
            self.printed = 0;
        }

        self.out.flush()
    }
}

/// One-line description of why a reply failed
pub fn describe_failure(failure: Option<&Failure>) -> String {
    match failure {
        Some(failure) => match failure.detail.as_deref() {
            Some(detail) if !detail.is_empty() => format!("[failed: {}] {}", failure.kind, detail),
            _ => format!("[failed: {}]", failure.kind),
        },
        None => "[failed]".to_string(),
    }
}

/// Render a stored message for transcripts
pub fn format_message(message: &Message) -> String {
    let speaker = match message.role {
        Role::User => "you",
        Role::Assistant => "assistant",
        Role::System => "system",
    };

    let mut line = format!("[{}] {}", speaker, message.content);
    match message.status {
        MessageStatus::Failed => match &message.failure {
            Some(failure) if failure.kind == FailureKind::Cancelled => line.push_str(" [stopped]"),
            failure => {
                line.push(' ');
                line.push_str(&describe_failure(failure.as_ref()));
            }
        },
        MessageStatus::Pending | MessageStatus::Streaming => line.push_str(" [in progress]"),
        MessageStatus::Complete => {}
    }
    line
}

/// Print a turn as it streams. Ctrl-C cancels the turn and keeps its partial text.
pub async fn follow_turn<W: Write>(
    session: &SessionEngine,
    handle: TurnHandle,
    subscription: &mut Subscription,
    printer: &mut StreamPrinter<W>,
) -> Result<TurnOutcome> {
    let draft_id = handle.draft_message_id.clone();

    loop {
        tokio::select! {
            snapshot = subscription.next() => {
                let Some(snapshot) = snapshot else { break };
                printer.render(&snapshot)?;
                let ours = snapshot.message.as_ref().is_some_and(|m| m.id == draft_id);
                if snapshot.terminal && ours {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                session.cancel().await;
            }
        }
    }

    let outcome = handle.wait().await;
    if let TurnOutcome::Unsaved(_) = outcome {
        printer.note(UNSAVED_NOTE)?;
    }
    Ok(outcome)
}
