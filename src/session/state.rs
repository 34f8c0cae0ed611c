//! Turn states and the bookkeeping for the active turn

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::store::Message;

/// Where a session is in its current turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    AwaitingFirstToken,
    Streaming,
    Finalizing,
    Failed,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::AwaitingFirstToken => "awaiting_first_token",
            TurnState::Streaming => "streaming",
            TurnState::Finalizing => "finalizing",
            TurnState::Failed => "failed",
        }
    }

    /// Whether cancelling has anything to stop
    pub fn is_cancellable(&self) -> bool {
        matches!(self, TurnState::AwaitingFirstToken | TurnState::Streaming)
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a turn ended
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The assistant message was finalized as complete
    Completed(Message),
    /// The assistant message was finalized as failed (including cancellation)
    Failed(Message),
    /// The reply ended but its final state could not be written
    Unsaved(Message),
    /// The turn stopped before a draft existed
    Aborted,
}

pub(crate) type OutcomeSender = watch::Sender<Option<TurnOutcome>>;
pub(crate) type OutcomeReceiver = watch::Receiver<Option<TurnOutcome>>;

/// Mutable session state, guarded by a short synchronous lock
#[derive(Debug)]
pub(crate) struct SessionState {
    pub turn: TurnState,
    pub active: Option<ActiveTurn>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            turn: TurnState::Idle,
            active: None,
        }
    }
}

/// Handles shared between the engine and the task running a turn
#[derive(Debug, Clone)]
pub(crate) struct ActiveTurn {
    pub cancel: CancellationToken,
    pub done: OutcomeReceiver,
}

/// Waits on the outcome of a submitted turn
#[derive(Debug, Clone)]
pub struct TurnHandle {
    /// The user message being answered
    pub user_message_id: String,
    /// The assistant draft this turn writes into
    pub draft_message_id: String,
    pub(crate) done: OutcomeReceiver,
}

impl TurnHandle {
    /// Wait for the turn to end
    pub async fn wait(mut self) -> TurnOutcome {
        wait_for_outcome(&mut self.done).await
    }
}

pub(crate) async fn wait_for_outcome(done: &mut OutcomeReceiver) -> TurnOutcome {
    match done.wait_for(|outcome| outcome.is_some()).await {
        Ok(outcome) => outcome.clone().unwrap_or(TurnOutcome::Aborted),
        // The turn task went away without reporting
        Err(_) => TurnOutcome::Aborted,
    }
}
