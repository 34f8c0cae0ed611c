//! Conversation sessions
//!
//! This module drives chat turns for one conversation: persisting messages,
//! streaming replies, checkpointing partial output, and recovering cleanly
//! from cancellation and provider faults.

mod checkpoint;
mod engine;
mod errors;
mod history;
mod locks;
mod retry;
mod state;

pub use checkpoint::CheckpointPolicy;
pub use engine::{SessionEngine, SessionSettings, DEFAULT_MAX_HISTORY_CHARS};
pub use errors::{SessionError, SessionResult};
pub use history::build_history;
pub use retry::RetryPolicy;
pub use state::{TurnHandle, TurnOutcome, TurnState};
