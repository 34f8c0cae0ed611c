//! Session error types

use thiserror::Error;

use super::state::TurnState;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session is {actual}, expected {expected}")]
    InvalidState { expected: TurnState, actual: TurnState },

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Message {id} cannot be retried: {reason}")]
    NotRetryable { id: String, reason: String },

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Turn task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type SessionResult<T> = Result<T, SessionError>;
