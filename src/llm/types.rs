//! Common types for the model gateway

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use crate::store::{FailureKind, Message, Role};

/// One role/content pair of the request history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

impl From<&Message> for ChatTurn {
    fn from(message: &Message) -> Self {
        Self::new(message.role, message.content.clone())
    }
}

/// Token usage reported with the last chunk of a stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Events yielded by a completion stream.
///
/// A stream ends right after its first `Finished` or `Failed` delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamDelta {
    Token {
        text: String,
    },
    Finished {
        finish_reason: Option<String>,
        usage: Option<TokenUsage>,
    },
    Failed {
        kind: FailureKind,
        detail: String,
    },
}

impl StreamDelta {
    pub fn token(text: impl Into<String>) -> Self {
        StreamDelta::Token { text: text.into() }
    }

    pub fn finished() -> Self {
        StreamDelta::Finished {
            finish_reason: Some("stop".to_string()),
            usage: None,
        }
    }

    pub fn failed(kind: FailureKind, detail: impl Into<String>) -> Self {
        StreamDelta::Failed {
            kind,
            detail: detail.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::failed(FailureKind::Cancelled, "request cancelled")
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamDelta::Token { .. })
    }
}

/// Lazy, finite sequence of deltas for one request
pub type DeltaStream = Pin<Box<dyn Stream<Item = StreamDelta> + Send>>;
