//! Conversation and message records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Title given to a conversation before its first user message arrives
pub const DEFAULT_TITLE: &str = "New conversation";

/// Maximum number of characters kept in a derived title
const TITLE_MAX_CHARS: usize = 48;

/// Role of a message in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Lifecycle of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Streaming,
    Complete,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Streaming => "streaming",
            MessageStatus::Complete => "complete",
            MessageStatus::Failed => "failed",
        }
    }

    /// Pending and streaming messages belong to a turn that has not ended yet
    pub fn is_in_flight(&self) -> bool {
        matches!(self, MessageStatus::Pending | MessageStatus::Streaming)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "streaming" => Ok(MessageStatus::Streaming),
            "complete" => Ok(MessageStatus::Complete),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(format!("unknown message status '{}'", other)),
        }
    }
}

/// Why an assistant message ended in the failed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No data arrived within the read timeout
    Timeout,
    /// Connection refused, reset, or closed early; server-side 5xx
    Transport,
    /// Provider throttling
    RateLimited,
    /// The stream carried a payload that could not be decoded
    InvalidResponse,
    /// The provider refused the request (auth, bad request, content filter)
    Rejected,
    /// Stopped by the user, or interrupted by a previous process exit
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Transport => "transport",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::InvalidResponse => "invalid_response",
            FailureKind::Rejected => "rejected",
            FailureKind::Cancelled => "cancelled",
        }
    }

    /// Whether re-issuing the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::Timeout | FailureKind::Transport | FailureKind::RateLimited
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timeout" => Ok(FailureKind::Timeout),
            "transport" => Ok(FailureKind::Transport),
            "rate_limited" => Ok(FailureKind::RateLimited),
            "invalid_response" => Ok(FailureKind::InvalidResponse),
            "rejected" => Ok(FailureKind::Rejected),
            "cancelled" => Ok(FailureKind::Cancelled),
            other => Err(format!("unknown failure kind '{}'", other)),
        }
    }
}

/// Failure details attached to a failed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub detail: Option<String>,
}

impl Failure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            detail: None,
        }
    }
}

/// A stored conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    /// Position inside the conversation, starting at 1
    pub seq: i64,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    pub failure: Option<Failure>,
    /// For assistant messages: the user message being answered
    pub reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn is_in_flight(&self) -> bool {
        self.status.is_in_flight()
    }

    pub fn is_complete(&self) -> bool {
        self.status == MessageStatus::Complete
    }
}

/// Parameters for appending a message
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    pub reply_to: Option<String>,
}

impl NewMessage {
    /// A finished user message
    pub fn user(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            role: Role::User,
            content: content.into(),
            status: MessageStatus::Complete,
            reply_to: None,
        }
    }

    /// An empty assistant draft answering `reply_to`
    pub fn draft(conversation_id: impl Into<String>, reply_to: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            role: Role::Assistant,
            content: String::new(),
            status: MessageStatus::Pending,
            reply_to: Some(reply_to.into()),
        }
    }
}

/// Build a conversation title from the first user message.
///
/// Whitespace runs collapse to single spaces. Long text is cut at the last word
/// boundary in the final third of the budget, or at the budget itself, and gets an
/// ellipsis.
pub fn derive_title(text: &str) -> String {
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        return DEFAULT_TITLE.to_string();
    }

    if cleaned.chars().count() <= TITLE_MAX_CHARS {
        return cleaned;
    }

    let truncated: String = cleaned.chars().take(TITLE_MAX_CHARS).collect();
    let min_cut = TITLE_MAX_CHARS * 2 / 3;
    let cut = truncated
        .char_indices()
        .filter(|(_, c)| *c == ' ')
        .map(|(i, _)| i)
        .filter(|i| truncated[..*i].chars().count() >= min_cut)
        .last();

    match cut {
        Some(index) => format!("{}...", &truncated[..index]),
        None => format!("{}...", truncated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_round_trip_through_str() {
        for status in [
            MessageStatus::Pending,
            MessageStatus::Streaming,
            MessageStatus::Complete,
            MessageStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<MessageStatus>().unwrap(), status);
        }
        assert_eq!("rate_limited".parse::<FailureKind>().unwrap(), FailureKind::RateLimited);
        assert!("bogus".parse::<Role>().is_err());
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(FailureKind::Timeout.is_retryable());
        assert!(FailureKind::RateLimited.is_retryable());
        assert!(!FailureKind::InvalidResponse.is_retryable());
        assert!(!FailureKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_derive_title_short_text() {
        assert_eq!(derive_title("  Hello   there\n"), "Hello there");
        assert_eq!(derive_title("   "), DEFAULT_TITLE);
    }

    #[test]
    fn test_derive_title_cuts_on_word_boundary() {
        let text = "Explain how the borrow checker reasons about lifetimes in async code";
        let title = derive_title(text);
        assert!(title.ends_with("..."));
        assert!(title.chars().count() <= TITLE_MAX_CHARS + 3);
        assert!(!title.trim_end_matches("...").ends_with(' '));
        assert!(text.starts_with(title.trim_end_matches("...")));
    }

    #[test]
    fn test_derive_title_without_spaces() {
        let text = "字".repeat(100);
        let title = derive_title(&text);
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
    }
}
