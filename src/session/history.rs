//! Request history assembly

use crate::{
    llm::ChatTurn,
    store::{Message, Role},
};

/// Build the history sent to the gateway.
///
/// Only complete messages are included. When their total length exceeds
/// `max_chars`, the oldest turns are dropped first; the newest message is kept
/// even if it alone exceeds the budget. The system prompt is not subject to
/// trimming.
pub fn build_history(system_message: Option<&str>, messages: &[Message], max_chars: usize) -> Vec<ChatTurn> {
    let complete: Vec<&Message> = messages.iter().filter(|m| m.is_complete()).collect();

    let system = system_message
        .map(str::trim)
        .filter(|prompt| !prompt.is_empty())
        .map(|prompt| ChatTurn::new(Role::System, prompt));
    let budget = max_chars.saturating_sub(system.as_ref().map_or(0, |turn| turn.content.chars().count()));

    let mut kept = Vec::new();
    let mut used = 0usize;
    for message in complete.iter().rev() {
        let len = message.content.chars().count();
        if !kept.is_empty() && used + len > budget {
            break;
        }
        used += len;
        kept.push(ChatTurn::from(*message));
    }
    kept.reverse();

    system.into_iter().chain(kept).collect()
}
