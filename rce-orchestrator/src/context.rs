//! Context compaction: keeps one completion's growing message list from
//! silently overrunning the adapter's context window across many tool
//! turns, ahead of where a token-budget check would otherwise trip.

use rce_core::Message;

/// Decides whether and how to shrink a completion's message list.
pub trait ContextStrategy: Send + Sync {
    /// Rough token estimate for this message list, under whatever counting
    /// scheme the strategy uses.
    fn token_estimate(&self, messages: &[Message]) -> usize;

    /// Whether `messages` exceeds `limit` under this strategy's estimate.
    fn should_compact(&self, messages: &[Message], limit: usize) -> bool {
        self.token_estimate(messages) > limit
    }

    /// Produce a (likely shorter) replacement message list.
    fn compact(&self, messages: Vec<Message>) -> Vec<Message>;
}

/// Drops older messages once the running token estimate exceeds a limit,
/// always preserving the first message (the original task) and the most
/// recent ones that fit within half the prior total.
pub struct SlidingWindow {
    chars_per_token: usize,
}

impl SlidingWindow {
    /// Build with the default 4-chars-per-token estimate.
    pub fn new() -> Self {
        Self { chars_per_token: 4 }
    }

    /// Build with a custom chars-per-token ratio.
    pub fn with_ratio(chars_per_token: usize) -> Self {
        Self { chars_per_token: chars_per_token.max(1) }
    }

    fn estimate_message_tokens(&self, message: &Message) -> usize {
        message.content.as_flat_text().len() / self.chars_per_token + 4
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextStrategy for SlidingWindow {
    fn token_estimate(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.estimate_message_tokens(m)).sum()
    }

    fn compact(&self, messages: Vec<Message>) -> Vec<Message> {
        if messages.len() <= 2 {
            return messages;
        }

        let first = messages[0].clone();
        let rest = &messages[1..];
        let total_tokens: usize = messages.iter().map(|m| self.estimate_message_tokens(m)).sum();
        let target = total_tokens / 2;

        let mut kept = Vec::new();
        let mut current_tokens = self.estimate_message_tokens(&first);
        for message in rest.iter().rev() {
            let message_tokens = self.estimate_message_tokens(message);
            if current_tokens + message_tokens > target && !kept.is_empty() {
                break;
            }
            kept.push(message.clone());
            current_tokens += message_tokens;
        }
        kept.reverse();

        let mut result = vec![first];
        result.extend(kept);
        result
    }
}
