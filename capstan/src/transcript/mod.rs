//! Transcript: the chronological message log and its reduction protocol.
//!
//! Two invariants hold at all times: leading system messages never move, and
//! at most one message carries the summary marker. Reduction replaces a
//! contiguous run of non-system messages right after the system head with one
//! summary message; everything else is append-only.
//!
//! The reducer itself (model-driven summarization) lives outside the engine;
//! this module applies its output atomically and answers the token-count
//! questions upstream throttling asks.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{ChatMessage, Role, SUMMARY_MARKER_KEY};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReductionError {
    #[error("cannot remove {requested} messages; only {available} non-system messages exist")]
    TooManyRemoved { requested: usize, available: usize },
}

/// Token-count views over a transcript (chars/4 estimate).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub total: u32,
    /// Tokens in messages after the summary marker (everything, when no
    /// summary exists).
    pub after_last_summary: u32,
    pub system: u32,
}

/// Number of leading system messages.
pub fn system_head_len(messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .take_while(|m| m.role == Role::System)
        .count()
}

/// Index of the summary message, if present.
pub fn summary_index(messages: &[ChatMessage]) -> Option<usize> {
    messages.iter().position(ChatMessage::is_summary)
}

/// Messages after the summary marker (all non-system messages when no
/// summary exists). This is what the cache-aware skip threshold counts.
pub fn messages_after_last_summary(messages: &[ChatMessage]) -> usize {
    match summary_index(messages) {
        Some(idx) => messages.len() - idx - 1,
        None => messages.len() - system_head_len(messages),
    }
}

/// Computes the token-count views.
pub fn token_counts(messages: &[ChatMessage]) -> TokenCounts {
    let total = messages.iter().map(ChatMessage::estimated_tokens).sum();
    let system = messages
        .iter()
        .take_while(|m| m.role == Role::System)
        .map(ChatMessage::estimated_tokens)
        .sum();
    let after_last_summary = match summary_index(messages) {
        Some(idx) => messages[idx + 1..]
            .iter()
            .map(ChatMessage::estimated_tokens)
            .sum(),
        None => total - system,
    };
    TokenCounts {
        total,
        after_last_summary,
        system,
    }
}

/// Cache-aware reduction gate.
#[derive(Debug, Clone, Copy)]
pub struct ReductionPolicy {
    /// Skip reduction while fewer than this many messages follow the
    /// existing summary (the prior summary keeps doing its job).
    pub min_messages_since_summary: usize,
}

impl Default for ReductionPolicy {
    fn default() -> Self {
        Self {
            min_messages_since_summary: 8,
        }
    }
}

impl ReductionPolicy {
    pub fn should_reduce(&self, messages: &[ChatMessage]) -> bool {
        messages_after_last_summary(messages) >= self.min_messages_since_summary
    }
}

/// Applies a reduction: removes `removed_count` messages after the system
/// head and inserts `summary` (marker enforced) in their place.
///
/// Idempotent by fingerprint: when the message right after the head is
/// already a summary with the same text, the transcript is returned
/// unchanged, so re-applying the same reduction converges.
pub fn apply_reduction(
    messages: &[ChatMessage],
    summary: ChatMessage,
    removed_count: usize,
) -> Result<Vec<ChatMessage>, ReductionError> {
    let sys_count = system_head_len(messages);
    let available = messages.len() - sys_count;
    if removed_count > available {
        return Err(ReductionError::TooManyRemoved {
            requested: removed_count,
            available,
        });
    }

    let summary_text = summary.text();
    if let Some(existing) = messages.get(sys_count) {
        if existing.is_summary() && existing.text() == summary_text {
            return Ok(messages.to_vec());
        }
    }

    let mut summary = summary;
    summary
        .metadata
        .insert(SUMMARY_MARKER_KEY.to_string(), serde_json::Value::Bool(true));

    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len() - removed_count + 1);
    out.extend_from_slice(&messages[..sys_count]);
    out.push(summary);
    for msg in &messages[sys_count + removed_count..] {
        // At most one summary: older markers in the kept tail are demoted.
        if msg.is_summary() {
            let mut plain = msg.clone();
            plain.metadata.remove(SUMMARY_MARKER_KEY);
            out.push(plain);
        } else {
            out.push(msg.clone());
        }
    }
    Ok(out)
}
