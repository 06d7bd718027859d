//! Conversation message types.
//!
//! A [`ChatMessage`] is a role plus an ordered list of content parts (text,
//! reasoning, tool-call request, tool result, attachment reference) and an
//! optional metadata map. Messages are immutable once appended to a
//! transcript; history reduction is the only operation that replaces them
//! (see [`crate::transcript`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata key marking the (at most one) summary message in a transcript.
pub const SUMMARY_MARKER_KEY: &str = "summary_marker";

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single tool invocation requested by the model.
///
/// `call_id` is generated by the model and is unique within an iteration;
/// results are correlated back to it. [`ToolCall::signature`] is the canonical
/// form the circuit breaker compares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Model-generated id, unique within the iteration.
    pub call_id: String,
    /// Tool name as listed by the registry.
    pub name: String,
    /// Parsed argument map.
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(call_id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Deterministic signature: `name(json-with-sorted-keys)`.
    ///
    /// Two calls with the same tool and semantically equal arguments produce
    /// the same signature regardless of key order in the incoming JSON.
    pub fn signature(&self) -> String {
        format!("{}({})", self.name, canonical_json(&self.arguments))
    }
}

/// Renders a JSON value with object keys sorted at every level.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// Structured failure carried by an error tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFailure {
    /// Failure kind (e.g. "tool_error", "validation_error", "permission_denied").
    pub kind: String,
    /// Human-readable message, also shown to the model.
    pub message: String,
    /// Optional structured payload (per-property validation messages,
    /// container member lists, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Outcome of one tool call: a JSON value or a structured failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Value(Value),
    Error(ToolFailure),
}

impl ToolOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, ToolOutcome::Error(_))
    }

    /// Text rendering fed back to the model (and used by error detectors).
    pub fn render(&self) -> String {
        match self {
            ToolOutcome::Value(v) => match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            ToolOutcome::Error(f) => format!("Error: {}", f.message),
        }
    }
}

/// Result of one tool call, correlated by `call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    /// Tool name, kept for display and error-detector predicates.
    pub name: String,
    pub outcome: ToolOutcome,
    /// Wall-clock duration of the call in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn value(call_id: impl Into<String>, name: impl Into<String>, value: Value) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            outcome: ToolOutcome::Value(value),
            duration_ms: 0,
        }
    }

    pub fn error(call_id: impl Into<String>, name: impl Into<String>, failure: ToolFailure) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            outcome: ToolOutcome::Error(failure),
            duration_ms: 0,
        }
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }

    pub fn is_error(&self) -> bool {
        self.outcome.is_error()
    }
}

/// One content part of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Reasoning { text: String },
    ToolUse { call: ToolCall },
    ToolResult { result: ToolResult },
    Attachment {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
}

/// A single message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub parts: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl ChatMessage {
    pub fn new(role: Role, parts: Vec<ContentPart>) -> Self {
        Self {
            role,
            parts,
            metadata: BTreeMap::new(),
        }
    }

    /// System message with one text part.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentPart::Text { text: text.into() }])
    }

    /// User message with one text part.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::Text { text: text.into() }])
    }

    /// Assistant message with one text part.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(
            Role::Assistant,
            vec![ContentPart::Text { text: text.into() }],
        )
    }

    /// Tool-role message carrying one result.
    pub fn tool_result(result: ToolResult) -> Self {
        Self::new(Role::Tool, vec![ContentPart::ToolResult { result }])
    }

    /// Assistant message marked as a transcript summary.
    pub fn summary(text: impl Into<String>) -> Self {
        let mut msg = Self::assistant(text);
        msg.metadata
            .insert(SUMMARY_MARKER_KEY.to_string(), Value::Bool(true));
        msg
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// True if this message carries the summary marker.
    pub fn is_summary(&self) -> bool {
        matches!(
            self.metadata.get(SUMMARY_MARKER_KEY),
            Some(Value::Bool(true))
        )
    }

    /// Concatenated text parts (reasoning excluded).
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let ContentPart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }

    /// Tool calls requested in this message, in part order.
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolUse { call } => Some(call),
                _ => None,
            })
            .collect()
    }

    /// Estimated token weight of this message (chars / 4 heuristic).
    pub fn estimated_tokens(&self) -> u32 {
        let chars: usize = self
            .parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } | ContentPart::Reasoning { text } => text.len(),
                ContentPart::ToolUse { call } => call.arguments.to_string().len() + call.name.len(),
                ContentPart::ToolResult { result } => result.outcome.render().len(),
                ContentPart::Attachment { .. } => 32,
            })
            .sum();
        (chars / 4) as u32
    }
}
