//! Wire-level event payloads (`type` tag + fields).
//!
//! Engine-side state is serialized into `serde_json::Value` before it reaches
//! this crate; the envelope (session_id, event_id) is applied separately.

use serde::Serialize;
use serde_json::Value;

/// Wire event: the shape of one stream event as a transport sees it.
///
/// The variant set mirrors the engine's event stream one-to-one; anything a
/// transport does not understand it can forward untouched because the payload
/// is plain JSON.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    TextMessageStart { iteration: u32 },
    TextDelta { delta: String },
    TextMessageEnd,
    ReasoningStart { iteration: u32 },
    ReasoningDelta { delta: String },
    ReasoningEnd,
    ToolCallStart { call_id: String, name: String },
    ToolCallArgsDelta { call_id: String, delta: String },
    ToolCallEnd { call_id: String },
    ToolCallResult {
        call_id: String,
        name: String,
        is_error: bool,
        content: Value,
        duration_ms: u64,
    },
    PermissionRequest {
        request_id: String,
        call_id: String,
        tool_name: String,
        arguments: Value,
    },
    PermissionResponse {
        request_id: String,
        approved: bool,
        choice: String,
    },
    ContinuationRequest {
        request_id: String,
        iteration: u32,
        limit: u32,
    },
    ContinuationResponse {
        request_id: String,
        approved: bool,
        extend_by: u32,
    },
    ClarificationRequest { request_id: String, question: String },
    ClarificationResponse { request_id: String, answer: String },
    AgentTurnStarted { iteration: u32 },
    AgentTurnFinished { iteration: u32 },
    MessageTurnStarted { thread_id: String },
    MessageTurnFinished { thread_id: String, reason: String },
    MessageTurnError { thread_id: String, message: String },
    CircuitBreakerTriggered {
        tool_name: String,
        signature: String,
        count: u32,
    },
    MaxConsecutiveErrorsExceeded { count: u32 },
    CheckpointSaved {
        checkpoint_id: String,
        source: String,
        step: i64,
    },
    CheckpointSaveFailed { error: String },
    CheckpointRestored { checkpoint_id: String },
    BranchCreated {
        thread_id: String,
        branch: String,
        checkpoint_id: String,
    },
    BranchSwitched {
        thread_id: String,
        branch: String,
        checkpoint_id: String,
    },
    BranchDeleted { thread_id: String, branch: String },
    ThreadCopied {
        source_thread_id: String,
        new_thread_id: String,
        checkpoint_id: String,
    },
}

impl WireEvent {
    /// Serializes this event to a JSON object (type + payload only; no envelope).
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_is_snake_case_type_field() {
        let ev = WireEvent::TextDelta {
            delta: "hi".to_string(),
        };
        let v = ev.to_value().unwrap();
        assert_eq!(v["type"], "text_delta");
        assert_eq!(v["delta"], "hi");
    }

    #[test]
    fn tool_call_result_carries_payload_fields() {
        let ev = WireEvent::ToolCallResult {
            call_id: "c1".into(),
            name: "add".into(),
            is_error: false,
            content: serde_json::json!(5),
            duration_ms: 12,
        };
        let v = ev.to_value().unwrap();
        assert_eq!(v["type"], "tool_call_result");
        assert_eq!(v["call_id"], "c1");
        assert_eq!(v["content"], 5);
        assert_eq!(v["duration_ms"], 12);
    }
}
