//! Engine event stream: the closed set of events a turn emits, plus the
//! coordinator that fans them out to observers and correlates bidirectional
//! request/response pairs (permissions, continuations, clarifications).
//!
//! # Main types
//!
//! - [`AgentEvent`]: every event the core emits, from text deltas to branch
//!   lifecycle markers.
//! - [`EventCoordinator`]: broadcast to [`EventObserver`]s plus
//!   [`EventCoordinator::expect_response`] / [`EventCoordinator::emit`] for
//!   request/response middleware.
//! - [`PermissionReply`], [`ContinuationReply`], [`ClarificationReply`]:
//!   typed payloads extracted from response events.

mod coordinator;
mod wire;

pub use coordinator::{
    ChannelObserver, CollectingObserver, EventCoordinator, EventError, EventObserver,
    ObserverError, ResponseWaiter,
};
pub use wire::to_wire;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::TerminationReason;

/// Decision attached to a permission response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionChoice {
    /// Allow this one call only.
    ApproveOnce,
    /// Allow this tool for the rest of the turn.
    ApproveForTurn,
    /// Allow this tool for the lifetime of the thread.
    ApprovePersistent,
    Deny,
}

/// Typed payload of a [`AgentEvent::PermissionResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionReply {
    pub request_id: String,
    pub approved: bool,
    pub choice: PermissionChoice,
    /// Reason shown to the model when denied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Typed payload of a [`AgentEvent::ContinuationResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationReply {
    pub request_id: String,
    pub approved: bool,
    /// Extra iterations granted when approved.
    #[serde(default)]
    pub extend_by: u32,
}

/// Typed payload of a [`AgentEvent::ClarificationResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationReply {
    pub request_id: String,
    pub answer: String,
}

/// Everything the engine can emit during a turn.
///
/// The set is closed: observers match on it exhaustively and transports map
/// it one-to-one onto `event_wire::WireEvent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
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
    PermissionResponse(PermissionReply),
    ContinuationRequest {
        request_id: String,
        iteration: u32,
        limit: u32,
    },
    ContinuationResponse(ContinuationReply),
    ClarificationRequest { request_id: String, question: String },
    ClarificationResponse(ClarificationReply),
    /// One iteration (model call + tool batch) started.
    AgentTurnStarted { iteration: u32 },
    /// One iteration finished.
    AgentTurnFinished { iteration: u32 },
    MessageTurnStarted { thread_id: String },
    MessageTurnFinished {
        thread_id: String,
        reason: TerminationReason,
    },
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

impl AgentEvent {
    /// For response events, the request id they answer.
    pub fn response_request_id(&self) -> Option<&str> {
        match self {
            AgentEvent::PermissionResponse(r) => Some(&r.request_id),
            AgentEvent::ContinuationResponse(r) => Some(&r.request_id),
            AgentEvent::ClarificationResponse(r) => Some(&r.request_id),
            _ => None,
        }
    }
}

/// A typed response payload extractable from a response event.
///
/// Implemented by the three reply types; used by [`ResponseWaiter::wait`] so
/// bidirectional middleware gets a typed value instead of matching events.
pub trait ResponsePayload: Sized + Send + 'static {
    fn from_event(event: AgentEvent) -> Option<Self>;
}

impl ResponsePayload for PermissionReply {
    fn from_event(event: AgentEvent) -> Option<Self> {
        match event {
            AgentEvent::PermissionResponse(r) => Some(r),
            _ => None,
        }
    }
}

impl ResponsePayload for ContinuationReply {
    fn from_event(event: AgentEvent) -> Option<Self> {
        match event {
            AgentEvent::ContinuationResponse(r) => Some(r),
            _ => None,
        }
    }
}

impl ResponsePayload for ClarificationReply {
    fn from_event(event: AgentEvent) -> Option<Self> {
        match event {
            AgentEvent::ClarificationResponse(r) => Some(r),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_request_id_only_on_responses() {
        let resp = AgentEvent::PermissionResponse(PermissionReply {
            request_id: "r1".into(),
            approved: true,
            choice: PermissionChoice::ApproveOnce,
            reason: None,
        });
        assert_eq!(resp.response_request_id(), Some("r1"));
        assert_eq!(
            AgentEvent::TextMessageEnd.response_request_id(),
            None
        );
    }

    #[test]
    fn event_serde_round_trip() {
        let ev = AgentEvent::ToolCallResult {
            call_id: "c1".into(),
            name: "add".into(),
            is_error: false,
            content: serde_json::json!(5),
            duration_ms: 3,
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: AgentEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(ev, back);
    }

    #[test]
    fn payload_extraction_matches_type() {
        let reply = ContinuationReply {
            request_id: "r2".into(),
            approved: true,
            extend_by: 5,
        };
        let ev = AgentEvent::ContinuationResponse(reply.clone());
        assert_eq!(ContinuationReply::from_event(ev), Some(reply));
        assert_eq!(
            PermissionReply::from_event(AgentEvent::TextMessageEnd),
            None
        );
    }
}
