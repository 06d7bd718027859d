//! Bridge from in-memory [`AgentEvent`]s to `event_wire::WireEvent`.

use event_wire::WireEvent;

use super::AgentEvent;
use crate::event::PermissionChoice;

fn choice_str(choice: PermissionChoice) -> &'static str {
    match choice {
        PermissionChoice::ApproveOnce => "approve_once",
        PermissionChoice::ApproveForTurn => "approve_for_turn",
        PermissionChoice::ApprovePersistent => "approve_persistent",
        PermissionChoice::Deny => "deny",
    }
}

/// Converts one engine event into its wire shape.
pub fn to_wire(event: &AgentEvent) -> WireEvent {
    match event {
        AgentEvent::TextMessageStart { iteration } => WireEvent::TextMessageStart {
            iteration: *iteration,
        },
        AgentEvent::TextDelta { delta } => WireEvent::TextDelta {
            delta: delta.clone(),
        },
        AgentEvent::TextMessageEnd => WireEvent::TextMessageEnd,
        AgentEvent::ReasoningStart { iteration } => WireEvent::ReasoningStart {
            iteration: *iteration,
        },
        AgentEvent::ReasoningDelta { delta } => WireEvent::ReasoningDelta {
            delta: delta.clone(),
        },
        AgentEvent::ReasoningEnd => WireEvent::ReasoningEnd,
        AgentEvent::ToolCallStart { call_id, name } => WireEvent::ToolCallStart {
            call_id: call_id.clone(),
            name: name.clone(),
        },
        AgentEvent::ToolCallArgsDelta { call_id, delta } => WireEvent::ToolCallArgsDelta {
            call_id: call_id.clone(),
            delta: delta.clone(),
        },
        AgentEvent::ToolCallEnd { call_id } => WireEvent::ToolCallEnd {
            call_id: call_id.clone(),
        },
        AgentEvent::ToolCallResult {
            call_id,
            name,
            is_error,
            content,
            duration_ms,
        } => WireEvent::ToolCallResult {
            call_id: call_id.clone(),
            name: name.clone(),
            is_error: *is_error,
            content: content.clone(),
            duration_ms: *duration_ms,
        },
        AgentEvent::PermissionRequest {
            request_id,
            call_id,
            tool_name,
            arguments,
        } => WireEvent::PermissionRequest {
            request_id: request_id.clone(),
            call_id: call_id.clone(),
            tool_name: tool_name.clone(),
            arguments: arguments.clone(),
        },
        AgentEvent::PermissionResponse(r) => WireEvent::PermissionResponse {
            request_id: r.request_id.clone(),
            approved: r.approved,
            choice: choice_str(r.choice).to_string(),
        },
        AgentEvent::ContinuationRequest {
            request_id,
            iteration,
            limit,
        } => WireEvent::ContinuationRequest {
            request_id: request_id.clone(),
            iteration: *iteration,
            limit: *limit,
        },
        AgentEvent::ContinuationResponse(r) => WireEvent::ContinuationResponse {
            request_id: r.request_id.clone(),
            approved: r.approved,
            extend_by: r.extend_by,
        },
        AgentEvent::ClarificationRequest {
            request_id,
            question,
        } => WireEvent::ClarificationRequest {
            request_id: request_id.clone(),
            question: question.clone(),
        },
        AgentEvent::ClarificationResponse(r) => WireEvent::ClarificationResponse {
            request_id: r.request_id.clone(),
            answer: r.answer.clone(),
        },
        AgentEvent::AgentTurnStarted { iteration } => WireEvent::AgentTurnStarted {
            iteration: *iteration,
        },
        AgentEvent::AgentTurnFinished { iteration } => WireEvent::AgentTurnFinished {
            iteration: *iteration,
        },
        AgentEvent::MessageTurnStarted { thread_id } => WireEvent::MessageTurnStarted {
            thread_id: thread_id.clone(),
        },
        AgentEvent::MessageTurnFinished { thread_id, reason } => WireEvent::MessageTurnFinished {
            thread_id: thread_id.clone(),
            reason: reason.as_str().to_string(),
        },
        AgentEvent::MessageTurnError { thread_id, message } => WireEvent::MessageTurnError {
            thread_id: thread_id.clone(),
            message: message.clone(),
        },
        AgentEvent::CircuitBreakerTriggered {
            tool_name,
            signature,
            count,
        } => WireEvent::CircuitBreakerTriggered {
            tool_name: tool_name.clone(),
            signature: signature.clone(),
            count: *count,
        },
        AgentEvent::MaxConsecutiveErrorsExceeded { count } => {
            WireEvent::MaxConsecutiveErrorsExceeded { count: *count }
        }
        AgentEvent::CheckpointSaved {
            checkpoint_id,
            source,
            step,
        } => WireEvent::CheckpointSaved {
            checkpoint_id: checkpoint_id.clone(),
            source: source.clone(),
            step: *step,
        },
        AgentEvent::CheckpointSaveFailed { error } => WireEvent::CheckpointSaveFailed {
            error: error.clone(),
        },
        AgentEvent::CheckpointRestored { checkpoint_id } => WireEvent::CheckpointRestored {
            checkpoint_id: checkpoint_id.clone(),
        },
        AgentEvent::BranchCreated {
            thread_id,
            branch,
            checkpoint_id,
        } => WireEvent::BranchCreated {
            thread_id: thread_id.clone(),
            branch: branch.clone(),
            checkpoint_id: checkpoint_id.clone(),
        },
        AgentEvent::BranchSwitched {
            thread_id,
            branch,
            checkpoint_id,
        } => WireEvent::BranchSwitched {
            thread_id: thread_id.clone(),
            branch: branch.clone(),
            checkpoint_id: checkpoint_id.clone(),
        },
        AgentEvent::BranchDeleted { thread_id, branch } => WireEvent::BranchDeleted {
            thread_id: thread_id.clone(),
            branch: branch.clone(),
        },
        AgentEvent::ThreadCopied {
            source_thread_id,
            new_thread_id,
            checkpoint_id,
        } => WireEvent::ThreadCopied {
            source_thread_id: source_thread_id.clone(),
            new_thread_id: new_thread_id.clone(),
            checkpoint_id: checkpoint_id.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_type_tags_match_engine_events() {
        let ev = AgentEvent::TextDelta { delta: "x".into() };
        let v = to_wire(&ev).to_value().unwrap();
        assert_eq!(v["type"], "text_delta");

        let ev = AgentEvent::CircuitBreakerTriggered {
            tool_name: "ping".into(),
            signature: "ping({})".into(),
            count: 3,
        };
        let v = to_wire(&ev).to_value().unwrap();
        assert_eq!(v["type"], "circuit_breaker_triggered");
        assert_eq!(v["count"], 3);
    }
}
