//! Permission gate: tools flagged `requires_permission` pause the call until
//! a correlated PermissionResponse arrives (or the wait times out).
//!
//! Decisions are written into the permission slots so later calls in the same
//! batch, and later iterations in the same turn, do not re-prompt:
//! ApproveOnce lives in the per-batch slot, ApproveForTurn / ApprovePersistent
//! in the turn-scoped slot. A denial (including a timed-out request) becomes
//! a synthetic error result; it never aborts the loop.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::EngineError;
use crate::event::{AgentEvent, EventError, PermissionChoice, PermissionReply};
use crate::message::{ToolFailure, ToolOutcome};
use crate::middleware::{FunctionContext, IterationContext, Middleware};
use crate::state::{BatchPermissionState, TurnPermissionState};

/// Failure kind carried by denial results.
pub const PERMISSION_DENIED: &str = "permission_denied";

pub struct PermissionMiddleware {
    /// Overrides the coordinator's default response timeout when set.
    response_timeout: Option<Duration>,
}

impl PermissionMiddleware {
    pub fn new() -> Self {
        Self {
            response_timeout: None,
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    fn denial_outcome(reason: String) -> ToolOutcome {
        ToolOutcome::Error(ToolFailure {
            kind: PERMISSION_DENIED.to_string(),
            message: reason,
            payload: None,
        })
    }
}

impl Default for PermissionMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for PermissionMiddleware {
    fn name(&self) -> &str {
        "permission"
    }

    /// Batch decisions do not outlive the iteration.
    async fn before_iteration(&self, ctx: &mut IterationContext) -> Result<(), EngineError> {
        ctx.update_slot::<BatchPermissionState>(|_| BatchPermissionState::default());
        Ok(())
    }

    async fn before_function(&self, ctx: &mut FunctionContext) -> Result<(), EngineError> {
        let requires = ctx
            .descriptor
            .as_ref()
            .map(|d| d.requires_permission)
            .unwrap_or(false);
        if !requires || ctx.block {
            return Ok(());
        }

        let tool = ctx.call.name.clone();
        let turn: TurnPermissionState = ctx.state.middleware_states.get();
        if turn.approved_for_turn.contains(&tool) || turn.persistent.contains(&tool) {
            return Ok(());
        }
        let batch: BatchPermissionState = ctx.state.middleware_states.get();
        if batch.approved.contains(&tool) {
            return Ok(());
        }
        if let Some(reason) = batch.denied.get(&tool) {
            ctx.block_with(Self::denial_outcome(reason.clone()));
            return Ok(());
        }

        let request_id = Uuid::new_v4().to_string();
        let mut waiter = ctx.events.expect_response(&request_id);
        if let Some(timeout) = self.response_timeout {
            waiter = waiter.with_timeout(timeout);
        }
        ctx.events
            .emit(AgentEvent::PermissionRequest {
                request_id: request_id.clone(),
                call_id: ctx.call.call_id.clone(),
                tool_name: tool.clone(),
                arguments: ctx.call.arguments.clone(),
            })
            .await;

        let reply = match waiter.wait::<PermissionReply>(&ctx.cancel).await {
            Ok(reply) => reply,
            Err(EventError::Cancelled) => return Err(EngineError::Cancelled),
            Err(EventError::Timeout) | Err(EventError::ChannelClosed) => {
                tracing::warn!(tool = %tool, "permission request timed out; denying");
                PermissionReply {
                    request_id,
                    approved: false,
                    choice: PermissionChoice::Deny,
                    reason: Some("Permission request timed out.".to_string()),
                }
            }
        };

        let marker_tool = tool.clone();
        if reply.approved {
            match reply.choice {
                PermissionChoice::ApproveForTurn => {
                    ctx.update_slot::<TurnPermissionState>(move |mut s| {
                        s.approved_for_turn.insert(marker_tool);
                        s
                    });
                }
                PermissionChoice::ApprovePersistent => {
                    ctx.update_slot::<TurnPermissionState>(move |mut s| {
                        s.persistent.insert(marker_tool);
                        s
                    });
                }
                _ => {
                    ctx.update_slot::<BatchPermissionState>(move |mut s| {
                        s.approved.insert(marker_tool);
                        s
                    });
                }
            }
        } else {
            let reason = reply
                .reason
                .unwrap_or_else(|| format!("Permission to call '{tool}' was denied."));
            let denial = reason.clone();
            ctx.update_slot::<BatchPermissionState>(move |mut s| {
                s.denied.insert(marker_tool, denial);
                s
            });
            ctx.block_with(Self::denial_outcome(reason));
        }
        ctx.update_slot::<BatchPermissionState>(|mut s| {
            s.batch_check_performed = true;
            s
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CollectingObserver, EventCoordinator};
    use crate::message::{ChatMessage, ToolCall};
    use crate::middleware::fold_updates;
    use crate::state::AgentLoopState;
    use crate::tools::ToolDescriptor;
    use serde_json::json;
    use std::time::Duration;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn state() -> AgentLoopState {
        AgentLoopState::new(vec![ChatMessage::system("s")], 10)
    }

    fn gated_descriptor() -> ToolDescriptor {
        ToolDescriptor::function("delete", "Delete a path", json!({})).with_permission_required()
    }

    fn fctx(
        events: Arc<EventCoordinator>,
        state: AgentLoopState,
        descriptor: Option<ToolDescriptor>,
    ) -> FunctionContext {
        FunctionContext::new(
            "t",
            0,
            ToolCall::new("c1", "delete", json!({"path": "/tmp/x"})),
            descriptor,
            state,
            events,
            CancellationToken::new(),
        )
    }

    /// Responder observer: answers every PermissionRequest with the configured reply.
    fn install_responder(
        events: &Arc<EventCoordinator>,
        approved: bool,
        choice: PermissionChoice,
    ) {
        events.register_observer(Arc::new(Responder {
            events: Arc::clone(events),
            approved,
            choice,
        }));
    }

    struct Responder {
        events: Arc<EventCoordinator>,
        approved: bool,
        choice: PermissionChoice,
    }

    #[async_trait]
    impl crate::event::EventObserver for Responder {
        async fn on_event(
            &self,
            event: &AgentEvent,
            _cancel: &CancellationToken,
        ) -> Result<(), crate::event::ObserverError> {
            if let AgentEvent::PermissionRequest { request_id, .. } = event {
                self.events.deliver_response(
                    request_id,
                    AgentEvent::PermissionResponse(PermissionReply {
                        request_id: request_id.clone(),
                        approved: self.approved,
                        choice: self.choice,
                        reason: None,
                    }),
                );
            }
            Ok(())
        }
    }

    /// **Scenario**: an ApproveForTurn reply executes the call and the turn
    /// slot suppresses the next prompt.
    #[tokio::test]
    async fn approve_for_turn_suppresses_next_prompt() {
        let events = Arc::new(EventCoordinator::new(Duration::from_secs(1)));
        install_responder(&events, true, PermissionChoice::ApproveForTurn);
        let obs = Arc::new(CollectingObserver::new());
        events.register_observer(obs.clone());

        let mw = PermissionMiddleware::new();
        let mut ctx = fctx(Arc::clone(&events), state(), Some(gated_descriptor()));
        mw.before_function(&mut ctx).await.unwrap();
        assert!(!ctx.block);

        let folded = fold_updates(ctx.state.clone(), ctx.take_updates());
        assert!(folded
            .middleware_states
            .get::<TurnPermissionState>()
            .approved_for_turn
            .contains("delete"));

        // Second call with the folded state: no new request emitted.
        let before = obs
            .events()
            .iter()
            .filter(|e| matches!(e, AgentEvent::PermissionRequest { .. }))
            .count();
        let mut ctx2 = fctx(events, folded, Some(gated_descriptor()));
        mw.before_function(&mut ctx2).await.unwrap();
        assert!(!ctx2.block);
        let after = obs
            .events()
            .iter()
            .filter(|e| matches!(e, AgentEvent::PermissionRequest { .. }))
            .count();
        assert_eq!(before, after);
    }

    /// **Scenario**: a denial blocks the call with a permission_denied result.
    #[tokio::test]
    async fn denial_blocks_with_synthetic_result() {
        let events = Arc::new(EventCoordinator::new(Duration::from_secs(1)));
        install_responder(&events, false, PermissionChoice::Deny);

        let mw = PermissionMiddleware::new();
        let mut ctx = fctx(events, state(), Some(gated_descriptor()));
        mw.before_function(&mut ctx).await.unwrap();
        assert!(ctx.block);
        match ctx.override_outcome {
            Some(ToolOutcome::Error(ref f)) => assert_eq!(f.kind, PERMISSION_DENIED),
            ref other => panic!("expected denial outcome, got {other:?}"),
        }
    }

    /// **Scenario**: a request nobody answers denies after the timeout.
    #[tokio::test]
    async fn timeout_is_denial() {
        let events = Arc::new(EventCoordinator::new(Duration::from_secs(5)));
        let mw = PermissionMiddleware::new().with_response_timeout(Duration::from_millis(20));
        let mut ctx = fctx(events, state(), Some(gated_descriptor()));
        mw.before_function(&mut ctx).await.unwrap();
        assert!(ctx.block);
    }

    /// **Scenario**: ungated tools never prompt.
    #[tokio::test]
    async fn ungated_tool_passes_through() {
        let events = Arc::new(EventCoordinator::new(Duration::from_secs(1)));
        let obs = Arc::new(CollectingObserver::new());
        events.register_observer(obs.clone());
        let mw = PermissionMiddleware::new();
        let descriptor = ToolDescriptor::function("echo", "Echo", json!({}));
        let mut ctx = fctx(events, state(), Some(descriptor));
        mw.before_function(&mut ctx).await.unwrap();
        assert!(!ctx.block);
        assert!(obs.events().is_empty());
    }

}
