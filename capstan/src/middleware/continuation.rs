//! Continuation gate: when the iteration cap is reached, asks whether the
//! turn may continue and, on approval, raises the effective limit.
//!
//! The extended limit lives in [`ContinuationPermissionState`]; the kernel
//! reads that slot (via [`effective_limit`]) as the effective cap, so the
//! grant survives checkpoints and resume.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::EngineError;
use crate::event::{AgentEvent, ContinuationReply, EventError};
use crate::middleware::{IterationContext, Middleware};
use crate::state::{AgentLoopState, ContinuationPermissionState, TerminationReason};

/// Iterations granted per approval when the responder does not say how many.
pub const DEFAULT_CONTINUATION_EXTENSION: u32 = 5;

/// The cap the kernel enforces: the configured limit or any extension granted.
pub fn effective_limit(state: &AgentLoopState) -> u32 {
    let extended: ContinuationPermissionState = state.middleware_states.get();
    state.max_iteration_limit.max(extended.current_extended_limit)
}

pub struct ContinuationMiddleware {
    default_extension: u32,
    response_timeout: Option<Duration>,
}

impl ContinuationMiddleware {
    pub fn new(default_extension: u32) -> Self {
        Self {
            default_extension: default_extension.max(1),
            response_timeout: None,
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }
}

impl Default for ContinuationMiddleware {
    fn default() -> Self {
        Self::new(DEFAULT_CONTINUATION_EXTENSION)
    }
}

#[async_trait]
impl Middleware for ContinuationMiddleware {
    fn name(&self) -> &str {
        "continuation"
    }

    async fn before_iteration(&self, ctx: &mut IterationContext) -> Result<(), EngineError> {
        let limit = effective_limit(&ctx.state);
        if ctx.iteration < limit {
            return Ok(());
        }

        let request_id = Uuid::new_v4().to_string();
        let mut waiter = ctx.events.expect_response(&request_id);
        if let Some(timeout) = self.response_timeout {
            waiter = waiter.with_timeout(timeout);
        }
        ctx.events
            .emit(AgentEvent::ContinuationRequest {
                request_id,
                iteration: ctx.iteration,
                limit,
            })
            .await;

        match waiter.wait::<ContinuationReply>(&ctx.cancel).await {
            Ok(reply) if reply.approved => {
                let extend_by = if reply.extend_by > 0 {
                    reply.extend_by
                } else {
                    self.default_extension
                };
                let new_limit = limit + extend_by;
                tracing::debug!(new_limit, "continuation approved");
                ctx.update_slot::<ContinuationPermissionState>(move |mut s| {
                    s.current_extended_limit = new_limit;
                    s
                });
                ctx.update_state(move |s| s.with_iteration_limit(new_limit));
                Ok(())
            }
            Ok(_) | Err(EventError::Timeout) | Err(EventError::ChannelClosed) => {
                ctx.terminate(TerminationReason::MaxIterations);
                Ok(())
            }
            Err(EventError::Cancelled) => {
                ctx.terminate(TerminationReason::UserCancelled);
                Ok(())
            }
        }
    }
}
