//! Circuit breaker: stops the turn when the model repeats the exact same
//! tool call (by deterministic signature) too many times in a row.

use async_trait::async_trait;

use crate::error::EngineError;
use crate::event::AgentEvent;
use crate::middleware::{IterationContext, Middleware};
use crate::state::{CircuitBreakerState, TerminationReason};

/// Default number of identical consecutive calls that trips the breaker.
pub const DEFAULT_CIRCUIT_BREAKER_THRESHOLD: u32 = 3;

pub struct CircuitBreakerMiddleware {
    threshold: u32,
}

impl CircuitBreakerMiddleware {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }
}

impl Default for CircuitBreakerMiddleware {
    fn default() -> Self {
        Self::new(DEFAULT_CIRCUIT_BREAKER_THRESHOLD)
    }
}

#[async_trait]
impl Middleware for CircuitBreakerMiddleware {
    fn name(&self) -> &str {
        "circuit_breaker"
    }

    /// Predicts, per pending call, the consecutive count the committed state
    /// would reach. Hitting the threshold skips the whole batch and ends the
    /// turn before the repeated call executes.
    async fn before_tool_execution(
        &self,
        ctx: &mut IterationContext,
    ) -> Result<(), EngineError> {
        let breaker: CircuitBreakerState = ctx.state.middleware_states.get();
        let tripped = ctx.tool_calls.iter().find_map(|call| {
            let signature = call.signature();
            let predicted = breaker.predicted_count(&call.name, &signature);
            if predicted >= self.threshold {
                Some((call.name.clone(), signature, predicted))
            } else {
                None
            }
        });
        if let Some((name, signature, predicted)) = tripped {
            tracing::warn!(
                tool = %name,
                signature = %signature,
                count = predicted,
                "circuit breaker tripped"
            );
            ctx.skip_tool_execution = true;
            ctx.terminate(TerminationReason::CircuitBreaker);
            ctx.events
                .emit(AgentEvent::CircuitBreakerTriggered {
                    tool_name: name.clone(),
                    signature: signature.clone(),
                    count: predicted,
                })
                .await;
            let iteration = ctx.iteration;
            ctx.events
                .emit(AgentEvent::TextMessageStart { iteration })
                .await;
            ctx.events
                .emit(AgentEvent::TextDelta {
                    delta: format!(
                        "Stopping: the tool '{}' was requested {} times in a row with \
                         identical arguments.",
                        name, predicted
                    ),
                })
                .await;
            ctx.events.emit(AgentEvent::TextMessageEnd).await;
            return Ok(());
        }
        Ok(())
    }

    /// Commits the observed signatures once the batch actually ran.
    async fn after_iteration(&self, ctx: &mut IterationContext) -> Result<(), EngineError> {
        if ctx.skip_tool_execution || ctx.tool_calls.is_empty() {
            return Ok(());
        }
        let observed: Vec<(String, String)> = ctx
            .tool_calls
            .iter()
            .map(|c| (c.name.clone(), c.signature()))
            .collect();
        ctx.update_slot::<CircuitBreakerState>(move |mut s| {
            for (tool, signature) in observed {
                s = s.observed(&tool, &signature);
            }
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
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn ctx_with_calls(
        state: AgentLoopState,
        calls: Vec<ToolCall>,
    ) -> (IterationContext, Arc<CollectingObserver>) {
        let events = Arc::new(EventCoordinator::new(Duration::from_secs(1)));
        let obs = Arc::new(CollectingObserver::new());
        events.register_observer(obs.clone());
        let mut ctx = IterationContext::new("t", state, events, CancellationToken::new());
        ctx.tool_calls = calls;
        (ctx, obs)
    }

    fn ping() -> ToolCall {
        ToolCall::new("c", "ping", json!({}))
    }

    /// **Scenario**: the k-th identical call at k = threshold is never executed
    /// and CircuitBreakerTriggered is emitted in that iteration.
    #[tokio::test]
    async fn trips_at_threshold_without_executing() {
        let mw = CircuitBreakerMiddleware::new(3);
        let mut state = AgentLoopState::new(vec![ChatMessage::system("s")], 10);

        // Two committed identical rounds.
        for _ in 0..2 {
            let (mut ctx, _) = ctx_with_calls(state.clone(), vec![ping()]);
            mw.before_tool_execution(&mut ctx).await.unwrap();
            assert!(!ctx.skip_tool_execution);
            mw.after_iteration(&mut ctx).await.unwrap();
            let updates = ctx.take_updates();
            state = fold_updates(state, updates);
        }

        // Third identical round trips.
        let (mut ctx, obs) = ctx_with_calls(state, vec![ping()]);
        mw.before_tool_execution(&mut ctx).await.unwrap();
        assert!(ctx.skip_tool_execution);
        assert_eq!(ctx.termination, Some(TerminationReason::CircuitBreaker));
        assert!(obs.events().iter().any(|e| matches!(
            e,
            AgentEvent::CircuitBreakerTriggered { count: 3, .. }
        )));
    }

    /// **Scenario**: changing arguments resets the run.
    #[tokio::test]
    async fn different_signature_resets_count() {
        let mw = CircuitBreakerMiddleware::new(2);
        let state = AgentLoopState::new(vec![ChatMessage::system("s")], 10);

        let (mut ctx, _) = ctx_with_calls(state.clone(), vec![ping()]);
        mw.after_iteration(&mut ctx).await.unwrap();
        let state = fold_updates(state, ctx.take_updates());

        let varied = ToolCall::new("c2", "ping", json!({"n": 1}));
        let (mut ctx, _) = ctx_with_calls(state, vec![varied]);
        mw.before_tool_execution(&mut ctx).await.unwrap();
        assert!(!ctx.skip_tool_execution);
    }
}
