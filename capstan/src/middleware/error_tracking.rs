//! Error-tracking guards: consecutive tool failures and a total-error ceiling.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::event::AgentEvent;
use crate::message::ToolResult;
use crate::middleware::{IterationContext, Middleware};
use crate::state::{ErrorTrackingState, TerminationReason, TotalErrorThresholdState};

/// Default consecutive-failure threshold.
pub const DEFAULT_CONSECUTIVE_ERROR_THRESHOLD: u32 = 3;
/// Default ceiling on total errors per turn.
pub const DEFAULT_TOTAL_ERROR_CEILING: u32 = 10;

/// Predicate deciding whether a tool result counts as a failure.
pub type ErrorDetector = Arc<dyn Fn(&ToolResult) -> bool + Send + Sync>;

/// Default detector: structured error, or result text that reads like one.
pub fn default_error_detector() -> ErrorDetector {
    Arc::new(|result: &ToolResult| {
        if result.is_error() {
            return true;
        }
        let text = result.outcome.render();
        text.starts_with("Error:")
            || text.starts_with("Failed:")
            || text.to_lowercase().contains("rate limit")
    })
}

/// Terminates the turn after N consecutive failing iterations.
///
/// The `after_iteration` check is authoritative; `before_iteration` is only a
/// fast path so a resume from an already-violating checkpoint stops before
/// calling the model again.
pub struct ErrorTrackingMiddleware {
    threshold: u32,
    detector: ErrorDetector,
}

impl ErrorTrackingMiddleware {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            detector: default_error_detector(),
        }
    }

    pub fn with_detector(mut self, detector: ErrorDetector) -> Self {
        self.detector = detector;
        self
    }
}

impl Default for ErrorTrackingMiddleware {
    fn default() -> Self {
        Self::new(DEFAULT_CONSECUTIVE_ERROR_THRESHOLD)
    }
}

#[async_trait]
impl Middleware for ErrorTrackingMiddleware {
    fn name(&self) -> &str {
        "error_tracking"
    }

    async fn before_iteration(&self, ctx: &mut IterationContext) -> Result<(), EngineError> {
        let tracked: ErrorTrackingState = ctx.state.middleware_states.get();
        if tracked.consecutive_failures >= self.threshold {
            ctx.terminate(TerminationReason::ConsecutiveErrors);
        }
        Ok(())
    }

    async fn after_iteration(&self, ctx: &mut IterationContext) -> Result<(), EngineError> {
        if ctx.tool_results.is_empty() {
            return Ok(());
        }
        let failed = ctx.tool_results.iter().any(|r| (self.detector)(r));
        let tracked: ErrorTrackingState = ctx.state.middleware_states.get();
        let next_count = if failed {
            tracked.consecutive_failures + 1
        } else {
            0
        };
        ctx.update_slot::<ErrorTrackingState>(move |mut s| {
            s.consecutive_failures = next_count;
            s
        });
        if next_count >= self.threshold {
            tracing::warn!(count = next_count, "consecutive tool errors exceeded");
            ctx.terminate(TerminationReason::ConsecutiveErrors);
            ctx.events
                .emit(AgentEvent::MaxConsecutiveErrorsExceeded { count: next_count })
                .await;
        }
        Ok(())
    }
}

/// Terminates the turn when the total error count hits a ceiling. Never resets.
pub struct TotalErrorThresholdMiddleware {
    ceiling: u32,
    detector: ErrorDetector,
}

impl TotalErrorThresholdMiddleware {
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling: ceiling.max(1),
            detector: default_error_detector(),
        }
    }
}

impl Default for TotalErrorThresholdMiddleware {
    fn default() -> Self {
        Self::new(DEFAULT_TOTAL_ERROR_CEILING)
    }
}

#[async_trait]
impl Middleware for TotalErrorThresholdMiddleware {
    fn name(&self) -> &str {
        "total_error_threshold"
    }

    async fn after_iteration(&self, ctx: &mut IterationContext) -> Result<(), EngineError> {
        let new_errors = ctx
            .tool_results
            .iter()
            .filter(|r| (self.detector)(r))
            .count() as u32;
        if new_errors == 0 {
            return Ok(());
        }
        let total: TotalErrorThresholdState = ctx.state.middleware_states.get();
        let next_total = total.total_error_count + new_errors;
        ctx.update_slot::<TotalErrorThresholdState>(move |mut s| {
            s.total_error_count = next_total;
            s
        });
        if next_total >= self.ceiling {
            tracing::warn!(total = next_total, "total tool errors hit ceiling");
            ctx.terminate(TerminationReason::ConsecutiveErrors);
        }
        Ok(())
    }
}
