//! Middleware pipeline: ordered, composable hooks around the turn loop.
//!
//! A middleware is a set of optional hooks, all defaulting to no-ops:
//! turn boundaries (`before_message_turn` / `after_message_turn`), iteration
//! boundaries (`before_iteration` / `after_iteration`), the tool batch
//! (`before_tool_execution`), per-call gates (`before_function` /
//! `after_function`), and the wrap-style `wrap_model_call`.
//!
//! `before_*` hooks run in registration order, `after_*` hooks in reverse.
//! `wrap_model_call` nests onion-style with the **last registered middleware
//! outermost**; each layer gets a [`ModelCallNext`] it may call once, many
//! times (retry), or not at all (cache).
//!
//! Hooks never mutate the loop state directly. They schedule transforms via
//! [`IterationContext::update_state`]; the kernel folds the transforms into
//! the next [`AgentLoopState`] after the hook phase completes, which keeps
//! every hook deterministic on its input state.

pub mod circuit_breaker;
pub mod continuation;
pub mod error_tracking;
pub mod permission;
pub mod retry;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::event::EventCoordinator;
use crate::message::{ChatMessage, ToolCall, ToolOutcome, ToolResult};
use crate::model::{ModelError, ModelStream, StreamOptions};
use crate::state::{AgentLoopState, MiddlewareSlot, TerminationReason};
use crate::tools::ToolDescriptor;

/// Deferred state transition scheduled by a hook.
pub type StateTransform = Box<dyn FnOnce(AgentLoopState) -> AgentLoopState + Send>;

/// Folds scheduled transforms into a state, in schedule order.
pub(crate) fn fold_updates(
    state: AgentLoopState,
    updates: Vec<StateTransform>,
) -> AgentLoopState {
    updates.into_iter().fold(state, |s, f| f(s))
}

/// Context for turn-boundary hooks.
pub struct TurnContext {
    pub thread_id: String,
    pub state: AgentLoopState,
    pub events: Arc<EventCoordinator>,
    pub cancel: CancellationToken,
    updates: Vec<StateTransform>,
}

impl TurnContext {
    pub fn new(
        thread_id: impl Into<String>,
        state: AgentLoopState,
        events: Arc<EventCoordinator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            state,
            events,
            cancel,
            updates: Vec::new(),
        }
    }

    /// Schedules a state transform, applied after the hook phase.
    pub fn update_state(&mut self, f: impl FnOnce(AgentLoopState) -> AgentLoopState + Send + 'static) {
        self.updates.push(Box::new(f));
    }

    pub(crate) fn take_updates(&mut self) -> Vec<StateTransform> {
        std::mem::take(&mut self.updates)
    }
}

/// Context for iteration-scoped hooks.
///
/// The control flags are consulted by the kernel at well-defined points:
/// `skip_model_call` before opening the stream, `skip_tool_execution` before
/// the scheduler, `termination` after each hook phase.
pub struct IterationContext {
    pub thread_id: String,
    pub iteration: u32,
    pub state: AgentLoopState,
    /// Elide the model call; the middleware supplies `response_override`.
    pub skip_model_call: bool,
    /// Skip the tool batch; the iteration ends after `after_iteration`.
    pub skip_tool_execution: bool,
    /// Set by [`IterationContext::terminate`]; first reason wins.
    pub termination: Option<TerminationReason>,
    /// Assistant message used in place of the model call when skipping.
    pub response_override: Option<ChatMessage>,
    /// Tool calls of this iteration (populated before `before_tool_execution`).
    pub tool_calls: Vec<ToolCall>,
    /// Tool results of this iteration (populated before `after_iteration`).
    pub tool_results: Vec<ToolResult>,
    pub events: Arc<EventCoordinator>,
    pub cancel: CancellationToken,
    updates: Vec<StateTransform>,
}

impl IterationContext {
    pub fn new(
        thread_id: impl Into<String>,
        state: AgentLoopState,
        events: Arc<EventCoordinator>,
        cancel: CancellationToken,
    ) -> Self {
        let iteration = state.iteration;
        Self {
            thread_id: thread_id.into(),
            iteration,
            state,
            skip_model_call: false,
            skip_tool_execution: false,
            termination: None,
            response_override: None,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            events,
            cancel,
            updates: Vec::new(),
        }
    }

    pub fn update_state(&mut self, f: impl FnOnce(AgentLoopState) -> AgentLoopState + Send + 'static) {
        self.updates.push(Box::new(f));
    }

    /// Schedules a whole-record replacement of one middleware slot.
    pub fn update_slot<T: MiddlewareSlot + Send + 'static>(
        &mut self,
        f: impl FnOnce(T) -> T + Send + 'static,
    ) {
        self.update_state(move |s| AgentLoopState {
            middleware_states: s.middleware_states.update(f),
            ..s
        });
    }

    /// Requests loop termination; the first recorded reason wins.
    pub fn terminate(&mut self, reason: TerminationReason) {
        if self.termination.is_none() {
            self.termination = Some(reason);
        }
    }

    pub(crate) fn take_updates(&mut self) -> Vec<StateTransform> {
        std::mem::take(&mut self.updates)
    }
}

/// Context for per-call gates.
pub struct FunctionContext {
    pub thread_id: String,
    pub iteration: u32,
    pub call: ToolCall,
    pub descriptor: Option<ToolDescriptor>,
    /// Working state at gate time (includes updates from earlier calls in the batch).
    pub state: AgentLoopState,
    /// Short-circuit this call; `override_outcome` (or a synthetic error)
    /// takes the result's place.
    pub block: bool,
    /// Result supplied by a blocking middleware, or replacement in `after_function`.
    pub override_outcome: Option<ToolOutcome>,
    /// Actual outcome; populated for `after_function`.
    pub outcome: Option<ToolOutcome>,
    pub events: Arc<EventCoordinator>,
    pub cancel: CancellationToken,
    updates: Vec<StateTransform>,
}

impl FunctionContext {
    pub fn new(
        thread_id: impl Into<String>,
        iteration: u32,
        call: ToolCall,
        descriptor: Option<ToolDescriptor>,
        state: AgentLoopState,
        events: Arc<EventCoordinator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            iteration,
            call,
            descriptor,
            state,
            block: false,
            override_outcome: None,
            outcome: None,
            events,
            cancel,
            updates: Vec::new(),
        }
    }

    pub fn update_state(&mut self, f: impl FnOnce(AgentLoopState) -> AgentLoopState + Send + 'static) {
        self.updates.push(Box::new(f));
    }

    pub fn update_slot<T: MiddlewareSlot + Send + 'static>(
        &mut self,
        f: impl FnOnce(T) -> T + Send + 'static,
    ) {
        self.update_state(move |s| AgentLoopState {
            middleware_states: s.middleware_states.update(f),
            ..s
        });
    }

    /// Blocks the call with the given outcome.
    pub fn block_with(&mut self, outcome: ToolOutcome) {
        self.block = true;
        self.override_outcome = Some(outcome);
    }

    pub(crate) fn take_updates(&mut self) -> Vec<StateTransform> {
        std::mem::take(&mut self.updates)
    }
}

/// Request flowing through the `wrap_model_call` onion.
#[derive(Clone)]
pub struct ModelCallRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDescriptor>,
    pub options: StreamOptions,
    pub cancel: CancellationToken,
}

/// Produces the inner layers' model stream. May be invoked repeatedly
/// (retry) or not at all (cache / scripted response).
pub type ModelCallFn = Arc<
    dyn Fn(ModelCallRequest) -> BoxFuture<'static, Result<ModelStream, ModelError>> + Send + Sync,
>;

/// Continuation handed to `wrap_model_call`; `run` descends one layer.
#[derive(Clone)]
pub struct ModelCallNext {
    inner: ModelCallFn,
}

impl ModelCallNext {
    pub fn new(inner: ModelCallFn) -> Self {
        Self { inner }
    }

    pub fn run(&self, req: ModelCallRequest) -> BoxFuture<'static, Result<ModelStream, ModelError>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner(req).await })
    }
}

/// One middleware: optional hooks around the loop, the batch, and each call.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Stable name for diagnostics and error attribution.
    fn name(&self) -> &str;

    async fn before_message_turn(&self, _ctx: &mut TurnContext) -> Result<(), EngineError> {
        Ok(())
    }

    async fn before_iteration(&self, _ctx: &mut IterationContext) -> Result<(), EngineError> {
        Ok(())
    }

    /// Wraps the streaming model call (onion; last registered is outermost).
    ///
    /// The returned future must be self-contained: implementations clone what
    /// they need from `&self` before building it.
    fn wrap_model_call(
        &self,
        req: ModelCallRequest,
        next: ModelCallNext,
    ) -> BoxFuture<'static, Result<ModelStream, ModelError>> {
        next.run(req)
    }

    async fn before_tool_execution(&self, _ctx: &mut IterationContext) -> Result<(), EngineError> {
        Ok(())
    }

    async fn before_function(&self, _ctx: &mut FunctionContext) -> Result<(), EngineError> {
        Ok(())
    }

    async fn after_function(&self, _ctx: &mut FunctionContext) -> Result<(), EngineError> {
        Ok(())
    }

    async fn after_iteration(&self, _ctx: &mut IterationContext) -> Result<(), EngineError> {
        Ok(())
    }

    async fn after_message_turn(&self, _ctx: &mut TurnContext) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Ordered middleware chain.
#[derive(Clone, Default)]
pub struct MiddlewarePipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewarePipeline {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self { middlewares }
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    fn wrap_err(name: &str, e: EngineError) -> EngineError {
        match e {
            // Control-plane errors keep their identity.
            EngineError::Cancelled | EngineError::Event(_) => e,
            other => EngineError::Middleware {
                name: name.to_string(),
                message: other.to_string(),
            },
        }
    }

    pub async fn before_message_turn(&self, ctx: &mut TurnContext) -> Result<(), EngineError> {
        for m in &self.middlewares {
            m.before_message_turn(ctx)
                .await
                .map_err(|e| Self::wrap_err(m.name(), e))?;
        }
        Ok(())
    }

    pub async fn before_iteration(&self, ctx: &mut IterationContext) -> Result<(), EngineError> {
        for m in &self.middlewares {
            m.before_iteration(ctx)
                .await
                .map_err(|e| Self::wrap_err(m.name(), e))?;
        }
        Ok(())
    }

    pub async fn before_tool_execution(
        &self,
        ctx: &mut IterationContext,
    ) -> Result<(), EngineError> {
        for m in &self.middlewares {
            m.before_tool_execution(ctx)
                .await
                .map_err(|e| Self::wrap_err(m.name(), e))?;
        }
        Ok(())
    }

    pub async fn before_function(&self, ctx: &mut FunctionContext) -> Result<(), EngineError> {
        for m in &self.middlewares {
            m.before_function(ctx)
                .await
                .map_err(|e| Self::wrap_err(m.name(), e))?;
        }
        Ok(())
    }

    pub async fn after_function(&self, ctx: &mut FunctionContext) -> Result<(), EngineError> {
        for m in self.middlewares.iter().rev() {
            m.after_function(ctx)
                .await
                .map_err(|e| Self::wrap_err(m.name(), e))?;
        }
        Ok(())
    }

    pub async fn after_iteration(&self, ctx: &mut IterationContext) -> Result<(), EngineError> {
        for m in self.middlewares.iter().rev() {
            m.after_iteration(ctx)
                .await
                .map_err(|e| Self::wrap_err(m.name(), e))?;
        }
        Ok(())
    }

    pub async fn after_message_turn(&self, ctx: &mut TurnContext) -> Result<(), EngineError> {
        for m in self.middlewares.iter().rev() {
            m.after_message_turn(ctx)
                .await
                .map_err(|e| Self::wrap_err(m.name(), e))?;
        }
        Ok(())
    }

    /// Builds the `wrap_model_call` onion around `base`.
    ///
    /// Registration order m1, m2, m3 yields `m3(m2(m1(base)))`; the last
    /// registered middleware sees the request first.
    pub fn model_call_chain(&self, base: ModelCallFn) -> ModelCallFn {
        let mut current = base;
        for mw in self.middlewares.iter().cloned() {
            let next = ModelCallNext::new(current);
            current = Arc::new(move |req| mw.wrap_model_call(req, next.clone()));
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventCoordinator;
    use crate::message::ChatMessage;
    use crate::model::ModelUpdate;
    use std::sync::Mutex;
    use std::time::Duration;

    fn test_state() -> AgentLoopState {
        AgentLoopState::new(vec![ChatMessage::system("sys")], 10)
    }

    fn coordinator() -> Arc<EventCoordinator> {
        Arc::new(EventCoordinator::new(Duration::from_secs(1)))
    }

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn before_iteration(&self, _ctx: &mut IterationContext) -> Result<(), EngineError> {
            self.log.lock().unwrap().push(format!("before:{}", self.name));
            Ok(())
        }

        async fn after_iteration(&self, _ctx: &mut IterationContext) -> Result<(), EngineError> {
            self.log.lock().unwrap().push(format!("after:{}", self.name));
            Ok(())
        }

        fn wrap_model_call(
            &self,
            req: ModelCallRequest,
            next: ModelCallNext,
        ) -> BoxFuture<'static, Result<ModelStream, ModelError>> {
            let log = Arc::clone(&self.log);
            let name = self.name.clone();
            Box::pin(async move {
                log.lock().unwrap().push(format!("wrap:{name}"));
                next.run(req).await
            })
        }
    }

    fn recorder(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Middleware> {
        Arc::new(Recorder {
            name: name.to_string(),
            log: Arc::clone(log),
        })
    }

    /// **Scenario**: before_* runs in registration order, after_* reversed.
    #[tokio::test]
    async fn hook_ordering() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = MiddlewarePipeline::new(vec![recorder("a", &log), recorder("b", &log)]);

        let mut ctx =
            IterationContext::new("t", test_state(), coordinator(), CancellationToken::new());
        pipeline.before_iteration(&mut ctx).await.unwrap();
        pipeline.after_iteration(&mut ctx).await.unwrap();

        let entries = log.lock().unwrap().clone();
        assert_eq!(entries, vec!["before:a", "before:b", "after:b", "after:a"]);
    }

    /// **Scenario**: last-registered middleware is outermost in the model-call onion.
    #[tokio::test]
    async fn model_call_onion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = MiddlewarePipeline::new(vec![recorder("a", &log), recorder("b", &log)]);

        let base_log = Arc::clone(&log);
        let base: ModelCallFn = Arc::new(move |_req| {
            let base_log = Arc::clone(&base_log);
            Box::pin(async move {
                base_log.lock().unwrap().push("base".to_string());
                let stream: ModelStream = Box::pin(futures::stream::iter(vec![Ok(
                    ModelUpdate::Finish {
                        reason: crate::model::FinishReason::Stop,
                        usage: None,
                    },
                )]));
                Ok(stream)
            })
        });

        let chain = pipeline.model_call_chain(base);
        let req = ModelCallRequest {
            messages: vec![],
            tools: vec![],
            options: StreamOptions::default(),
            cancel: CancellationToken::new(),
        };
        let _ = chain(req).await.unwrap();

        let entries = log.lock().unwrap().clone();
        assert_eq!(entries, vec!["wrap:b", "wrap:a", "base"]);
    }

    /// **Scenario**: scheduled updates do not touch the input state until folded.
    #[tokio::test]
    async fn scheduled_updates_fold_after_hooks() {
        let mut ctx =
            IterationContext::new("t", test_state(), coordinator(), CancellationToken::new());
        ctx.update_state(|s| s.with_message(ChatMessage::user("queued")));
        assert_eq!(ctx.state.messages.len(), 1);

        let updates = ctx.take_updates();
        let folded = fold_updates(ctx.state.clone(), updates);
        assert_eq!(folded.messages.len(), 2);
    }

    #[test]
    fn terminate_keeps_first_reason() {
        let mut ctx =
            IterationContext::new("t", test_state(), coordinator(), CancellationToken::new());
        ctx.terminate(TerminationReason::CircuitBreaker);
        ctx.terminate(TerminationReason::Natural);
        assert_eq!(ctx.termination, Some(TerminationReason::CircuitBreaker));
    }
}
