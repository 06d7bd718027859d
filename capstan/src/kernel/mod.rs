//! Iteration kernel: the loop that drives one message turn.
//!
//! Per iteration: run `before_iteration` hooks, open the model stream through
//! the middleware onion and fold the updates into an assistant message, run
//! `before_tool_execution`, hand the batch to the scheduler, run
//! `after_iteration`, commit a checkpoint per schedule, and decide whether to
//! continue. Termination reasons are recorded on the state; the thread facade
//! wraps this with turn events and the final turn checkpoint.
//!
//! Cancellation is cooperative: the token is checked at the top of each
//! iteration, between streamed chunks, and inside every bidirectional wait.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::checkpoint::{BranchEngine, CheckpointSource, CheckpointStore, CommitSchedule, ThreadHead};
use crate::error::EngineError;
use crate::event::{AgentEvent, EventCoordinator};
use crate::message::{ChatMessage, ContentPart, Role, ToolCall, ToolResult};
use crate::middleware::continuation::effective_limit;
use crate::middleware::{
    fold_updates, IterationContext, MiddlewarePipeline, ModelCallFn, ModelCallRequest, TurnContext,
};
use crate::model::{ModelClient, ModelUpdate, StreamOptions, TokenUsage};
use crate::scheduler::ToolScheduler;
use crate::state::TerminationReason;
use crate::tools::{visible_tools, ToolRegistry};

/// Kernel tuning shared by all turns of a thread.
#[derive(Clone, Default)]
pub struct KernelConfig {
    pub commit_schedule: CommitSchedule,
    /// Context map visibility predicates are evaluated against.
    pub visibility_context: BTreeMap<String, Value>,
    pub stream_options: StreamOptions,
}

/// Assistant message assembled from one model stream.
struct StreamedAssistant {
    message: ChatMessage,
    usage: Option<TokenUsage>,
    cancelled: bool,
}

pub struct TurnKernel {
    model_chain: ModelCallFn,
    registry: Arc<dyn ToolRegistry>,
    pipeline: MiddlewarePipeline,
    scheduler: ToolScheduler,
    events: Arc<EventCoordinator>,
    branch_engine: Option<Arc<BranchEngine>>,
    store: Option<Arc<dyn CheckpointStore>>,
    config: KernelConfig,
}

impl TurnKernel {
    pub fn new(
        model: Arc<dyn ModelClient>,
        registry: Arc<dyn ToolRegistry>,
        pipeline: MiddlewarePipeline,
        scheduler: ToolScheduler,
        events: Arc<EventCoordinator>,
        branch_engine: Option<Arc<BranchEngine>>,
        config: KernelConfig,
    ) -> Self {
        let base: ModelCallFn = {
            let model = Arc::clone(&model);
            Arc::new(move |req: ModelCallRequest| {
                let model = Arc::clone(&model);
                Box::pin(async move {
                    model
                        .stream(&req.messages, &req.tools, &req.options, &req.cancel)
                        .await
                })
            })
        };
        let model_chain = pipeline.model_call_chain(base);
        let store = branch_engine.as_ref().map(|e| Arc::clone(e.store()));
        Self {
            model_chain,
            registry,
            pipeline,
            scheduler,
            events,
            branch_engine,
            store,
            config,
        }
    }

    pub fn events(&self) -> &Arc<EventCoordinator> {
        &self.events
    }

    /// Runs the loop until termination. `replayed` carries pending-write
    /// results for the resumed iteration (empty on a fresh turn).
    pub async fn run_turn(
        &self,
        head: &mut ThreadHead,
        mut replayed: HashMap<String, ToolResult>,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let thread_id = head.thread_id.clone();

        let mut tctx = TurnContext::new(
            &thread_id,
            head.state.clone(),
            Arc::clone(&self.events),
            cancel.clone(),
        );
        self.pipeline.before_message_turn(&mut tctx).await?;
        head.state = fold_updates(head.state.clone(), tctx.take_updates());

        loop {
            if cancel.is_cancelled() {
                head.state = head.state.terminated(TerminationReason::UserCancelled);
                break;
            }

            // before_iteration
            let mut ictx = IterationContext::new(
                &thread_id,
                head.state.clone(),
                Arc::clone(&self.events),
                cancel.clone(),
            );
            self.pipeline.before_iteration(&mut ictx).await?;
            let skip_model = ictx.skip_model_call;
            let response_override = ictx.response_override.take();
            let pre_termination = ictx.termination;
            head.state = fold_updates(head.state.clone(), ictx.take_updates());
            if let Some(reason) = pre_termination {
                head.state = head.state.terminated(reason);
                break;
            }

            // Iteration-bound backstop: the model is never called past the
            // effective cap, continuation middleware or not.
            if head.state.iteration >= effective_limit(&head.state) {
                head.state = head.state.terminated(TerminationReason::MaxIterations);
                break;
            }

            let iteration = head.state.iteration;
            self.events
                .emit(AgentEvent::AgentTurnStarted { iteration })
                .await;

            // Model call (or middleware-scripted response).
            let (assistant, usage) = if skip_model {
                debug!(iteration, "model call elided by middleware");
                let message = response_override
                    .unwrap_or_else(|| ChatMessage::new(Role::Assistant, Vec::new()));
                (message, None)
            } else {
                let streamed = self.stream_assistant(head, iteration, cancel).await?;
                if streamed.cancelled {
                    head.state = head
                        .state
                        .with_message(streamed.message)
                        .terminated(TerminationReason::UserCancelled);
                    break;
                }
                (streamed.message, streamed.usage)
            };

            head.state = head.state.with_message(assistant.clone());
            if let Some(usage) = usage {
                head.state = head.state.with_usage(usage);
            }
            if self.config.commit_schedule >= CommitSchedule::FullHistory {
                self.commit_checkpoint(head, CheckpointSource::Iteration, iteration as i64)
                    .await;
            }

            let tool_calls: Vec<ToolCall> =
                assistant.tool_calls().into_iter().cloned().collect();

            // before_tool_execution
            let mut btx = IterationContext::new(
                &thread_id,
                head.state.clone(),
                Arc::clone(&self.events),
                cancel.clone(),
            );
            btx.tool_calls = tool_calls.clone();
            self.pipeline.before_tool_execution(&mut btx).await?;
            let skip_tools = btx.skip_tool_execution;
            let batch_termination = btx.termination;
            head.state = fold_updates(head.state.clone(), btx.take_updates());
            if let Some(reason) = batch_termination {
                head.state = head.state.terminated(reason);
            }

            let mut results: Vec<ToolResult> = Vec::new();
            if skip_tools {
                debug!(iteration, "tool execution skipped by middleware");
            } else if tool_calls.is_empty() {
                // No tool calls: this is the last iteration.
                head.state = head.state.terminated(TerminationReason::Natural);
            } else {
                let replay = std::mem::take(&mut replayed);
                let outcome = self
                    .scheduler
                    .execute(
                        &thread_id,
                        iteration,
                        &tool_calls,
                        &head.state,
                        Arc::clone(&self.registry),
                        &self.pipeline,
                        Arc::clone(&self.events),
                        self.store.clone(),
                        &replay,
                        cancel,
                    )
                    .await?;
                head.state = outcome.state;
                for result in &outcome.results {
                    head.state = head
                        .state
                        .with_message(ChatMessage::tool_result(result.clone()));
                }
                results = outcome.results;
            }

            // after_iteration
            let mut atx = IterationContext::new(
                &thread_id,
                head.state.clone(),
                Arc::clone(&self.events),
                cancel.clone(),
            );
            atx.tool_calls = tool_calls;
            atx.tool_results = results;
            atx.skip_model_call = skip_model;
            atx.skip_tool_execution = skip_tools;
            self.pipeline.after_iteration(&mut atx).await?;
            let post_termination = atx.termination;
            head.state = fold_updates(head.state.clone(), atx.take_updates());
            if let Some(reason) = post_termination {
                head.state = head.state.terminated(reason);
            }

            self.events
                .emit(AgentEvent::AgentTurnFinished { iteration })
                .await;

            if head.state.is_terminated {
                break;
            }

            head.state = head.state.with_next_iteration();
            if self.config.commit_schedule >= CommitSchedule::PerIteration {
                self.commit_checkpoint(
                    head,
                    CheckpointSource::Iteration,
                    head.state.iteration as i64,
                )
                .await;
            }
        }

        // Guardrail stops leave a visible explanation in the transcript.
        if let Some(reason) = head.state.termination_reason {
            if let Some(text) = guardrail_stop_text(reason) {
                if reason != TerminationReason::CircuitBreaker {
                    // The breaker middleware already streamed its own notice.
                    let iteration = head.state.iteration;
                    self.events
                        .emit(AgentEvent::TextMessageStart { iteration })
                        .await;
                    self.events
                        .emit(AgentEvent::TextDelta {
                            delta: text.to_string(),
                        })
                        .await;
                    self.events.emit(AgentEvent::TextMessageEnd).await;
                }
                head.state = head.state.with_message(ChatMessage::assistant(text));
            }
        }

        let mut tctx = TurnContext::new(
            &thread_id,
            head.state.clone(),
            Arc::clone(&self.events),
            cancel.clone(),
        );
        self.pipeline.after_message_turn(&mut tctx).await?;
        head.state = fold_updates(head.state.clone(), tctx.take_updates());
        Ok(())
    }

    /// Commits a checkpoint with one retry; a double failure is loud but
    /// never fails the turn (the state stays in memory, pending writes stay
    /// in the store).
    pub async fn commit_checkpoint(
        &self,
        head: &mut ThreadHead,
        source: CheckpointSource,
        step: i64,
    ) {
        let Some(engine) = self.branch_engine.as_ref() else {
            return;
        };
        if self.config.commit_schedule == CommitSchedule::Never {
            return;
        }
        let committed = match engine.commit(head, source, step).await {
            Ok(entry) => Ok(entry),
            Err(first) => {
                warn!(error = %first, "checkpoint commit failed; retrying once");
                engine.commit(head, source, step).await
            }
        };
        match committed {
            Ok(entry) => {
                head.current_checkpoint = Some(entry.checkpoint_id.clone());
                if let Some(branch) = head.active_branch.clone() {
                    head.branches.insert(branch, entry.checkpoint_id.clone());
                }
                self.events
                    .emit(AgentEvent::CheckpointSaved {
                        checkpoint_id: entry.checkpoint_id,
                        source: entry.source.as_str().to_string(),
                        step: entry.step,
                    })
                    .await;
            }
            Err(e) => {
                tracing::error!(error = %e, thread = %head.thread_id, "checkpoint save failed twice; turn is not resumable");
                self.events
                    .emit(AgentEvent::CheckpointSaveFailed {
                        error: e.to_string(),
                    })
                    .await;
            }
        }
    }

    /// Opens the model stream through the middleware onion and folds the
    /// updates into an assistant message, emitting streaming events.
    async fn stream_assistant(
        &self,
        head: &ThreadHead,
        iteration: u32,
        cancel: &CancellationToken,
    ) -> Result<StreamedAssistant, EngineError> {
        let tools = visible_tools(
            &self.registry.list(),
            &head.state.expanded_containers,
            &self.config.visibility_context,
        );
        let request = ModelCallRequest {
            messages: head.state.messages.clone(),
            tools,
            options: self.config.stream_options.clone(),
            cancel: cancel.clone(),
        };
        let mut stream = (self.model_chain)(request).await?;

        let mut text = String::new();
        let mut reasoning = String::new();
        let mut text_open = false;
        let mut reasoning_open = false;
        // (call_id, name, raw argument buffer), in arrival order.
        let mut calls: Vec<(String, String, String)> = Vec::new();
        let mut usage: Option<TokenUsage> = None;
        let mut cancelled = false;

        loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                update = stream.next() => update,
            };
            let update = match update {
                None => break,
                Some(Ok(u)) => u,
                Some(Err(e)) => return Err(e.into()),
            };
            match update {
                ModelUpdate::TextDelta(delta) => {
                    if !text_open {
                        text_open = true;
                        self.events
                            .emit(AgentEvent::TextMessageStart { iteration })
                            .await;
                    }
                    text.push_str(&delta);
                    self.events.emit(AgentEvent::TextDelta { delta }).await;
                }
                ModelUpdate::ReasoningDelta(delta) => {
                    if !reasoning_open {
                        reasoning_open = true;
                        self.events
                            .emit(AgentEvent::ReasoningStart { iteration })
                            .await;
                    }
                    reasoning.push_str(&delta);
                    self.events.emit(AgentEvent::ReasoningDelta { delta }).await;
                }
                ModelUpdate::ToolCallStart { call_id, name } => {
                    self.events
                        .emit(AgentEvent::ToolCallStart {
                            call_id: call_id.clone(),
                            name: name.clone(),
                        })
                        .await;
                    calls.push((call_id, name, String::new()));
                }
                ModelUpdate::ToolCallArgsDelta { call_id, fragment } => {
                    if let Some(entry) = calls.iter_mut().find(|(id, _, _)| *id == call_id) {
                        entry.2.push_str(&fragment);
                    }
                    self.events
                        .emit(AgentEvent::ToolCallArgsDelta {
                            call_id,
                            delta: fragment,
                        })
                        .await;
                }
                ModelUpdate::ToolCallEnd { call_id } => {
                    self.events.emit(AgentEvent::ToolCallEnd { call_id }).await;
                }
                ModelUpdate::Finish {
                    usage: finish_usage,
                    ..
                } => {
                    usage = finish_usage;
                }
            }
        }

        if reasoning_open {
            self.events.emit(AgentEvent::ReasoningEnd).await;
        }
        if text_open {
            self.events.emit(AgentEvent::TextMessageEnd).await;
        }

        let mut parts: Vec<ContentPart> = Vec::new();
        if !reasoning.is_empty() {
            parts.push(ContentPart::Reasoning { text: reasoning });
        }
        if !text.is_empty() {
            parts.push(ContentPart::Text { text });
        }
        for (call_id, name, raw_args) in calls {
            parts.push(ContentPart::ToolUse {
                call: ToolCall::new(call_id, name, parse_tool_arguments(&raw_args)),
            });
        }

        Ok(StreamedAssistant {
            message: ChatMessage::new(Role::Assistant, parts),
            usage,
            cancelled,
        })
    }
}

/// Explanation appended to the transcript when a guardrail ends the turn.
fn guardrail_stop_text(reason: TerminationReason) -> Option<&'static str> {
    match reason {
        TerminationReason::MaxIterations => {
            Some("Stopping: the iteration limit was reached before the task completed.")
        }
        TerminationReason::CircuitBreaker => {
            Some("Stopping: the same tool call was repeated too many times.")
        }
        TerminationReason::ConsecutiveErrors => {
            Some("Stopping: tool calls kept failing.")
        }
        _ => None,
    }
}

/// Parses an accumulated argument buffer. Malformed JSON degrades to an empty
/// object with a warning; the schema gate reports the mismatch to the model.
fn parse_tool_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return serde_json::json!({});
    }
    match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, raw, "tool arguments failed to parse; using empty object");
            serde_json::json!({})
        }
    }
}
