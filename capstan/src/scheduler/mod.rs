//! Tool-call scheduler: gates, dispatches, and assembles one iteration's batch.
//!
//! Calls go through a sequential per-call pre-gate (replay dedup, container
//! protocol, argument validation, `before_function` hooks), then dispatch in
//! parallel under a bounded concurrency cap. Results are assembled, and
//! `ToolCallResult` events emitted, in **batch call order**, never completion
//! order. Each completed call is persisted as a pending write before the next
//! iteration checkpoint commits, so a crash between the two loses nothing.
//!
//! State handling: the scheduler folds every gate's scheduled updates into a
//! working copy of the loop state, in batch call order, and returns the final
//! copy. Later calls in the same batch observe earlier decisions (an
//! approve-for-batch must suppress the second prompt), and the kernel
//! continues from exactly the state the gates produced.
//!
//! Failure semantics: an erroring tool yields an error result and the rest of
//! the batch continues; a denial or validation failure becomes a synthetic
//! result. Nothing a tool does can abort the loop from here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::checkpoint::{CheckpointStore, PendingWrite};
use crate::error::EngineError;
use crate::event::{AgentEvent, EventCoordinator};
use crate::message::{ToolCall, ToolFailure, ToolOutcome, ToolResult};
use crate::middleware::{FunctionContext, MiddlewarePipeline};
use crate::state::AgentLoopState;
use crate::tools::container::{container_invocation_failure, expansion_ack};
use crate::tools::schema::validate_arguments;
use crate::tools::{ToolDescriptor, ToolError, ToolRegistry};

/// Default upper bound on concurrently executing tool calls.
pub const DEFAULT_CONCURRENCY_CAP: usize = 8;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Concurrency cap; the effective cap is `min(batch size, this)`.
    pub concurrency_cap: usize,
    /// Per-call wall-clock timeout; `None` leaves calls unbounded.
    pub per_call_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency_cap: DEFAULT_CONCURRENCY_CAP,
            per_call_timeout: None,
        }
    }
}

/// Outcome of one batch.
pub struct BatchOutcome {
    /// One result per settled call, in batch call order. Calls skipped as
    /// already-completed (replay dedup) produce no entry.
    pub results: Vec<ToolResult>,
    /// Loop state after the batch: gate updates folded in, opened containers
    /// and settled call ids recorded.
    pub state: AgentLoopState,
}

enum CallPlan {
    /// Already settled in a previous run of this iteration (replay).
    Skip,
    /// Result recovered from a pending write; appended without re-execution.
    Replay(ToolResult),
    /// Synthetic outcome; no dispatch.
    Synthetic(ToolOutcome),
    /// Container opened; synthetic ack plus expansion bookkeeping.
    Expand { members: Vec<String> },
    /// Dispatch to the registry.
    Execute,
}

pub struct ToolScheduler {
    config: SchedulerConfig,
}

impl ToolScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Executes one batch of tool calls against the registry.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        thread_id: &str,
        iteration: u32,
        calls: &[ToolCall],
        state: &AgentLoopState,
        registry: Arc<dyn ToolRegistry>,
        pipeline: &MiddlewarePipeline,
        events: Arc<EventCoordinator>,
        store: Option<Arc<dyn CheckpointStore>>,
        replayed: &HashMap<String, ToolResult>,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome, EngineError> {
        let descriptors: HashMap<String, ToolDescriptor> = registry
            .list()
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();

        let mut working = state.clone();
        let mut plans: Vec<CallPlan> = Vec::with_capacity(calls.len());

        // Sequential pre-gate, in batch order.
        for call in calls {
            if working.completed_calls.contains(&call.call_id) {
                debug!(call_id = %call.call_id, "skipping already-completed call");
                plans.push(CallPlan::Skip);
                continue;
            }
            if let Some(stored) = replayed.get(&call.call_id) {
                debug!(call_id = %call.call_id, "replaying result from pending write");
                plans.push(CallPlan::Replay(stored.clone()));
                continue;
            }

            let descriptor = descriptors.get(&call.name).cloned();

            if let Some(d) = descriptor.as_ref().filter(|d| d.is_container()) {
                let members = d.container_members.clone().unwrap_or_default();
                let has_args = match &call.arguments {
                    Value::Null => false,
                    Value::Object(map) => !map.is_empty(),
                    _ => true,
                };
                if has_args {
                    plans.push(CallPlan::Synthetic(ToolOutcome::Error(
                        container_invocation_failure(&call.name, &members),
                    )));
                } else {
                    plans.push(CallPlan::Expand { members });
                }
                continue;
            }

            if let Some(d) = descriptor.as_ref() {
                if let Err(issues) = validate_arguments(&d.parameters, &call.arguments) {
                    let detail: Vec<String> = issues
                        .iter()
                        .map(|i| {
                            if i.property.is_empty() {
                                i.message.clone()
                            } else {
                                format!("{}: {}", i.property, i.message)
                            }
                        })
                        .collect();
                    plans.push(CallPlan::Synthetic(ToolOutcome::Error(ToolFailure {
                        kind: "validation_error".to_string(),
                        message: format!(
                            "Arguments for '{}' failed validation: {}",
                            call.name,
                            detail.join("; ")
                        ),
                        payload: serde_json::to_value(&issues).ok(),
                    })));
                    continue;
                }
            }

            let mut fctx = FunctionContext::new(
                thread_id,
                iteration,
                call.clone(),
                descriptor,
                working.clone(),
                Arc::clone(&events),
                cancel.clone(),
            );
            pipeline.before_function(&mut fctx).await?;
            for f in fctx.take_updates() {
                working = f(working);
            }

            if fctx.block {
                let outcome = fctx.override_outcome.unwrap_or_else(|| {
                    ToolOutcome::Error(ToolFailure {
                        kind: "tool_error".to_string(),
                        message: format!("Call to '{}' was blocked.", call.name),
                        payload: None,
                    })
                });
                plans.push(CallPlan::Synthetic(outcome));
            } else {
                plans.push(CallPlan::Execute);
            }
        }

        // Parallel dispatch under the concurrency cap.
        let cap = self.config.concurrency_cap.max(1).min(calls.len().max(1));
        let semaphore = Arc::new(Semaphore::new(cap));
        let mut handles: Vec<(usize, tokio::task::JoinHandle<(ToolOutcome, u64)>)> = Vec::new();

        for (idx, plan) in plans.iter().enumerate() {
            if !matches!(plan, CallPlan::Execute) {
                continue;
            }
            let call = calls[idx].clone();
            let registry = Arc::clone(&registry);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let timeout = self.config.per_call_timeout;
            handles.push((
                idx,
                tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let started = Instant::now();
                    let invoked = match timeout {
                        Some(limit) => match tokio::time::timeout(
                            limit,
                            registry.invoke(&call.name, call.arguments.clone(), &cancel),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(ToolError::Execution {
                                message: format!(
                                    "tool call timed out after {}s",
                                    limit.as_secs()
                                ),
                                payload: None,
                            }),
                        },
                        None => {
                            registry
                                .invoke(&call.name, call.arguments.clone(), &cancel)
                                .await
                        }
                    };
                    let duration_ms = started.elapsed().as_millis() as u64;
                    let outcome = match invoked {
                        Ok(value) => ToolOutcome::Value(value),
                        Err(e) => {
                            warn!(tool = %call.name, error = %e, "tool call failed");
                            ToolOutcome::Error(tool_error_to_failure(e))
                        }
                    };
                    (outcome, duration_ms)
                }),
            ));
        }

        let mut dispatched: HashMap<usize, (ToolOutcome, u64)> = HashMap::new();
        for (idx, handle) in handles {
            match handle.await {
                Ok(done) => {
                    dispatched.insert(idx, done);
                }
                Err(e) => {
                    warn!(error = %e, "tool task panicked or was aborted");
                    dispatched.insert(
                        idx,
                        (
                            ToolOutcome::Error(ToolFailure {
                                kind: "tool_error".to_string(),
                                message: "tool task failed to complete".to_string(),
                                payload: None,
                            }),
                            0,
                        ),
                    );
                }
            }
        }

        // Post-gate, assembly, and pending writes, in batch call order.
        let mut results: Vec<ToolResult> = Vec::new();
        for (idx, plan) in plans.into_iter().enumerate() {
            let call = &calls[idx];
            let mut from_replay = false;
            let (outcome, duration_ms) = match plan {
                CallPlan::Skip => continue,
                CallPlan::Replay(stored) => {
                    from_replay = true;
                    (stored.outcome, stored.duration_ms)
                }
                CallPlan::Synthetic(outcome) => (outcome, 0),
                CallPlan::Expand { members } => {
                    working = working.with_expanded_container(&call.name);
                    (
                        ToolOutcome::Value(expansion_ack(&call.name, &members)),
                        0,
                    )
                }
                CallPlan::Execute => match dispatched.remove(&idx) {
                    Some(done) => done,
                    None => continue,
                },
            };

            let mut fctx = FunctionContext::new(
                thread_id,
                iteration,
                call.clone(),
                descriptors.get(&call.name).cloned(),
                working.clone(),
                Arc::clone(&events),
                cancel.clone(),
            );
            fctx.outcome = Some(outcome.clone());
            pipeline.after_function(&mut fctx).await?;
            let final_outcome = fctx.override_outcome.take().unwrap_or(outcome);
            for f in fctx.take_updates() {
                working = f(working);
            }

            let result = ToolResult {
                call_id: call.call_id.clone(),
                name: call.name.clone(),
                outcome: final_outcome,
                duration_ms,
            };

            if let Some(store) = store.as_ref().filter(|_| !from_replay) {
                let write = PendingWrite {
                    thread_id: thread_id.to_string(),
                    iteration,
                    call_id: call.call_id.clone(),
                    result: result.clone(),
                };
                if let Err(e) = store.put_pending_write(&write).await {
                    warn!(error = %e, call_id = %call.call_id, "failed to persist pending write");
                }
            }

            working = working.with_completed_call(&call.call_id);

            events
                .emit(AgentEvent::ToolCallResult {
                    call_id: result.call_id.clone(),
                    name: result.name.clone(),
                    is_error: result.is_error(),
                    content: match &result.outcome {
                        ToolOutcome::Value(v) => v.clone(),
                        ToolOutcome::Error(f) => serde_json::json!({
                            "kind": f.kind,
                            "message": f.message,
                            "payload": f.payload,
                        }),
                    },
                    duration_ms: result.duration_ms,
                })
                .await;

            results.push(result);
        }

        Ok(BatchOutcome {
            results,
            state: working,
        })
    }
}

fn tool_error_to_failure(e: ToolError) -> ToolFailure {
    match e {
        ToolError::NotFound(name) => ToolFailure {
            kind: "tool_error".to_string(),
            message: format!("tool not found: {name}"),
            payload: None,
        },
        ToolError::InvalidArguments(message) => ToolFailure {
            kind: "validation_error".to_string(),
            message,
            payload: None,
        },
        ToolError::Execution { message, payload } => ToolFailure {
            kind: "tool_error".to_string(),
            message,
            payload,
        },
        ToolError::Cancelled => ToolFailure {
            kind: "cancelled".to_string(),
            message: "tool call cancelled".to_string(),
            payload: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CollectingObserver;
    use crate::message::ChatMessage;
    use crate::tools::StaticToolRegistry;
    use serde_json::json;

    fn state() -> AgentLoopState {
        AgentLoopState::new(vec![ChatMessage::system("s")], 10)
    }

    fn wired() -> (Arc<EventCoordinator>, Arc<CollectingObserver>) {
        let events = Arc::new(EventCoordinator::new(Duration::from_secs(1)));
        let obs = Arc::new(CollectingObserver::new());
        events.register_observer(obs.clone());
        (events, obs)
    }

    fn registry_with_sleepy_tools() -> Arc<dyn ToolRegistry> {
        let slow = ToolDescriptor::function("slow", "Slow echo", json!({}));
        let fast = ToolDescriptor::function("fast", "Fast echo", json!({}));
        let reg = StaticToolRegistry::new()
            .register(
                slow,
                Arc::new(|_args, _cancel| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!("slow done"))
                    })
                }),
            )
            .register(
                fast,
                Arc::new(|_args, _cancel| Box::pin(async { Ok(json!("fast done")) })),
            );
        Arc::new(reg)
    }

    /// **Scenario**: results come back in batch call order even when the
    /// first call finishes last.
    #[tokio::test]
    async fn results_assemble_in_call_order() {
        let scheduler = ToolScheduler::new(SchedulerConfig::default());
        let (events, obs) = wired();
        let calls = vec![
            ToolCall::new("c1", "slow", json!({})),
            ToolCall::new("c2", "fast", json!({})),
        ];
        let out = scheduler
            .execute(
                "t",
                0,
                &calls,
                &state(),
                registry_with_sleepy_tools(),
                &MiddlewarePipeline::default(),
                events,
                None,
                &HashMap::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let ids: Vec<&str> = out.results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);

        let event_ids: Vec<String> = obs
            .events()
            .iter()
            .filter_map(|e| match e {
                AgentEvent::ToolCallResult { call_id, .. } => Some(call_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(event_ids, vec!["c1", "c2"]);
    }

    /// **Scenario**: one failing tool does not stop the rest of the batch.
    #[tokio::test]
    async fn partial_failure_continues_batch() {
        let reg = StaticToolRegistry::new()
            .register_fn(
                ToolDescriptor::function("boom", "Always fails", json!({})),
                |_| Err(ToolError::execution("kaput")),
            )
            .register_fn(ToolDescriptor::function("ok", "Fine", json!({})), |_| {
                Ok(json!("fine"))
            });
        let scheduler = ToolScheduler::new(SchedulerConfig::default());
        let (events, _) = wired();
        let calls = vec![
            ToolCall::new("c1", "boom", json!({})),
            ToolCall::new("c2", "ok", json!({})),
        ];
        let out = scheduler
            .execute(
                "t",
                0,
                &calls,
                &state(),
                Arc::new(reg),
                &MiddlewarePipeline::default(),
                events,
                None,
                &HashMap::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(out.results[0].is_error());
        assert!(!out.results[1].is_error());
        assert!(out.state.completed_calls.contains("c1"));
        assert!(out.state.completed_calls.contains("c2"));
    }

    /// **Scenario**: a container called with no arguments opens and acks; with
    /// arguments it yields the structured protocol error.
    #[tokio::test]
    async fn container_two_step_protocol() {
        let reg = StaticToolRegistry::new().register_container(ToolDescriptor::container(
            "math",
            "Math tools",
            vec!["add".into()],
        ));
        let reg: Arc<dyn ToolRegistry> = Arc::new(reg);
        let scheduler = ToolScheduler::new(SchedulerConfig::default());

        let (events, _) = wired();
        let open = vec![ToolCall::new("c1", "math", json!({}))];
        let out = scheduler
            .execute(
                "t",
                0,
                &open,
                &state(),
                Arc::clone(&reg),
                &MiddlewarePipeline::default(),
                events,
                None,
                &HashMap::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!out.results[0].is_error());
        assert!(out.state.expanded_containers.contains("math"));

        let (events, _) = wired();
        let misuse = vec![ToolCall::new("c2", "math", json!({"x": 1}))];
        let out = scheduler
            .execute(
                "t",
                0,
                &misuse,
                &state(),
                reg,
                &MiddlewarePipeline::default(),
                events,
                None,
                &HashMap::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        match &out.results[0].outcome {
            ToolOutcome::Error(f) => {
                assert_eq!(f.kind, crate::tools::container::CONTAINER_INVOCATION_ERROR)
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
        assert!(out.state.expanded_containers.is_empty());
    }

    /// **Scenario**: schema-invalid arguments become a structured validation
    /// result without dispatching the tool.
    #[tokio::test]
    async fn invalid_arguments_are_synthetic_results() {
        let reg = StaticToolRegistry::new().register_fn(
            ToolDescriptor::function(
                "add",
                "Add",
                json!({
                    "type": "object",
                    "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
                    "required": ["a", "b"]
                }),
            ),
            |_| panic!("must not dispatch"),
        );
        let scheduler = ToolScheduler::new(SchedulerConfig::default());
        let (events, _) = wired();
        let calls = vec![ToolCall::new("c1", "add", json!({"a": 1}))];
        let out = scheduler
            .execute(
                "t",
                0,
                &calls,
                &state(),
                Arc::new(reg),
                &MiddlewarePipeline::default(),
                events,
                None,
                &HashMap::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        match &out.results[0].outcome {
            ToolOutcome::Error(f) => assert_eq!(f.kind, "validation_error"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    /// **Scenario**: calls already settled in a previous run are not re-executed.
    #[tokio::test]
    async fn replayed_calls_are_skipped() {
        let reg = StaticToolRegistry::new().register_fn(
            ToolDescriptor::function("once", "Run once", json!({})),
            |_| Ok(json!("ran")),
        );
        let scheduler = ToolScheduler::new(SchedulerConfig::default());
        let (events, _) = wired();
        let calls = vec![ToolCall::new("c1", "once", json!({}))];
        let prior = state().with_completed_call("c1");
        let out = scheduler
            .execute(
                "t",
                0,
                &calls,
                &prior,
                Arc::new(reg),
                &MiddlewarePipeline::default(),
                events,
                None,
                &HashMap::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(out.results.is_empty());
    }

    /// **Scenario**: the per-call timeout turns a hung tool into an error result.
    #[tokio::test]
    async fn per_call_timeout_produces_error_result() {
        let reg = StaticToolRegistry::new().register(
            ToolDescriptor::function("hang", "Never returns", json!({})),
            Arc::new(|_args, _cancel| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(json!("unreachable"))
                })
            }),
        );
        let scheduler = ToolScheduler::new(SchedulerConfig {
            concurrency_cap: 2,
            per_call_timeout: Some(Duration::from_millis(20)),
        });
        let (events, _) = wired();
        let calls = vec![ToolCall::new("c1", "hang", json!({}))];
        let out = scheduler
            .execute(
                "t",
                0,
                &calls,
                &state(),
                Arc::new(reg),
                &MiddlewarePipeline::default(),
                events,
                None,
                &HashMap::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(out.results[0].is_error());
    }
}
