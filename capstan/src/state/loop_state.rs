//! The per-turn loop state record.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::message::ChatMessage;
use crate::model::TokenUsage;
use crate::state::slots::SlotMap;

/// Why a turn stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The model returned no tool calls.
    Natural,
    /// Iteration cap reached without a continuation approval.
    MaxIterations,
    /// Repeated identical tool-call signature hit its threshold.
    CircuitBreaker,
    /// Tool-error counter hit its threshold.
    ConsecutiveErrors,
    /// Cancellation token tripped.
    UserCancelled,
    /// A middleware requested termination.
    MiddlewareTerminated,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Natural => "natural",
            TerminationReason::MaxIterations => "max_iterations",
            TerminationReason::CircuitBreaker => "circuit_breaker",
            TerminationReason::ConsecutiveErrors => "consecutive_errors",
            TerminationReason::UserCancelled => "user_cancelled",
            TerminationReason::MiddlewareTerminated => "middleware_terminated",
        }
    }
}

/// State of one message turn, copy-on-write.
///
/// Holds the transcript (system prompt at the head), iteration counters, the
/// set of containers the model has opened, call ids already settled this turn
/// (for replay dedup), and one record per middleware key.
///
/// **Interaction**: produced and consumed by the kernel; middleware reads it
/// through the iteration context and changes it only via scheduled updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLoopState {
    /// Conversation messages, system prompt first.
    pub messages: Vec<ChatMessage>,
    /// 0-indexed; incremented after each model call.
    #[serde(default)]
    pub iteration: u32,
    /// Current iteration cap; continuation approval raises it.
    pub max_iteration_limit: u32,
    /// Call ids settled this turn (dedup during pending-write replay).
    #[serde(default)]
    pub completed_calls: BTreeSet<String>,
    /// Containers the model has opened this turn.
    #[serde(default)]
    pub expanded_containers: BTreeSet<String>,
    /// One opaque record per middleware key.
    #[serde(default)]
    pub middleware_states: SlotMap,
    #[serde(default)]
    pub is_terminated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
    /// Accumulated token usage over the turn, when the backend reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_total: Option<TokenUsage>,
}

impl AgentLoopState {
    /// Fresh state for a turn starting from the given messages.
    pub fn new(messages: Vec<ChatMessage>, max_iteration_limit: u32) -> Self {
        Self {
            messages,
            iteration: 0,
            max_iteration_limit,
            completed_calls: BTreeSet::new(),
            expanded_containers: BTreeSet::new(),
            middleware_states: SlotMap::default(),
            is_terminated: false,
            termination_reason: None,
            usage_total: None,
        }
    }

    /// Starts a new message turn: appends the user messages and resets the
    /// per-turn bookkeeping (iteration, settled calls, expansions, guard
    /// slots, termination). Persistent permission grants survive.
    pub fn begin_turn(&self, user_messages: Vec<ChatMessage>) -> Self {
        use crate::state::slots::{
            BatchPermissionState, CircuitBreakerState, ContinuationPermissionState,
            ErrorTrackingState, TotalErrorThresholdState, TurnPermissionState,
        };
        let mut messages = self.messages.clone();
        messages.extend(user_messages);
        let middleware_states = self
            .middleware_states
            .with(CircuitBreakerState::default())
            .with(ErrorTrackingState::default())
            .with(TotalErrorThresholdState::default())
            .with(BatchPermissionState::default())
            .with(ContinuationPermissionState::default())
            .update::<TurnPermissionState>(|mut s| {
                s.approved_for_turn.clear();
                s
            });
        Self {
            messages,
            iteration: 0,
            completed_calls: BTreeSet::new(),
            expanded_containers: BTreeSet::new(),
            middleware_states,
            is_terminated: false,
            termination_reason: None,
            usage_total: None,
            ..self.clone()
        }
    }

    /// Returns a new state with `message` appended.
    pub fn with_message(&self, message: ChatMessage) -> Self {
        let mut messages = self.messages.clone();
        messages.push(message);
        Self {
            messages,
            ..self.clone()
        }
    }

    /// Returns a new state with all `new_messages` appended in order.
    pub fn with_messages(&self, new_messages: Vec<ChatMessage>) -> Self {
        let mut messages = self.messages.clone();
        messages.extend(new_messages);
        Self {
            messages,
            ..self.clone()
        }
    }

    /// Returns a new state with the iteration counter advanced by one.
    pub fn with_next_iteration(&self) -> Self {
        Self {
            iteration: self.iteration + 1,
            ..self.clone()
        }
    }

    /// Returns a new state with the call id recorded as settled.
    pub fn with_completed_call(&self, call_id: impl Into<String>) -> Self {
        let mut completed_calls = self.completed_calls.clone();
        completed_calls.insert(call_id.into());
        Self {
            completed_calls,
            ..self.clone()
        }
    }

    /// Returns a new state with the container recorded as opened.
    pub fn with_expanded_container(&self, name: impl Into<String>) -> Self {
        let mut expanded_containers = self.expanded_containers.clone();
        expanded_containers.insert(name.into());
        Self {
            expanded_containers,
            ..self.clone()
        }
    }

    /// Returns a terminated state. The first recorded reason wins.
    pub fn terminated(&self, reason: TerminationReason) -> Self {
        Self {
            is_terminated: true,
            termination_reason: self.termination_reason.or(Some(reason)),
            ..self.clone()
        }
    }

    /// Returns a new state with a raised iteration cap (never lowers it).
    pub fn with_iteration_limit(&self, limit: u32) -> Self {
        Self {
            max_iteration_limit: self.max_iteration_limit.max(limit),
            ..self.clone()
        }
    }

    /// Returns a new state with usage added to the running total.
    pub fn with_usage(&self, usage: TokenUsage) -> Self {
        let usage_total = Some(match &self.usage_total {
            Some(t) => TokenUsage {
                prompt_tokens: t.prompt_tokens + usage.prompt_tokens,
                completion_tokens: t.completion_tokens + usage.completion_tokens,
                total_tokens: t.total_tokens + usage.total_tokens,
            },
            None => usage,
        });
        Self {
            usage_total,
            ..self.clone()
        }
    }

    /// The content of the chronologically last assistant message, if any.
    pub fn last_assistant_text(&self) -> Option<String> {
        self.messages.iter().rev().find_map(|m| {
            if m.role == crate::message::Role::Assistant {
                Some(m.text())
            } else {
                None
            }
        })
    }
}
