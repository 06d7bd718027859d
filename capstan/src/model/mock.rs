//! Scripted model backend for tests and offline demos.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::message::{ChatMessage, ToolCall};
use crate::model::{
    FinishReason, ModelClient, ModelError, ModelStream, ModelUpdate, StreamOptions, TokenUsage,
};
use crate::tools::ToolDescriptor;

/// One scripted model turn: text, optional reasoning, and tool calls.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    pub text: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

impl ScriptedTurn {
    /// Plain text reply; terminates the turn naturally.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Reply that requests the given tool calls.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Deterministic [`ModelClient`]: plays back scripted turns in order.
///
/// When the script runs out, the last turn is replayed indefinitely; that is
/// what a looping model looks like, which is exactly what the circuit-breaker
/// tests need. Streams are emitted as realistic update sequences (text split
/// into chunks, tool-call argument fragments, a final `Finish`).
pub struct MockModel {
    turns: Mutex<(Vec<ScriptedTurn>, usize)>,
    /// Error to fail with before any scripted turn plays, decremented per call.
    fail_first: Mutex<(u32, Option<ModelError>)>,
}

impl MockModel {
    pub fn script(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new((turns, 0)),
            fail_first: Mutex::new((0, None)),
        }
    }

    /// Single text reply, no tools.
    pub fn text_reply(text: impl Into<String>) -> Self {
        Self::script(vec![ScriptedTurn::text(text)])
    }

    /// Fails the first `n` calls with `error` before the script starts.
    pub fn failing_first(self, n: u32, error: ModelError) -> Self {
        if let Ok(mut guard) = self.fail_first.lock() {
            *guard = (n, Some(error));
        }
        self
    }

    fn next_turn(&self) -> Option<ScriptedTurn> {
        let mut guard = self.turns.lock().ok()?;
        let (turns, cursor) = &mut *guard;
        if turns.is_empty() {
            return None;
        }
        if *cursor < turns.len() {
            let turn = turns[*cursor].clone();
            *cursor += 1;
            return Some(turn);
        }
        // Past the script: replay the last turn with fresh call ids, the way
        // a looping model mints new ids for each repeated request.
        let repeat = *cursor - turns.len() + 1;
        *cursor += 1;
        let mut turn = turns[turns.len() - 1].clone();
        for call in &mut turn.tool_calls {
            call.call_id = format!("{}-r{repeat}", call.call_id);
        }
        Some(turn)
    }

    fn updates_for(turn: &ScriptedTurn) -> Vec<ModelUpdate> {
        let mut updates = Vec::new();
        if let Some(reasoning) = &turn.reasoning {
            updates.push(ModelUpdate::ReasoningDelta(reasoning.clone()));
        }
        if !turn.text.is_empty() {
            // Split the text into two chunks so consumers see real deltas.
            let mid = turn.text.len() / 2;
            let split = turn
                .text
                .char_indices()
                .map(|(i, _)| i)
                .find(|&i| i >= mid)
                .unwrap_or(0);
            let (head, tail) = turn.text.split_at(split);
            if !head.is_empty() {
                updates.push(ModelUpdate::TextDelta(head.to_string()));
            }
            if !tail.is_empty() {
                updates.push(ModelUpdate::TextDelta(tail.to_string()));
            }
        }
        for call in &turn.tool_calls {
            updates.push(ModelUpdate::ToolCallStart {
                call_id: call.call_id.clone(),
                name: call.name.clone(),
            });
            updates.push(ModelUpdate::ToolCallArgsDelta {
                call_id: call.call_id.clone(),
                fragment: call.arguments.to_string(),
            });
            updates.push(ModelUpdate::ToolCallEnd {
                call_id: call.call_id.clone(),
            });
        }
        let reason = if turn.tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        };
        updates.push(ModelUpdate::Finish {
            reason,
            usage: turn.usage.clone(),
        });
        updates
    }
}

#[async_trait]
impl ModelClient for MockModel {
    async fn stream(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolDescriptor],
        _options: &StreamOptions,
        cancel: &CancellationToken,
    ) -> Result<ModelStream, ModelError> {
        if cancel.is_cancelled() {
            return Err(ModelError::Transient("cancelled".to_string()));
        }
        if let Ok(mut guard) = self.fail_first.lock() {
            let (remaining, error) = &mut *guard;
            if *remaining > 0 {
                *remaining -= 1;
                if let Some(e) = error.clone() {
                    return Err(e);
                }
            }
        }
        let turn = self
            .next_turn()
            .ok_or_else(|| ModelError::Terminal("mock script is empty".to_string()))?;
        let updates = Self::updates_for(&turn);
        let stream: ModelStream = Box::pin(futures::stream::iter(updates.into_iter().map(Ok)));
        Ok(stream)
    }
}
