//! Chat-model backend abstraction.
//!
//! The kernel depends on a single streaming call: messages and visible tools
//! in, a lazy sequence of [`ModelUpdate`]s out. Provider adapters live outside
//! the engine; [`MockModel`] scripts deterministic turns for tests and demos.
//!
//! # Streaming
//!
//! `stream` returns as soon as the backend accepts the request; updates are
//! then pulled one at a time, suspending at each chunk. The final update is
//! always [`ModelUpdate::Finish`]. Implementations must observe the
//! cancellation token between chunks.

mod mock;

pub use mock::{MockModel, ScriptedTurn};

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::message::ChatMessage;
use crate::tools::ToolDescriptor;

/// Model backend failure.
///
/// Transient failures (network, rate limit) are fair game for the retry
/// middleware wrapped around the model call; terminal failures (auth, invalid
/// request) surface as a turn error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("transient model error: {0}")]
    Transient(String),
    #[error("model error: {0}")]
    Terminal(String),
}

impl ModelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Transient(_))
    }
}

/// Token usage reported by the backend for one call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Why the model stopped emitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
}

/// One streamed update from the backend.
///
/// Tool-call arguments arrive as raw JSON fragments between
/// `ToolCallStart` and `ToolCallEnd`; the kernel buffers and parses them when
/// the call closes.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelUpdate {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCallStart { call_id: String, name: String },
    ToolCallArgsDelta { call_id: String, fragment: String },
    ToolCallEnd { call_id: String },
    Finish {
        reason: FinishReason,
        usage: Option<TokenUsage>,
    },
}

/// Tool choice constraint for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ToolChoiceMode {
    /// Model may answer or call tools. Default when tools are present.
    #[default]
    Auto,
    /// Model must not call any tool.
    None,
    /// Model must call at least one tool.
    Required,
}

/// Per-call options forwarded to the backend.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub tool_choice: ToolChoiceMode,
    pub max_output_tokens: Option<u32>,
}

/// Lazy sequence of model updates.
pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelUpdate, ModelError>> + Send>>;

/// Chat-model backend: one streaming completion call.
///
/// **Interaction**: invoked by the kernel through the middleware
/// `wrap_model_call` onion, so caching/retry/accounting middleware see every
/// call.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDescriptor],
        options: &StreamOptions,
        cancel: &CancellationToken,
    ) -> Result<ModelStream, ModelError>;
}
