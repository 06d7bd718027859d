//! # Capstan
//!
//! An agent execution engine in Rust. Given a user turn (messages, a
//! registry of callable tools, and a chat-model backend), Capstan drives the
//! agentic loop: call the model, execute requested tool calls in parallel,
//! feed results back, repeat, until the model answers or a guardrail fires.
//! Along the way it emits a fine-grained event stream and commits resumable
//! checkpoints.
//!
//! ## Design principles
//!
//! - **Immutable loop state**: one [`AgentLoopState`] record flows through
//!   the turn; every transition produces a new record, and middleware changes
//!   state only through scheduled updates.
//! - **Middleware everywhere**: the loop, the tool batch, each tool call, and
//!   the model call itself are wrapped by an ordered [`Middleware`] pipeline
//!   (guardrails, permissions, retries are all just middleware).
//! - **Events as the contract**: UIs, telemetry, and durability layers watch
//!   one closed [`AgentEvent`] set; bidirectional events (permissions,
//!   continuations) correlate responses by request id.
//! - **Explicit wiring**: model, tools, store, middleware, and observers are
//!   injected through [`AgentEngineBuilder`]; there is no global registry.
//!
//! ## Main modules
//!
//! - [`engine`]: [`AgentEngine`], [`AgentEngineBuilder`], [`EngineConfig`].
//! - [`thread`]: [`ConversationThread`]: run turns, branch, snapshot, resume.
//! - [`kernel`]: [`TurnKernel`], the iteration loop.
//! - [`middleware`]: the pipeline plus the canonical guards
//!   (circuit breaker, error tracking, permission, continuation, retry).
//! - [`scheduler`]: bounded-parallel tool dispatch with deterministic
//!   result ordering.
//! - [`event`]: [`AgentEvent`], [`EventCoordinator`], [`EventObserver`].
//! - [`model`]: [`ModelClient`] contract, [`ModelUpdate`] stream shape,
//!   [`MockModel`] for scripted runs.
//! - [`tools`]: [`ToolDescriptor`], [`ToolRegistry`], [`StaticToolRegistry`],
//!   container scoping.
//! - [`transcript`]: history reduction and token-count views.
//! - [`checkpoint`]: manifest DAG, [`CheckpointStore`] contract, in-memory and
//!   SQLite stores, [`BranchEngine`] (fork / copy / switch / prune).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use capstan::{
//!     AgentEngine, ChatMessage, MockModel, ScriptedTurn, StaticToolRegistry, ToolCall,
//!     ToolDescriptor,
//! };
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), capstan::EngineError> {
//! let model = MockModel::script(vec![
//!     ScriptedTurn::tool_calls(vec![ToolCall::new("c1", "add", json!({"a": 2, "b": 3}))]),
//!     ScriptedTurn::text("5"),
//! ]);
//! let registry = StaticToolRegistry::new().register_fn(
//!     ToolDescriptor::function("add", "Add two numbers", json!({})),
//!     |args| {
//!         let a = args["a"].as_i64().unwrap_or(0);
//!         let b = args["b"].as_i64().unwrap_or(0);
//!         Ok(json!(a + b))
//!     },
//! );
//!
//! let engine = AgentEngine::builder()
//!     .with_model(Arc::new(model))
//!     .with_registry(Arc::new(registry))
//!     .with_system_prompt("You add numbers.")
//!     .build();
//! let thread = engine.create_thread(None).await?;
//! let state = thread
//!     .send(vec![ChatMessage::user("What is 2+3?")], &CancellationToken::new())
//!     .await?;
//! println!("{}", state.last_assistant_text().unwrap_or_default());
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod event;
pub mod kernel;
pub mod message;
pub mod middleware;
pub mod model;
pub mod scheduler;
pub mod state;
pub mod thread;
pub mod tools;
pub mod transcript;

pub use checkpoint::{
    BranchEngine, CheckpointError, CheckpointSource, CheckpointStore, CommitSchedule,
    ManifestEntry, MemoryCheckpointStore, PendingWrite, SqliteCheckpointStore, ThreadHead,
    ThreadSnapshot, SCHEMA_VERSION,
};
pub use engine::{AgentEngine, AgentEngineBuilder, EngineConfig};
pub use error::EngineError;
pub use event::{
    AgentEvent, ChannelObserver, CollectingObserver, ContinuationReply, EventCoordinator,
    EventError, EventObserver, ObserverError, PermissionChoice, PermissionReply,
};
pub use kernel::{KernelConfig, TurnKernel};
pub use message::{
    ChatMessage, ContentPart, Role, ToolCall, ToolFailure, ToolOutcome, ToolResult,
    SUMMARY_MARKER_KEY,
};
pub use middleware::circuit_breaker::CircuitBreakerMiddleware;
pub use middleware::continuation::ContinuationMiddleware;
pub use middleware::error_tracking::{ErrorTrackingMiddleware, TotalErrorThresholdMiddleware};
pub use middleware::permission::PermissionMiddleware;
pub use middleware::retry::ModelRetryMiddleware;
pub use middleware::{
    FunctionContext, IterationContext, Middleware, MiddlewarePipeline, ModelCallNext,
    ModelCallRequest, TurnContext,
};
pub use model::{
    FinishReason, MockModel, ModelClient, ModelError, ModelStream, ModelUpdate, ScriptedTurn,
    StreamOptions, TokenUsage, ToolChoiceMode,
};
pub use scheduler::{BatchOutcome, SchedulerConfig, ToolScheduler};
pub use state::{AgentLoopState, SlotMap, TerminationReason};
pub use thread::ConversationThread;
pub use tools::{StaticToolRegistry, ToolDescriptor, ToolError, ToolRegistry};
pub use transcript::{apply_reduction, token_counts, ReductionError, ReductionPolicy, TokenCounts};
