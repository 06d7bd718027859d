//! Engine assembly: configuration, builder, and thread lifecycle.
//!
//! Everything is wired explicitly: the model backend, the tool registry, the
//! checkpoint store, middleware, and observers are passed into the builder;
//! no process-global registration exists. Defaults lean on the same mocks the
//! tests use, so `AgentEngineBuilder::default().build()` produces a working
//! (scripted) engine for demos.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::checkpoint::{
    BranchEngine, CheckpointSource, CheckpointStore, CommitSchedule, ThreadHead,
};
use crate::error::EngineError;
use crate::event::{AgentEvent, EventCoordinator, EventObserver};
use crate::kernel::{KernelConfig, TurnKernel};
use crate::message::{ChatMessage, ToolResult};
use crate::middleware::circuit_breaker::CircuitBreakerMiddleware;
use crate::middleware::continuation::ContinuationMiddleware;
use crate::middleware::error_tracking::{ErrorTrackingMiddleware, TotalErrorThresholdMiddleware};
use crate::middleware::permission::PermissionMiddleware;
use crate::middleware::retry::ModelRetryMiddleware;
use crate::middleware::{Middleware, MiddlewarePipeline};
use crate::model::{MockModel, ModelClient, StreamOptions};
use crate::scheduler::{SchedulerConfig, ToolScheduler};
use crate::state::AgentLoopState;
use crate::thread::{ConversationThread, ThreadInner};
use crate::tools::{StaticToolRegistry, ToolRegistry};
use crate::transcript::ReductionPolicy;

/// Engine-wide knobs. `from_env` reads `CAPSTAN_*` variables (typically
/// layered in by the `config` crate) and falls back to these defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_iterations: u32,
    pub tool_concurrency: usize,
    /// Per-tool-call timeout; `None` for pure in-process functions.
    pub per_tool_timeout: Option<Duration>,
    /// Per-turn wall-clock timeout.
    pub turn_timeout: Option<Duration>,
    /// Timeout for bidirectional responses (permissions, continuations).
    pub response_timeout: Duration,
    pub circuit_breaker_threshold: u32,
    pub consecutive_error_threshold: u32,
    pub total_error_ceiling: u32,
    /// Iterations granted per continuation approval.
    pub continuation_extension: u32,
    pub commit_schedule: CommitSchedule,
    /// Reduction gate: minimum messages since the last summary.
    pub reduction_min_messages: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            tool_concurrency: 8,
            per_tool_timeout: None,
            turn_timeout: None,
            response_timeout: Duration::from_secs(300),
            circuit_breaker_threshold: 3,
            consecutive_error_threshold: 3,
            total_error_ceiling: 10,
            continuation_extension: 5,
            commit_schedule: CommitSchedule::PerTurn,
            reduction_min_messages: 8,
        }
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

impl EngineConfig {
    /// Layers the project `.env` and XDG `config.toml` into the process
    /// environment (existing env wins), then reads `CAPSTAN_*` variables.
    pub fn load() -> Self {
        if let Err(e) = env_config::load_and_apply("capstan", None) {
            tracing::warn!(error = %e, "config layering failed; using process env only");
        }
        Self::from_env()
    }

    /// Reads configuration from `CAPSTAN_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let commit_schedule = match std::env::var("CAPSTAN_COMMIT_SCHEDULE")
            .unwrap_or_default()
            .as_str()
        {
            "never" => CommitSchedule::Never,
            "per_turn" => CommitSchedule::PerTurn,
            "per_iteration" => CommitSchedule::PerIteration,
            "full_history" => CommitSchedule::FullHistory,
            _ => defaults.commit_schedule,
        };
        Self {
            max_iterations: env_u32("CAPSTAN_MAX_ITERATIONS", defaults.max_iterations),
            tool_concurrency: env_usize("CAPSTAN_TOOL_CONCURRENCY", defaults.tool_concurrency),
            per_tool_timeout: env_secs("CAPSTAN_TOOL_TIMEOUT_SECS"),
            turn_timeout: env_secs("CAPSTAN_TURN_TIMEOUT_SECS"),
            response_timeout: env_secs("CAPSTAN_RESPONSE_TIMEOUT_SECS")
                .unwrap_or(defaults.response_timeout),
            circuit_breaker_threshold: env_u32(
                "CAPSTAN_CIRCUIT_BREAKER_THRESHOLD",
                defaults.circuit_breaker_threshold,
            ),
            consecutive_error_threshold: env_u32(
                "CAPSTAN_CONSECUTIVE_ERROR_THRESHOLD",
                defaults.consecutive_error_threshold,
            ),
            total_error_ceiling: env_u32(
                "CAPSTAN_TOTAL_ERROR_CEILING",
                defaults.total_error_ceiling,
            ),
            continuation_extension: env_u32(
                "CAPSTAN_CONTINUATION_EXTENSION",
                defaults.continuation_extension,
            ),
            commit_schedule,
            reduction_min_messages: env_usize(
                "CAPSTAN_REDUCTION_MIN_MESSAGES",
                defaults.reduction_min_messages,
            ),
        }
    }
}

/// Builds an [`AgentEngine`].
pub struct AgentEngineBuilder {
    config: EngineConfig,
    model: Option<Arc<dyn ModelClient>>,
    registry: Option<Arc<dyn ToolRegistry>>,
    store: Option<Arc<dyn CheckpointStore>>,
    middlewares: Option<Vec<Arc<dyn Middleware>>>,
    extra_middlewares: Vec<Arc<dyn Middleware>>,
    observers: Vec<Arc<dyn EventObserver>>,
    system_prompt: Option<String>,
    visibility_context: BTreeMap<String, Value>,
    stream_options: StreamOptions,
}

impl Default for AgentEngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            model: None,
            registry: None,
            store: None,
            middlewares: None,
            extra_middlewares: Vec::new(),
            observers: Vec::new(),
            system_prompt: None,
            visibility_context: BTreeMap::new(),
            stream_options: StreamOptions::default(),
        }
    }
}

impl AgentEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces the canonical middleware set entirely.
    pub fn with_middlewares(mut self, middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        self.middlewares = Some(middlewares);
        self
    }

    /// Appends a middleware after the canonical set.
    pub fn add_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.extra_middlewares.push(middleware);
        self
    }

    pub fn add_observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_visibility_context(mut self, context: BTreeMap<String, Value>) -> Self {
        self.visibility_context = context;
        self
    }

    pub fn with_stream_options(mut self, options: StreamOptions) -> Self {
        self.stream_options = options;
        self
    }

    fn canonical_middlewares(config: &EngineConfig) -> Vec<Arc<dyn Middleware>> {
        vec![
            Arc::new(PermissionMiddleware::new()),
            Arc::new(CircuitBreakerMiddleware::new(
                config.circuit_breaker_threshold,
            )),
            Arc::new(ErrorTrackingMiddleware::new(
                config.consecutive_error_threshold,
            )),
            Arc::new(TotalErrorThresholdMiddleware::new(config.total_error_ceiling)),
            Arc::new(ContinuationMiddleware::new(config.continuation_extension)),
            Arc::new(ModelRetryMiddleware::default()),
        ]
    }

    pub fn build(self) -> AgentEngine {
        let model: Arc<dyn ModelClient> = self
            .model
            .unwrap_or_else(|| Arc::new(MockModel::text_reply("Hello from the mock model.")));
        let registry: Arc<dyn ToolRegistry> = self
            .registry
            .unwrap_or_else(|| Arc::new(StaticToolRegistry::new()));
        let mut middlewares = self
            .middlewares
            .unwrap_or_else(|| Self::canonical_middlewares(&self.config));
        middlewares.extend(self.extra_middlewares);
        AgentEngine {
            config: self.config,
            model,
            registry,
            store: self.store,
            pipeline: MiddlewarePipeline::new(middlewares),
            observers: self.observers,
            system_prompt: self.system_prompt,
            visibility_context: self.visibility_context,
            stream_options: self.stream_options,
        }
    }
}

/// The assembled engine: creates, resumes, and copies conversation threads.
pub struct AgentEngine {
    config: EngineConfig,
    model: Arc<dyn ModelClient>,
    registry: Arc<dyn ToolRegistry>,
    store: Option<Arc<dyn CheckpointStore>>,
    pipeline: MiddlewarePipeline,
    observers: Vec<Arc<dyn EventObserver>>,
    system_prompt: Option<String>,
    visibility_context: BTreeMap<String, Value>,
    stream_options: StreamOptions,
}

impl AgentEngine {
    pub fn builder() -> AgentEngineBuilder {
        AgentEngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn build_thread(
        &self,
        head: ThreadHead,
        pending_replay: HashMap<String, ToolResult>,
    ) -> ConversationThread {
        let events = Arc::new(EventCoordinator::new(self.config.response_timeout));
        for observer in &self.observers {
            events.register_observer(Arc::clone(observer));
        }
        let branch_engine = self
            .store
            .as_ref()
            .map(|s| Arc::new(BranchEngine::new(Arc::clone(s))));
        let scheduler = ToolScheduler::new(SchedulerConfig {
            concurrency_cap: self.config.tool_concurrency,
            per_call_timeout: self.config.per_tool_timeout,
        });
        let kernel = TurnKernel::new(
            Arc::clone(&self.model),
            Arc::clone(&self.registry),
            self.pipeline.clone(),
            scheduler,
            Arc::clone(&events),
            branch_engine.clone(),
            KernelConfig {
                commit_schedule: self.config.commit_schedule,
                visibility_context: self.visibility_context.clone(),
                stream_options: self.stream_options.clone(),
            },
        );
        ConversationThread::from_inner(Arc::new(ThreadInner {
            kernel,
            events,
            branch_engine,
            store: self.store.clone(),
            commit_schedule: self.config.commit_schedule,
            turn_timeout: self.config.turn_timeout,
            reduction_policy: ReductionPolicy {
                min_messages_since_summary: self.config.reduction_min_messages,
            },
            head: RwLock::new(head),
            turn_lock: Mutex::new(()),
            pending_replay: Mutex::new(pending_replay),
        }))
    }

    /// Creates a fresh thread (and its root checkpoint, when a store is
    /// configured and the schedule allows commits).
    pub async fn create_thread(
        &self,
        display_name: Option<String>,
    ) -> Result<ConversationThread, EngineError> {
        let thread_id = Uuid::new_v4().to_string();
        let messages: Vec<ChatMessage> = self
            .system_prompt
            .as_ref()
            .map(|p| vec![ChatMessage::system(p.clone())])
            .unwrap_or_default();
        let mut head = ThreadHead::new(
            thread_id,
            AgentLoopState::new(messages, self.config.max_iterations),
        );
        head.display_name = display_name;
        let thread = self.build_thread(head, HashMap::new());
        thread
            .commit_now(CheckpointSource::Root, -1)
            .await;
        Ok(thread)
    }

    /// Rehydrates a thread from its head checkpoint. Pending writes for the
    /// stored iteration are queued for [`ConversationThread::resume_turn`].
    pub async fn resume_thread(&self, thread_id: &str) -> Result<ConversationThread, EngineError> {
        let store = self.store.as_ref().ok_or_else(|| {
            EngineError::Snapshot("no checkpoint store configured".to_string())
        })?;
        let engine = BranchEngine::new(Arc::clone(store));
        let (entry, snapshot) = engine
            .load_snapshot(thread_id, None)
            .await?
            .ok_or_else(|| {
                EngineError::Checkpoint(crate::checkpoint::CheckpointError::NotFound(
                    thread_id.to_string(),
                ))
            })?;
        let head = ThreadHead::from_snapshot(
            thread_id,
            &snapshot,
            Some(entry.checkpoint_id.clone()),
        );
        let iteration = head.state.iteration;
        let replay: HashMap<String, ToolResult> = store
            .pending_writes(thread_id, iteration)
            .await?
            .into_iter()
            .map(|w| (w.call_id.clone(), w.result))
            .collect();
        let thread = self.build_thread(head, replay);
        thread
            .events()
            .emit(AgentEvent::CheckpointRestored {
                checkpoint_id: entry.checkpoint_id,
            })
            .await;
        Ok(thread)
    }

    /// Copies a checkpoint of an existing thread into a new thread.
    pub async fn copy_thread(
        &self,
        source_thread_id: &str,
        source_checkpoint_id: Option<&str>,
        display_name: Option<String>,
    ) -> Result<ConversationThread, EngineError> {
        let store = self.store.as_ref().ok_or_else(|| {
            EngineError::Snapshot("no checkpoint store configured".to_string())
        })?;
        let engine = BranchEngine::new(Arc::clone(store));
        let (head, entry) = engine
            .copy(source_thread_id, source_checkpoint_id, display_name)
            .await?;
        let new_thread_id = head.thread_id.clone();
        let thread = self.build_thread(head, HashMap::new());
        thread
            .events()
            .emit(AgentEvent::ThreadCopied {
                source_thread_id: source_thread_id.to_string(),
                new_thread_id,
                checkpoint_id: entry.checkpoint_id,
            })
            .await;
        Ok(thread)
    }
}
