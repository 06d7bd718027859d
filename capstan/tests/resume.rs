//! Crash recovery: per-iteration checkpoints, pending-write replay, and
//! resume equivalence (S6 / property 7), plus thread snapshot round-trips.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use capstan::{
    AgentEngine, AgentEvent, ChatMessage, CheckpointStore, CollectingObserver, CommitSchedule,
    EngineConfig, EngineError, IterationContext, MemoryCheckpointStore, Middleware, MockModel,
    ScriptedTurn, StaticToolRegistry, TerminationReason, ToolCall, ToolDescriptor,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Fails the turn from `after_iteration` at a chosen iteration: the moment
/// after the scheduler persisted its pending writes but before the iteration
/// checkpoint commits.
struct CrashAfterScheduler {
    at_iteration: u32,
}

#[async_trait]
impl Middleware for CrashAfterScheduler {
    fn name(&self) -> &str {
        "crash_after_scheduler"
    }

    async fn after_iteration(&self, ctx: &mut IterationContext) -> Result<(), EngineError> {
        if ctx.iteration == self.at_iteration {
            return Err(EngineError::Middleware {
                name: self.name().to_string(),
                message: "simulated process death".to_string(),
            });
        }
        Ok(())
    }
}

fn add_registry(counter: Arc<AtomicU32>) -> StaticToolRegistry {
    StaticToolRegistry::new().register_fn(
        ToolDescriptor::function("add", "Add", json!({})),
        move |args| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(
                args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0)
            ))
        },
    )
}

fn full_script() -> Vec<ScriptedTurn> {
    vec![
        ScriptedTurn::tool_calls(vec![ToolCall::new("c1", "add", json!({"a": 1, "b": 1}))]),
        ScriptedTurn::tool_calls(vec![ToolCall::new("c2", "add", json!({"a": 2, "b": 2}))]),
        ScriptedTurn::text("done"),
    ]
}

/// Script as the resumed process sees it: the turn restarts at iteration 1,
/// so the model serves iteration 1's response first.
fn resume_script() -> Vec<ScriptedTurn> {
    vec![
        ScriptedTurn::tool_calls(vec![ToolCall::new("c2", "add", json!({"a": 2, "b": 2}))]),
        ScriptedTurn::text("done"),
    ]
}

fn per_iteration_config() -> EngineConfig {
    EngineConfig {
        commit_schedule: CommitSchedule::PerIteration,
        ..EngineConfig::default()
    }
}

/// S6: kill the turn between iteration 1's scheduler and its
/// `after_iteration`; resume replays the pending write and the final log
/// matches the no-crash baseline.
#[tokio::test]
async fn resume_after_crash_matches_baseline() {
    let cancel = CancellationToken::new();

    // Baseline, no crash.
    let baseline_counter = Arc::new(AtomicU32::new(0));
    let baseline_engine = AgentEngine::builder()
        .with_model(Arc::new(MockModel::script(full_script())))
        .with_registry(Arc::new(add_registry(Arc::clone(&baseline_counter))))
        .with_store(Arc::new(MemoryCheckpointStore::new()))
        .with_system_prompt("You add.")
        .with_config(per_iteration_config())
        .build();
    let baseline_thread = baseline_engine.create_thread(None).await.unwrap();
    let baseline = baseline_thread
        .send(vec![ChatMessage::user("sum things")], &cancel)
        .await
        .unwrap();
    assert_eq!(baseline.termination_reason, Some(TerminationReason::Natural));
    assert_eq!(baseline_counter.load(Ordering::SeqCst), 2);

    // Crashing run over a shared store.
    let store = Arc::new(MemoryCheckpointStore::new());
    let crash_counter = Arc::new(AtomicU32::new(0));
    let crash_engine = AgentEngine::builder()
        .with_model(Arc::new(MockModel::script(full_script())))
        .with_registry(Arc::new(add_registry(Arc::clone(&crash_counter))))
        .with_store(Arc::clone(&store) as Arc<dyn CheckpointStore>)
        .with_system_prompt("You add.")
        .with_config(per_iteration_config())
        .add_middleware(Arc::new(CrashAfterScheduler { at_iteration: 1 }))
        .build();
    let crash_thread = crash_engine.create_thread(None).await.unwrap();
    let thread_id = crash_thread.id().await;
    let crashed = crash_thread
        .send(vec![ChatMessage::user("sum things")], &cancel)
        .await;
    assert!(crashed.is_err(), "simulated crash must surface");
    assert_eq!(crash_counter.load(Ordering::SeqCst), 2);
    // Iteration 1's result survived only as a pending write.
    assert_eq!(store.pending_writes(&thread_id, 1).await.unwrap().len(), 1);
    drop(crash_thread);
    drop(crash_engine);

    // Resumed process: fresh engine over the same store.
    let resume_counter = Arc::new(AtomicU32::new(0));
    let resume_engine = AgentEngine::builder()
        .with_model(Arc::new(MockModel::script(resume_script())))
        .with_registry(Arc::new(add_registry(Arc::clone(&resume_counter))))
        .with_store(Arc::clone(&store) as Arc<dyn CheckpointStore>)
        .with_system_prompt("You add.")
        .with_config(per_iteration_config())
        .build();
    let resumed_thread = resume_engine.resume_thread(&thread_id).await.unwrap();
    assert_eq!(resumed_thread.state().await.iteration, 1);

    let resumed = resumed_thread.resume_turn(&cancel).await.unwrap();
    assert_eq!(resumed.termination_reason, Some(TerminationReason::Natural));
    // c2 was replayed from the pending write, never re-executed.
    assert_eq!(resume_counter.load(Ordering::SeqCst), 0);
    assert_eq!(
        serde_json::to_string(&resumed.messages).unwrap(),
        serde_json::to_string(&baseline.messages).unwrap(),
    );
}

/// Pending writes are cleared once the resumed turn completes.
#[tokio::test]
async fn pending_writes_cleared_after_completion() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let engine = AgentEngine::builder()
        .with_model(Arc::new(MockModel::script(full_script())))
        .with_registry(Arc::new(add_registry(Arc::new(AtomicU32::new(0)))))
        .with_store(Arc::clone(&store) as Arc<dyn CheckpointStore>)
        .with_config(per_iteration_config())
        .build();
    let thread = engine.create_thread(None).await.unwrap();
    let thread_id = thread.id().await;
    thread
        .send(vec![ChatMessage::user("go")], &CancellationToken::new())
        .await
        .unwrap();
    for iteration in 0..3 {
        assert!(store
            .pending_writes(&thread_id, iteration)
            .await
            .unwrap()
            .is_empty());
    }
}

/// Thread snapshot/restore round-trips the whole head (property 3 at the
/// facade level).
#[tokio::test]
async fn snapshot_restore_round_trip() {
    let engine = AgentEngine::builder()
        .with_model(Arc::new(MockModel::script(full_script())))
        .with_registry(Arc::new(add_registry(Arc::new(AtomicU32::new(0)))))
        .with_system_prompt("You add.")
        .build();
    let thread = engine.create_thread(Some("snap".into())).await.unwrap();
    thread
        .send(vec![ChatMessage::user("go")], &CancellationToken::new())
        .await
        .unwrap();
    let before = thread.state().await;

    let bytes = thread.snapshot().await.unwrap();
    // Clobber the live state, then restore.
    thread
        .send(vec![ChatMessage::user("more")], &CancellationToken::new())
        .await
        .unwrap();
    assert_ne!(thread.state().await.messages.len(), before.messages.len());
    thread.restore(&bytes).await.unwrap();
    assert_eq!(thread.state().await, before);
}

/// CheckpointRestored is emitted when a thread rehydrates.
#[tokio::test]
async fn resume_emits_checkpoint_restored() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let observer = Arc::new(CollectingObserver::new());
    let engine = AgentEngine::builder()
        .with_model(Arc::new(MockModel::script(full_script())))
        .with_registry(Arc::new(add_registry(Arc::new(AtomicU32::new(0)))))
        .with_store(Arc::clone(&store) as Arc<dyn CheckpointStore>)
        .add_observer(observer.clone())
        .build();
    let thread = engine.create_thread(None).await.unwrap();
    let thread_id = thread.id().await;
    thread
        .send(vec![ChatMessage::user("go")], &CancellationToken::new())
        .await
        .unwrap();

    let resumed = engine.resume_thread(&thread_id).await.unwrap();
    assert_eq!(resumed.id().await, thread_id);
    assert!(observer
        .events()
        .iter()
        .any(|e| matches!(e, AgentEvent::CheckpointRestored { .. })));
}
