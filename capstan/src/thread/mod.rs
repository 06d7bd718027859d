//! Conversation thread facade.
//!
//! Ties the kernel, scheduler, event coordinator, and checkpoint engine to a
//! conversation identity. A thread serializes its own message turns (single
//! logical writer); distinct threads run independently.
//!
//! `send` runs a turn inline and returns the final state; `run` does the same
//! on a background task and hands back a lazy event stream. Branching,
//! snapshot/restore, and crash resume (`resume_turn`) live here too.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::checkpoint::{
    BranchEngine, CheckpointSource, CheckpointStore, CommitSchedule, ManifestEntry, ThreadHead,
    ThreadSnapshot,
};
use crate::error::EngineError;
use crate::event::{AgentEvent, ChannelObserver, EventCoordinator};
use crate::kernel::TurnKernel;
use crate::message::{ChatMessage, ToolResult};
use crate::state::{AgentLoopState, TerminationReason};
use crate::transcript::{self, ReductionPolicy, TokenCounts};

pub(crate) struct ThreadInner {
    pub kernel: TurnKernel,
    pub events: Arc<EventCoordinator>,
    pub branch_engine: Option<Arc<BranchEngine>>,
    pub store: Option<Arc<dyn CheckpointStore>>,
    pub commit_schedule: CommitSchedule,
    pub turn_timeout: Option<Duration>,
    pub reduction_policy: ReductionPolicy,
    pub head: RwLock<ThreadHead>,
    /// Serializes message turns on this thread.
    pub turn_lock: Mutex<()>,
    /// Pending-write results loaded at resume, consumed by `resume_turn`.
    pub pending_replay: Mutex<HashMap<String, ToolResult>>,
}

/// One conversation: identity, state, events, branches.
#[derive(Clone)]
pub struct ConversationThread {
    inner: Arc<ThreadInner>,
}

impl ConversationThread {
    pub(crate) fn from_inner(inner: Arc<ThreadInner>) -> Self {
        Self { inner }
    }

    pub async fn id(&self) -> String {
        self.inner.head.read().await.thread_id.clone()
    }

    /// Snapshot of the current loop state.
    pub async fn state(&self) -> AgentLoopState {
        self.inner.head.read().await.state.clone()
    }

    /// Content of the last assistant message, if any.
    pub async fn last_reply(&self) -> Option<String> {
        self.inner.head.read().await.state.last_assistant_text()
    }

    /// Branch label → head checkpoint id.
    pub async fn branches(&self) -> BTreeMap<String, String> {
        self.inner.head.read().await.branches.clone()
    }

    pub async fn active_branch(&self) -> Option<String> {
        self.inner.head.read().await.active_branch.clone()
    }

    /// Event coordinator of this thread (register observers here).
    pub fn events(&self) -> &Arc<EventCoordinator> {
        &self.inner.events
    }

    /// Token-count views over the current transcript.
    pub async fn token_counts(&self) -> TokenCounts {
        transcript::token_counts(&self.inner.head.read().await.state.messages)
    }

    /// Runs one message turn to completion and returns the final state.
    pub async fn send(
        &self,
        user_messages: Vec<ChatMessage>,
        cancel: &CancellationToken,
    ) -> Result<AgentLoopState, EngineError> {
        self.run_turn_inner(user_messages, false, cancel).await
    }

    /// Resumes a turn interrupted mid-iteration: pending-write results are
    /// replayed instead of re-executing their calls, and the loop continues
    /// at the iteration stored in state.
    pub async fn resume_turn(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AgentLoopState, EngineError> {
        self.run_turn_inner(Vec::new(), true, cancel).await
    }

    /// Runs one message turn on a background task, returning its event stream.
    ///
    /// The stream yields everything from `MessageTurnStarted` to
    /// `MessageTurnFinished` (or `MessageTurnError`) and then closes.
    pub async fn run(
        &self,
        user_messages: Vec<ChatMessage>,
        cancel: &CancellationToken,
    ) -> ReceiverStream<AgentEvent> {
        let (observer, rx) = ChannelObserver::channel(256);
        let observer_id = self.inner.events.register_observer(Arc::new(observer));
        let this = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = this.send(user_messages, &cancel).await;
            this.inner.events.remove_observer(observer_id);
        });
        ReceiverStream::new(rx)
    }

    async fn run_turn_inner(
        &self,
        user_messages: Vec<ChatMessage>,
        resume: bool,
        cancel: &CancellationToken,
    ) -> Result<AgentLoopState, EngineError> {
        let _turn = self.inner.turn_lock.lock().await;
        let mut head = self.inner.head.write().await;
        let thread_id = head.thread_id.clone();

        self.inner
            .events
            .emit(AgentEvent::MessageTurnStarted {
                thread_id: thread_id.clone(),
            })
            .await;

        let replayed = if resume {
            std::mem::take(&mut *self.inner.pending_replay.lock().await)
        } else {
            head.state = head.state.begin_turn(user_messages);
            HashMap::new()
        };

        // Per-turn wall clock: trips the shared token so every suspension
        // point observes it.
        let turn_cancel = cancel.child_token();
        let timeout_guard = self.inner.turn_timeout.map(|limit| {
            let token = turn_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                token.cancel();
            })
        });

        let outcome = self
            .inner
            .kernel
            .run_turn(&mut head, replayed, &turn_cancel)
            .await;
        if let Some(guard) = timeout_guard {
            guard.abort();
        }

        match outcome {
            Ok(()) => {
                if self.inner.commit_schedule >= CommitSchedule::PerTurn {
                    let iteration = head.state.iteration as i64;
                    self.inner
                        .kernel
                        .commit_checkpoint(&mut head, CheckpointSource::Turn, iteration)
                        .await;
                }
                if let Some(store) = self.inner.store.as_ref() {
                    if let Err(e) = store.delete_pending_writes(&thread_id).await {
                        warn!(error = %e, "failed to clear pending writes");
                    }
                }
                let reason = head
                    .state
                    .termination_reason
                    .unwrap_or(TerminationReason::Natural);
                self.inner
                    .events
                    .emit(AgentEvent::MessageTurnFinished {
                        thread_id,
                        reason,
                    })
                    .await;
                Ok(head.state.clone())
            }
            Err(EngineError::Cancelled) => {
                // Best-effort final checkpoint; pending writes stay for resume.
                head.state = head.state.terminated(TerminationReason::UserCancelled);
                if self.inner.commit_schedule >= CommitSchedule::PerTurn {
                    let iteration = head.state.iteration as i64;
                    self.inner
                        .kernel
                        .commit_checkpoint(&mut head, CheckpointSource::Turn, iteration)
                        .await;
                }
                self.inner
                    .events
                    .emit(AgentEvent::MessageTurnFinished {
                        thread_id,
                        reason: TerminationReason::UserCancelled,
                    })
                    .await;
                Ok(head.state.clone())
            }
            Err(e) => {
                self.inner
                    .events
                    .emit(AgentEvent::MessageTurnError {
                        thread_id,
                        message: e.to_string(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    /// Commits the current head immediately (root checkpoints, manual saves).
    pub(crate) async fn commit_now(&self, source: CheckpointSource, step: i64) {
        let mut head = self.inner.head.write().await;
        self.inner
            .kernel
            .commit_checkpoint(&mut head, source, step)
            .await;
    }

    /// Applies an externally produced history reduction to the transcript.
    ///
    /// The cache-aware gate: when too few messages follow the existing
    /// summary, the reduction is skipped and `false` is returned.
    pub async fn apply_reduction(
        &self,
        summary: ChatMessage,
        removed_count: usize,
    ) -> Result<bool, EngineError> {
        let _turn = self.inner.turn_lock.lock().await;
        let mut head = self.inner.head.write().await;
        if !self.inner.reduction_policy.should_reduce(&head.state.messages) {
            debug!("reduction skipped: summary is fresh enough");
            return Ok(false);
        }
        let messages = transcript::apply_reduction(&head.state.messages, summary, removed_count)
            .map_err(|e| EngineError::Snapshot(e.to_string()))?;
        head.state = AgentLoopState {
            messages,
            ..head.state.clone()
        };
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Branching API
    // ------------------------------------------------------------------

    fn engine(&self) -> Result<&Arc<BranchEngine>, EngineError> {
        self.inner.branch_engine.as_ref().ok_or_else(|| {
            EngineError::Snapshot("no checkpoint store configured".to_string())
        })
    }

    /// Creates `new_branch` from an existing checkpoint and switches to it.
    pub async fn fork(
        &self,
        source_checkpoint_id: &str,
        new_branch: &str,
    ) -> Result<ManifestEntry, EngineError> {
        let engine = self.engine()?;
        let _turn = self.inner.turn_lock.lock().await;
        let mut head = self.inner.head.write().await;
        let entry = engine
            .fork(&mut head, source_checkpoint_id, new_branch)
            .await?;
        self.inner
            .events
            .emit(AgentEvent::BranchCreated {
                thread_id: head.thread_id.clone(),
                branch: new_branch.to_string(),
                checkpoint_id: entry.checkpoint_id.clone(),
            })
            .await;
        Ok(entry)
    }

    /// Switches to the head of a named branch.
    pub async fn switch(&self, branch: &str) -> Result<ManifestEntry, EngineError> {
        let engine = self.engine()?;
        let _turn = self.inner.turn_lock.lock().await;
        let mut head = self.inner.head.write().await;
        let entry = engine.switch(&mut head, branch).await?;
        self.inner
            .events
            .emit(AgentEvent::BranchSwitched {
                thread_id: head.thread_id.clone(),
                branch: branch.to_string(),
                checkpoint_id: entry.checkpoint_id.clone(),
            })
            .await;
        Ok(entry)
    }

    /// Deletes a branch label; with `prune`, drops unreachable checkpoints.
    pub async fn delete_branch(
        &self,
        branch: &str,
        prune: bool,
    ) -> Result<Vec<String>, EngineError> {
        let engine = self.engine()?;
        let _turn = self.inner.turn_lock.lock().await;
        let mut head = self.inner.head.write().await;
        let pruned = engine.delete_branch(&mut head, branch, prune).await?;
        self.inner
            .events
            .emit(AgentEvent::BranchDeleted {
                thread_id: head.thread_id.clone(),
                branch: branch.to_string(),
            })
            .await;
        Ok(pruned)
    }

    pub async fn rename_branch(&self, from: &str, to: &str) -> Result<(), EngineError> {
        let engine = self.engine()?;
        let _turn = self.inner.turn_lock.lock().await;
        let mut head = self.inner.head.write().await;
        engine.rename_branch(&mut head, from, to).await?;
        Ok(())
    }

    /// Manifest entries of this thread, oldest first.
    pub async fn list_checkpoints(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<ManifestEntry>, EngineError> {
        let engine = self.engine()?;
        let head = self.inner.head.read().await;
        Ok(engine.store().manifest(&head.thread_id, limit, None).await?)
    }

    /// Checkpoints snapshotted at the given message-log length.
    pub async fn list_variants_at(
        &self,
        message_index: usize,
    ) -> Result<Vec<ManifestEntry>, EngineError> {
        let engine = self.engine()?;
        let head = self.inner.head.read().await;
        Ok(engine.list_variants_at(&head.thread_id, message_index).await?)
    }

    // ------------------------------------------------------------------
    // Snapshot / restore
    // ------------------------------------------------------------------

    /// Serializes the current head as a self-describing document.
    pub async fn snapshot(&self) -> Result<Vec<u8>, EngineError> {
        let head = self.inner.head.read().await;
        Ok(head.snapshot().to_bytes()?)
    }

    /// Replaces the head with a previously serialized snapshot.
    pub async fn restore(&self, bytes: &[u8]) -> Result<(), EngineError> {
        let snapshot = ThreadSnapshot::from_bytes(bytes)?;
        let _turn = self.inner.turn_lock.lock().await;
        let mut head = self.inner.head.write().await;
        let thread_id = head.thread_id.clone();
        let current = head.current_checkpoint.clone();
        *head = ThreadHead::from_snapshot(thread_id, &snapshot, current);
        Ok(())
    }
}
