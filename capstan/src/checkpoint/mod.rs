//! Checkpointing: durable snapshots, the manifest DAG, and branching.
//!
//! Each thread owns an append-only **manifest** of [`ManifestEntry`]s, the
//! single source of truth for the checkpoint DAG. The bulk state lives behind
//! the checkpoint id as a serialized [`ThreadSnapshot`]. Named branches are
//! mutable labels on DAG nodes; [`BranchEngine`] implements fork, copy,
//! switch, delete, rename, and prune on top of any [`CheckpointStore`].
//!
//! Wire encoding is self-describing JSON with a top-level `schema_version`;
//! version bumps are additive: new fields default on read, unknown fields
//! are preserved and written back.

mod branch;
mod ids;
mod memory;
mod sqlite;
mod store;

pub use branch::{BranchEngine, ThreadHead};
pub use ids::ordered_id;
pub use memory::MemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;
pub use store::{CheckpointError, CheckpointStore, ManifestMutator};

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{ChatMessage, ToolResult};
use crate::model::TokenUsage;
use crate::state::{AgentLoopState, SlotMap, TerminationReason};

/// Current snapshot wire version.
pub const SCHEMA_VERSION: u32 = 1;

/// What produced a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    /// Thread creation.
    Root,
    /// Turn boundary.
    Turn,
    /// Iteration boundary.
    Iteration,
    /// Intra-thread branch creation.
    Fork,
    /// Root of a copied thread.
    Copy,
    /// Explicit caller-requested commit.
    Manual,
}

impl CheckpointSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointSource::Root => "root",
            CheckpointSource::Turn => "turn",
            CheckpointSource::Iteration => "iteration",
            CheckpointSource::Fork => "fork",
            CheckpointSource::Copy => "copy",
            CheckpointSource::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "root" => CheckpointSource::Root,
            "turn" => CheckpointSource::Turn,
            "iteration" => CheckpointSource::Iteration,
            "fork" => CheckpointSource::Fork,
            "copy" => CheckpointSource::Copy,
            _ => CheckpointSource::Manual,
        }
    }
}

/// When the kernel commits checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitSchedule {
    Never,
    PerTurn,
    PerIteration,
    /// Every state transition, including mid-iteration; for debugging.
    FullHistory,
}

impl Default for CommitSchedule {
    fn default() -> Self {
        CommitSchedule::PerTurn
    }
}

/// One manifest entry: the DAG node metadata for a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub checkpoint_id: String,
    /// Parent within the thread; `None` marks a root.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Branch label carried by this node, if any.
    #[serde(default)]
    pub branch: Option<String>,
    pub source: CheckpointSource,
    /// Step number (iteration for iteration commits, turn-final iteration
    /// for turn commits, -1 for roots).
    pub step: i64,
    /// Message-log length at snapshot time.
    pub message_index: usize,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// Append index within the thread manifest; assigned by the store.
    #[serde(default)]
    pub seq: u64,
    /// Lineage of a copied thread's root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_checkpoint_id: Option<String>,
}

/// A completed tool result not yet folded into a checkpointed state.
///
/// Created when a tool call returns, consumed by the next iteration's
/// checkpoint (or by resume), deleted on turn completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub thread_id: String,
    pub iteration: u32,
    pub call_id: String,
    pub result: ToolResult,
}

/// Loop state fields as persisted (messages are stored separately at the
/// snapshot's top level).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopStateRepr {
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub max_iteration_limit: u32,
    #[serde(default)]
    pub completed_calls: BTreeSet<String>,
    #[serde(default)]
    pub expanded_containers: BTreeSet<String>,
    #[serde(default)]
    pub middleware_states: SlotMap,
    #[serde(default)]
    pub is_terminated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_total: Option<TokenUsage>,
}

/// The serialized form of one checkpoint: messages, loop state, branch info,
/// and thread metadata, under a `schema_version`.
///
/// Unknown fields survive a read/write cycle via the flattened `extra` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub schema_version: u32,
    pub messages: Vec<ChatMessage>,
    pub loop_state: LoopStateRepr,
    #[serde(default)]
    pub branches: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ThreadSnapshot {
    /// Captures a snapshot from a loop state and branch info.
    pub fn capture(
        state: &AgentLoopState,
        branches: BTreeMap<String, String>,
        active_branch: Option<String>,
        display_name: Option<String>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            messages: state.messages.clone(),
            loop_state: LoopStateRepr {
                iteration: state.iteration,
                max_iteration_limit: state.max_iteration_limit,
                completed_calls: state.completed_calls.clone(),
                expanded_containers: state.expanded_containers.clone(),
                middleware_states: state.middleware_states.clone(),
                is_terminated: state.is_terminated,
                termination_reason: state.termination_reason,
                usage_total: state.usage_total.clone(),
            },
            branches,
            active_branch,
            display_name,
            extra: BTreeMap::new(),
        }
    }

    /// Rehydrates the loop state (messages stitched back in).
    pub fn state(&self) -> AgentLoopState {
        AgentLoopState {
            messages: self.messages.clone(),
            iteration: self.loop_state.iteration,
            max_iteration_limit: self.loop_state.max_iteration_limit,
            completed_calls: self.loop_state.completed_calls.clone(),
            expanded_containers: self.loop_state.expanded_containers.clone(),
            middleware_states: self.loop_state.middleware_states.clone(),
            is_terminated: self.loop_state.is_terminated,
            termination_reason: self.loop_state.termination_reason,
            usage_total: self.loop_state.usage_total.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CheckpointError> {
        serde_json::to_vec(self).map_err(|e| CheckpointError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        serde_json::from_slice(bytes).map_err(|e| CheckpointError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ChatMessage;

    fn state() -> AgentLoopState {
        AgentLoopState::new(
            vec![ChatMessage::system("sys"), ChatMessage::user("hi")],
            10,
        )
        .with_completed_call("c1")
        .with_expanded_container("math")
    }

    /// **Scenario**: restore(save(S, M)) == (S, M) (property 3).
    #[test]
    fn snapshot_round_trip_preserves_state() {
        let s = state();
        let snap = ThreadSnapshot::capture(&s, BTreeMap::new(), None, Some("demo".into()));
        let bytes = snap.to_bytes().unwrap();
        let back = ThreadSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(back.state(), s);
        assert_eq!(back.display_name.as_deref(), Some("demo"));
        assert_eq!(back.schema_version, SCHEMA_VERSION);
    }

    /// **Scenario**: unknown top-level fields survive a read/write cycle.
    #[test]
    fn unknown_fields_preserved_on_write_back() {
        let snap = ThreadSnapshot::capture(&state(), BTreeMap::new(), None, None);
        let mut value = serde_json::to_value(&snap).unwrap();
        value["future_field"] = serde_json::json!({"x": 1});
        let reread: ThreadSnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(
            reread.extra.get("future_field"),
            Some(&serde_json::json!({"x": 1}))
        );
        let rewritten = serde_json::to_value(&reread).unwrap();
        assert_eq!(rewritten["future_field"], serde_json::json!({"x": 1}));
    }

    #[test]
    fn missing_fields_default_on_read() {
        let minimal = serde_json::json!({
            "schema_version": 1,
            "messages": [],
            "loop_state": {"max_iteration_limit": 5}
        });
        let snap: ThreadSnapshot = serde_json::from_value(minimal).unwrap();
        let s = snap.state();
        assert_eq!(s.iteration, 0);
        assert_eq!(s.max_iteration_limit, 5);
        assert!(!s.is_terminated);
    }

    #[test]
    fn commit_schedule_ordering() {
        assert!(CommitSchedule::PerIteration > CommitSchedule::PerTurn);
        assert!(CommitSchedule::FullHistory > CommitSchedule::PerIteration);
        assert!(CommitSchedule::Never < CommitSchedule::PerTurn);
    }

    #[test]
    fn source_round_trips_through_strings() {
        for source in [
            CheckpointSource::Root,
            CheckpointSource::Turn,
            CheckpointSource::Iteration,
            CheckpointSource::Fork,
            CheckpointSource::Copy,
            CheckpointSource::Manual,
        ] {
            assert_eq!(CheckpointSource::parse(source.as_str()), source);
        }
    }
}
