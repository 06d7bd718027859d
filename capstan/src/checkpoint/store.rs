//! Checkpoint store contract.
//!
//! Byte-oriented: the store persists manifest entries and opaque snapshot
//! payloads keyed by `(thread_id, checkpoint_id)`, plus pending writes keyed
//! by `(thread_id, iteration, call_id)`. Single-writer-per-thread-id is
//! sufficient; implementations must be internally thread-safe.

use async_trait::async_trait;

use super::{ManifestEntry, PendingWrite};

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("serialization: {0}")]
    Serialization(String),
    #[error("storage: {0}")]
    Storage(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Mutation applied to one manifest entry under the store's lock.
pub type ManifestMutator = Box<dyn FnOnce(&mut ManifestEntry) + Send>;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Appends a manifest entry and stores the snapshot bytes under its id.
    /// Returns the entry with its append index (`seq`) assigned.
    async fn save_at(
        &self,
        thread_id: &str,
        entry: ManifestEntry,
        state_bytes: Vec<u8>,
    ) -> Result<ManifestEntry, CheckpointError>;

    /// Loads a checkpoint by id, or the head (latest appended) when `None`.
    async fn load(
        &self,
        thread_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<(ManifestEntry, Vec<u8>)>, CheckpointError>;

    /// Lists manifest entries in append order. `before` excludes the given id
    /// and everything after it; `limit` keeps the most recent entries.
    async fn manifest(
        &self,
        thread_id: &str,
        limit: Option<usize>,
        before: Option<&str>,
    ) -> Result<Vec<ManifestEntry>, CheckpointError>;

    /// Applies a mutation to one manifest entry (e.g. unbranching).
    async fn update_manifest_entry(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        mutator: ManifestMutator,
    ) -> Result<(), CheckpointError>;

    /// Deletes checkpoints (manifest entries and payloads).
    async fn delete(
        &self,
        thread_id: &str,
        checkpoint_ids: &[String],
    ) -> Result<(), CheckpointError>;

    async fn put_pending_write(&self, write: &PendingWrite) -> Result<(), CheckpointError>;

    /// Pending writes for one iteration, in insertion order.
    async fn pending_writes(
        &self,
        thread_id: &str,
        iteration: u32,
    ) -> Result<Vec<PendingWrite>, CheckpointError>;

    /// Drops all pending writes of a thread (turn completion or rollback).
    async fn delete_pending_writes(&self, thread_id: &str) -> Result<(), CheckpointError>;
}
