//! In-memory checkpoint store. Not persistent; for dev and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::store::{CheckpointError, CheckpointStore, ManifestMutator};
use super::{ManifestEntry, PendingWrite};

#[derive(Default)]
struct ThreadRecord {
    manifest: Vec<ManifestEntry>,
    blobs: HashMap<String, Vec<u8>>,
    pending: Vec<PendingWrite>,
    next_seq: u64,
}

/// In-memory store keyed by thread id.
///
/// **Interaction**: used as `Arc<dyn CheckpointStore>` by the engine builder;
/// the default store when none is configured but checkpointing is requested.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    inner: Arc<RwLock<HashMap<String, ThreadRecord>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save_at(
        &self,
        thread_id: &str,
        mut entry: ManifestEntry,
        state_bytes: Vec<u8>,
    ) -> Result<ManifestEntry, CheckpointError> {
        let mut guard = self.inner.write().await;
        let record = guard.entry(thread_id.to_string()).or_default();
        entry.seq = record.next_seq;
        record.next_seq += 1;
        record
            .blobs
            .insert(entry.checkpoint_id.clone(), state_bytes);
        record.manifest.push(entry.clone());
        Ok(entry)
    }

    async fn load(
        &self,
        thread_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<(ManifestEntry, Vec<u8>)>, CheckpointError> {
        let guard = self.inner.read().await;
        let record = match guard.get(thread_id) {
            Some(r) => r,
            None => return Ok(None),
        };
        let entry = match checkpoint_id {
            Some(id) => record.manifest.iter().find(|e| e.checkpoint_id == id),
            None => record.manifest.last(),
        };
        Ok(entry.and_then(|e| {
            record
                .blobs
                .get(&e.checkpoint_id)
                .map(|b| (e.clone(), b.clone()))
        }))
    }

    async fn manifest(
        &self,
        thread_id: &str,
        limit: Option<usize>,
        before: Option<&str>,
    ) -> Result<Vec<ManifestEntry>, CheckpointError> {
        let guard = self.inner.read().await;
        let mut entries = match guard.get(thread_id) {
            Some(r) => r.manifest.clone(),
            None => return Ok(Vec::new()),
        };
        if let Some(b) = before {
            if let Some(pos) = entries.iter().position(|e| e.checkpoint_id == b) {
                entries.truncate(pos);
            }
        }
        if let Some(n) = limit {
            let len = entries.len();
            if len > n {
                entries = entries.split_off(len - n);
            }
        }
        Ok(entries)
    }

    async fn update_manifest_entry(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        mutator: ManifestMutator,
    ) -> Result<(), CheckpointError> {
        let mut guard = self.inner.write().await;
        let record = guard
            .get_mut(thread_id)
            .ok_or_else(|| CheckpointError::NotFound(thread_id.to_string()))?;
        let entry = record
            .manifest
            .iter_mut()
            .find(|e| e.checkpoint_id == checkpoint_id)
            .ok_or_else(|| CheckpointError::NotFound(checkpoint_id.to_string()))?;
        mutator(entry);
        Ok(())
    }

    async fn delete(
        &self,
        thread_id: &str,
        checkpoint_ids: &[String],
    ) -> Result<(), CheckpointError> {
        let mut guard = self.inner.write().await;
        if let Some(record) = guard.get_mut(thread_id) {
            record
                .manifest
                .retain(|e| !checkpoint_ids.contains(&e.checkpoint_id));
            for id in checkpoint_ids {
                record.blobs.remove(id);
            }
        }
        Ok(())
    }

    async fn put_pending_write(&self, write: &PendingWrite) -> Result<(), CheckpointError> {
        let mut guard = self.inner.write().await;
        let record = guard.entry(write.thread_id.clone()).or_default();
        record.pending.retain(|w| {
            !(w.iteration == write.iteration && w.call_id == write.call_id)
        });
        record.pending.push(write.clone());
        Ok(())
    }

    async fn pending_writes(
        &self,
        thread_id: &str,
        iteration: u32,
    ) -> Result<Vec<PendingWrite>, CheckpointError> {
        let guard = self.inner.read().await;
        Ok(guard
            .get(thread_id)
            .map(|r| {
                r.pending
                    .iter()
                    .filter(|w| w.iteration == iteration)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_pending_writes(&self, thread_id: &str) -> Result<(), CheckpointError> {
        let mut guard = self.inner.write().await;
        if let Some(record) = guard.get_mut(thread_id) {
            record.pending.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{ordered_id, CheckpointSource};
    use crate::message::ToolResult;
    use serde_json::json;

    fn entry(id: &str) -> ManifestEntry {
        ManifestEntry {
            checkpoint_id: id.to_string(),
            parent_id: None,
            branch: None,
            source: CheckpointSource::Turn,
            step: 0,
            message_index: 0,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            seq: 0,
            parent_thread_id: None,
            parent_checkpoint_id: None,
        }
    }

    #[tokio::test]
    async fn save_and_load_head() {
        let store = MemoryCheckpointStore::new();
        store.save_at("t", entry("a"), b"one".to_vec()).await.unwrap();
        store.save_at("t", entry("b"), b"two".to_vec()).await.unwrap();

        let (head, bytes) = store.load("t", None).await.unwrap().unwrap();
        assert_eq!(head.checkpoint_id, "b");
        assert_eq!(bytes, b"two");

        let (by_id, bytes) = store.load("t", Some("a")).await.unwrap().unwrap();
        assert_eq!(by_id.checkpoint_id, "a");
        assert_eq!(bytes, b"one");
    }

    /// **Scenario**: seq is a per-thread append index.
    #[tokio::test]
    async fn seq_assigned_in_append_order() {
        let store = MemoryCheckpointStore::new();
        let a = store.save_at("t", entry("a"), vec![]).await.unwrap();
        let b = store.save_at("t", entry("b"), vec![]).await.unwrap();
        assert_eq!(a.seq, 0);
        assert_eq!(b.seq, 1);
    }

    #[tokio::test]
    async fn manifest_before_and_limit() {
        let store = MemoryCheckpointStore::new();
        for id in ["a", "b", "c", "d"] {
            store.save_at("t", entry(id), vec![]).await.unwrap();
        }
        let entries = store.manifest("t", None, Some("c")).await.unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.checkpoint_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let entries = store.manifest("t", Some(2), None).await.unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.checkpoint_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn update_and_delete_entries() {
        let store = MemoryCheckpointStore::new();
        store.save_at("t", entry("a"), vec![]).await.unwrap();
        store
            .update_manifest_entry("t", "a", Box::new(|e| e.branch = Some("alt".into())))
            .await
            .unwrap();
        let entries = store.manifest("t", None, None).await.unwrap();
        assert_eq!(entries[0].branch.as_deref(), Some("alt"));

        store.delete("t", &["a".to_string()]).await.unwrap();
        assert!(store.load("t", Some("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_write_lifecycle() {
        let store = MemoryCheckpointStore::new();
        let write = PendingWrite {
            thread_id: "t".to_string(),
            iteration: 2,
            call_id: "c1".to_string(),
            result: ToolResult::value("c1", "add", json!(5)),
        };
        store.put_pending_write(&write).await.unwrap();
        // Upsert by (iteration, call_id).
        store.put_pending_write(&write).await.unwrap();

        assert_eq!(store.pending_writes("t", 2).await.unwrap().len(), 1);
        assert!(store.pending_writes("t", 1).await.unwrap().is_empty());

        store.delete_pending_writes("t").await.unwrap();
        assert!(store.pending_writes("t", 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ordered_ids_fit_manifest_ordering() {
        let store = MemoryCheckpointStore::new();
        let first = ordered_id();
        store.save_at("t", entry(&first), vec![]).await.unwrap();
        let second = ordered_id();
        store.save_at("t", entry(&second), vec![]).await.unwrap();
        let entries = store.manifest("t", None, None).await.unwrap();
        assert_eq!(entries[0].checkpoint_id, first);
        assert_eq!(entries[1].checkpoint_id, second);
    }
}
