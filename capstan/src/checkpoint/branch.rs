//! Branch engine: commit, fork, copy, switch, delete, rename, prune.
//!
//! Operates on a [`ThreadHead`] (the in-memory tip of one thread) and any
//! [`CheckpointStore`]. Order of operations is fixed: a checkpoint is
//! committed first, and only then are branch labels published on the head, so
//! no observable branch ever points at an uncommitted checkpoint.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use super::store::{CheckpointError, CheckpointStore};
use super::{ordered_id, CheckpointSource, ManifestEntry, ThreadSnapshot};
use crate::state::AgentLoopState;

/// Default branch label created the first time a thread forks.
pub const DEFAULT_BRANCH: &str = "main";

/// In-memory tip of one conversation thread.
#[derive(Debug, Clone)]
pub struct ThreadHead {
    pub thread_id: String,
    pub state: AgentLoopState,
    /// Branch label → head checkpoint id.
    pub branches: BTreeMap<String, String>,
    pub active_branch: Option<String>,
    /// Checkpoint the current state descends from.
    pub current_checkpoint: Option<String>,
    pub display_name: Option<String>,
}

impl ThreadHead {
    pub fn new(thread_id: impl Into<String>, state: AgentLoopState) -> Self {
        Self {
            thread_id: thread_id.into(),
            state,
            branches: BTreeMap::new(),
            active_branch: None,
            current_checkpoint: None,
            display_name: None,
        }
    }

    pub fn snapshot(&self) -> ThreadSnapshot {
        ThreadSnapshot::capture(
            &self.state,
            self.branches.clone(),
            self.active_branch.clone(),
            self.display_name.clone(),
        )
    }

    /// Rebuilds a head from a stored snapshot.
    pub fn from_snapshot(
        thread_id: impl Into<String>,
        snapshot: &ThreadSnapshot,
        checkpoint_id: Option<String>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            state: snapshot.state(),
            branches: snapshot.branches.clone(),
            active_branch: snapshot.active_branch.clone(),
            current_checkpoint: checkpoint_id,
            display_name: snapshot.display_name.clone(),
        }
    }
}

pub struct BranchEngine {
    store: Arc<dyn CheckpointStore>,
}

impl BranchEngine {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    fn entry_for(
        head: &ThreadHead,
        checkpoint_id: String,
        source: CheckpointSource,
        step: i64,
        parent_id: Option<String>,
    ) -> ManifestEntry {
        ManifestEntry {
            checkpoint_id,
            parent_id,
            branch: head.active_branch.clone(),
            source,
            step,
            message_index: head.state.messages.len(),
            created_at: chrono::Utc::now().to_rfc3339(),
            seq: 0,
            parent_thread_id: None,
            parent_checkpoint_id: None,
        }
    }

    /// Commits the head's current state; the caller advances
    /// `head.current_checkpoint` to the returned entry's id.
    pub async fn commit(
        &self,
        head: &ThreadHead,
        source: CheckpointSource,
        step: i64,
    ) -> Result<ManifestEntry, CheckpointError> {
        let id = ordered_id();
        let entry = Self::entry_for(
            head,
            id,
            source,
            step,
            head.current_checkpoint.clone(),
        );
        let bytes = head.snapshot().to_bytes()?;
        let entry = self.store.save_at(&head.thread_id, entry, bytes).await?;
        debug!(thread = %head.thread_id, checkpoint = %entry.checkpoint_id, source = entry.source.as_str(), "checkpoint committed");
        Ok(entry)
    }

    /// Loads a snapshot (head checkpoint when `checkpoint_id` is `None`).
    pub async fn load_snapshot(
        &self,
        thread_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<(ManifestEntry, ThreadSnapshot)>, CheckpointError> {
        match self.store.load(thread_id, checkpoint_id).await? {
            Some((entry, bytes)) => {
                let snapshot = ThreadSnapshot::from_bytes(&bytes)?;
                Ok(Some((entry, snapshot)))
            }
            None => Ok(None),
        }
    }

    /// Forks a new branch in the same thread from `source_checkpoint_id`.
    ///
    /// The previously-active line keeps its head: its label (or a fresh
    /// `main`) is written to the current tip before the head moves. The new
    /// branch points at a freshly committed `Fork` checkpoint whose parent is
    /// the source.
    pub async fn fork(
        &self,
        head: &mut ThreadHead,
        source_checkpoint_id: &str,
        new_branch: &str,
    ) -> Result<ManifestEntry, CheckpointError> {
        let (source_entry, source_snapshot) = self
            .load_snapshot(&head.thread_id, Some(source_checkpoint_id))
            .await?
            .ok_or_else(|| CheckpointError::NotFound(source_checkpoint_id.to_string()))?;

        let mut branches = head.branches.clone();
        if let Some(tip) = head.current_checkpoint.clone() {
            let previous = head
                .active_branch
                .clone()
                .unwrap_or_else(|| DEFAULT_BRANCH.to_string());
            branches.insert(previous, tip);
        }

        let fork_id = ordered_id();
        branches.insert(new_branch.to_string(), fork_id.clone());

        let forked = ThreadHead {
            thread_id: head.thread_id.clone(),
            state: source_snapshot.state(),
            branches,
            active_branch: Some(new_branch.to_string()),
            current_checkpoint: Some(source_entry.checkpoint_id.clone()),
            display_name: head.display_name.clone(),
        };
        let entry = Self::entry_for(
            &forked,
            fork_id,
            CheckpointSource::Fork,
            source_entry.step,
            Some(source_entry.checkpoint_id.clone()),
        );
        let bytes = forked.snapshot().to_bytes()?;
        let entry = self.store.save_at(&head.thread_id, entry, bytes).await?;

        // Commit succeeded; publish the new line on the head.
        *head = ThreadHead {
            current_checkpoint: Some(entry.checkpoint_id.clone()),
            ..forked
        };
        Ok(entry)
    }

    /// Copies a checkpoint into a brand-new thread, recording lineage.
    pub async fn copy(
        &self,
        source_thread_id: &str,
        source_checkpoint_id: Option<&str>,
        display_name: Option<String>,
    ) -> Result<(ThreadHead, ManifestEntry), CheckpointError> {
        let (source_entry, source_snapshot) = self
            .load_snapshot(source_thread_id, source_checkpoint_id)
            .await?
            .ok_or_else(|| {
                CheckpointError::NotFound(format!(
                    "{source_thread_id}:{}",
                    source_checkpoint_id.unwrap_or("<head>")
                ))
            })?;

        let new_thread_id = Uuid::new_v4().to_string();
        let root_id = ordered_id();
        let mut branches = BTreeMap::new();
        branches.insert(DEFAULT_BRANCH.to_string(), root_id.clone());

        let head = ThreadHead {
            thread_id: new_thread_id,
            state: source_snapshot.state(),
            branches,
            active_branch: Some(DEFAULT_BRANCH.to_string()),
            current_checkpoint: None,
            display_name,
        };
        let mut entry = Self::entry_for(&head, root_id, CheckpointSource::Copy, -1, None);
        entry.parent_thread_id = Some(source_thread_id.to_string());
        entry.parent_checkpoint_id = Some(source_entry.checkpoint_id.clone());
        let bytes = head.snapshot().to_bytes()?;
        let entry = self.store.save_at(&head.thread_id, entry, bytes).await?;

        let head = ThreadHead {
            current_checkpoint: Some(entry.checkpoint_id.clone()),
            ..head
        };
        Ok((head, entry))
    }

    /// Moves the head to the checkpoint a branch label points at.
    pub async fn switch(
        &self,
        head: &mut ThreadHead,
        branch: &str,
    ) -> Result<ManifestEntry, CheckpointError> {
        let target = head
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound(format!("branch {branch}")))?;
        let (entry, snapshot) = self
            .load_snapshot(&head.thread_id, Some(&target))
            .await?
            .ok_or_else(|| CheckpointError::NotFound(target.clone()))?;

        // Keep the full branches map; only the state and the pointers move.
        head.state = snapshot.state();
        head.active_branch = Some(branch.to_string());
        head.current_checkpoint = Some(entry.checkpoint_id.clone());
        Ok(entry)
    }

    /// Renames a branch label on the head and on manifest entries carrying it.
    pub async fn rename_branch(
        &self,
        head: &mut ThreadHead,
        from: &str,
        to: &str,
    ) -> Result<(), CheckpointError> {
        let target = head
            .branches
            .remove(from)
            .ok_or_else(|| CheckpointError::NotFound(format!("branch {from}")))?;
        head.branches.insert(to.to_string(), target);
        if head.active_branch.as_deref() == Some(from) {
            head.active_branch = Some(to.to_string());
        }
        let entries = self.store.manifest(&head.thread_id, None, None).await?;
        for entry in entries.iter().filter(|e| e.branch.as_deref() == Some(from)) {
            let to = to.to_string();
            self.store
                .update_manifest_entry(
                    &head.thread_id,
                    &entry.checkpoint_id,
                    Box::new(move |e| e.branch = Some(to)),
                )
                .await?;
        }
        Ok(())
    }

    /// Removes a branch label; with `prune`, also deletes checkpoints no
    /// longer reachable from any remaining branch head (or the current tip).
    ///
    /// Returns the ids of pruned checkpoints.
    pub async fn delete_branch(
        &self,
        head: &mut ThreadHead,
        branch: &str,
        prune: bool,
    ) -> Result<Vec<String>, CheckpointError> {
        head.branches
            .remove(branch)
            .ok_or_else(|| CheckpointError::NotFound(format!("branch {branch}")))?;
        if head.active_branch.as_deref() == Some(branch) {
            head.active_branch = None;
        }

        let entries = self.store.manifest(&head.thread_id, None, None).await?;
        for entry in entries
            .iter()
            .filter(|e| e.branch.as_deref() == Some(branch))
        {
            self.store
                .update_manifest_entry(
                    &head.thread_id,
                    &entry.checkpoint_id,
                    Box::new(|e| e.branch = None),
                )
                .await?;
        }

        if !prune {
            return Ok(Vec::new());
        }

        let entries = self.store.manifest(&head.thread_id, None, None).await?;
        let by_id: HashMap<&str, &ManifestEntry> = entries
            .iter()
            .map(|e| (e.checkpoint_id.as_str(), e))
            .collect();

        // Mark everything reachable from remaining branch heads, the current
        // tip, and any entry still carrying a branch label.
        let mut roots: Vec<String> = head.branches.values().cloned().collect();
        roots.extend(head.current_checkpoint.clone());
        roots.extend(
            entries
                .iter()
                .filter(|e| e.branch.is_some())
                .map(|e| e.checkpoint_id.clone()),
        );
        let mut reachable: BTreeSet<String> = BTreeSet::new();
        let mut stack = roots;
        while let Some(id) = stack.pop() {
            if !reachable.insert(id.clone()) {
                continue;
            }
            if let Some(entry) = by_id.get(id.as_str()) {
                if let Some(parent) = &entry.parent_id {
                    stack.push(parent.clone());
                }
            }
        }

        let doomed: Vec<String> = entries
            .iter()
            .filter(|e| !reachable.contains(&e.checkpoint_id))
            .map(|e| e.checkpoint_id.clone())
            .collect();
        if !doomed.is_empty() {
            debug!(thread = %head.thread_id, count = doomed.len(), "pruning unreachable checkpoints");
            self.store.delete(&head.thread_id, &doomed).await?;
        }
        Ok(doomed)
    }

    /// Manifest entries snapshotted at a given message-log length: the
    /// sibling variants at that point of the conversation.
    pub async fn list_variants_at(
        &self,
        thread_id: &str,
        message_index: usize,
    ) -> Result<Vec<ManifestEntry>, CheckpointError> {
        let entries = self.store.manifest(thread_id, None, None).await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.message_index == message_index)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::message::ChatMessage;

    fn engine() -> BranchEngine {
        BranchEngine::new(Arc::new(MemoryCheckpointStore::new()))
    }

    fn head(thread: &str) -> ThreadHead {
        ThreadHead::new(
            thread,
            AgentLoopState::new(vec![ChatMessage::system("sys")], 10),
        )
    }

    async fn committed_head(engine: &BranchEngine, thread: &str) -> ThreadHead {
        let mut h = head(thread);
        let entry = engine
            .commit(&h, CheckpointSource::Root, -1)
            .await
            .unwrap();
        h.current_checkpoint = Some(entry.checkpoint_id);
        h
    }

    /// **Scenario**: fork creates `main` for the previously unnamed line and a
    /// new branch at a fresh Fork checkpoint (S5 shape).
    #[tokio::test]
    async fn fork_preserves_previous_line() {
        let engine = engine();
        let mut h = committed_head(&engine, "t").await;
        let root = h.current_checkpoint.clone().unwrap();

        // Two turn commits.
        h.state = h.state.with_message(ChatMessage::user("q"));
        let i0 = engine.commit(&h, CheckpointSource::Iteration, 0).await.unwrap();
        h.current_checkpoint = Some(i0.checkpoint_id.clone());
        h.state = h.state.with_message(ChatMessage::assistant("a"));
        let i1 = engine.commit(&h, CheckpointSource::Iteration, 1).await.unwrap();
        h.current_checkpoint = Some(i1.checkpoint_id.clone());

        let fork_entry = engine.fork(&mut h, &i0.checkpoint_id, "alt").await.unwrap();
        assert_eq!(h.active_branch.as_deref(), Some("alt"));
        assert_eq!(h.branches.get("main"), Some(&i1.checkpoint_id));
        assert_eq!(h.branches.get("alt"), Some(&fork_entry.checkpoint_id));
        assert_eq!(fork_entry.parent_id.as_deref(), Some(i0.checkpoint_id.as_str()));
        assert_eq!(fork_entry.source, CheckpointSource::Fork);
        // Forked state is the source's, not the tip's.
        assert_eq!(h.state.messages.len(), 2);
        let _ = root;
    }

    /// **Scenario**: switch moves state between branch heads and keeps the map.
    #[tokio::test]
    async fn switch_between_branches() {
        let engine = engine();
        let mut h = committed_head(&engine, "t").await;
        h.state = h.state.with_message(ChatMessage::user("q"));
        let i0 = engine.commit(&h, CheckpointSource::Iteration, 0).await.unwrap();
        h.current_checkpoint = Some(i0.checkpoint_id.clone());
        h.state = h.state.with_message(ChatMessage::assistant("a"));
        let i1 = engine.commit(&h, CheckpointSource::Iteration, 1).await.unwrap();
        h.current_checkpoint = Some(i1.checkpoint_id.clone());

        engine.fork(&mut h, &i0.checkpoint_id, "alt").await.unwrap();
        assert_eq!(h.state.messages.len(), 2);

        engine.switch(&mut h, "main").await.unwrap();
        assert_eq!(h.state.messages.len(), 3);
        assert_eq!(h.active_branch.as_deref(), Some("main"));
        assert!(h.branches.contains_key("alt"));

        engine.switch(&mut h, "alt").await.unwrap();
        assert_eq!(h.state.messages.len(), 2);
    }

    /// **Scenario**: fork isolation; work on the new branch never moves the
    /// other branch's head (property 8).
    #[tokio::test]
    async fn fork_isolation() {
        let engine = engine();
        let mut h = committed_head(&engine, "t").await;
        let base = engine.commit(&h, CheckpointSource::Turn, 0).await.unwrap();
        h.current_checkpoint = Some(base.checkpoint_id.clone());

        engine.fork(&mut h, &base.checkpoint_id, "alt").await.unwrap();
        let main_head_before = h.branches.get("main").cloned();

        // Writes on alt.
        h.state = h.state.with_message(ChatMessage::user("on alt"));
        let alt_tip = engine.commit(&h, CheckpointSource::Turn, 1).await.unwrap();
        h.current_checkpoint = Some(alt_tip.checkpoint_id.clone());
        h.branches.insert("alt".into(), alt_tip.checkpoint_id.clone());

        assert_eq!(h.branches.get("main").cloned(), main_head_before);
    }

    /// **Scenario**: delete+prune removes orphaned checkpoints but never a
    /// labeled or reachable one.
    #[tokio::test]
    async fn delete_branch_with_prune() {
        let engine = engine();
        let mut h = committed_head(&engine, "t").await;
        let base = engine.commit(&h, CheckpointSource::Turn, 0).await.unwrap();
        h.current_checkpoint = Some(base.checkpoint_id.clone());

        engine.fork(&mut h, &base.checkpoint_id, "alt").await.unwrap();
        // Extend alt by one checkpoint, then go back to main.
        h.state = h.state.with_message(ChatMessage::user("alt work"));
        let alt_tip = engine.commit(&h, CheckpointSource::Turn, 1).await.unwrap();
        h.current_checkpoint = Some(alt_tip.checkpoint_id.clone());
        h.branches.insert("alt".into(), alt_tip.checkpoint_id.clone());
        engine.switch(&mut h, "main").await.unwrap();

        let pruned = engine.delete_branch(&mut h, "alt", true).await.unwrap();
        assert!(!h.branches.contains_key("alt"));
        assert!(!pruned.is_empty());
        // Main's line survives.
        assert!(engine
            .load_snapshot("t", Some(&base.checkpoint_id))
            .await
            .unwrap()
            .is_some());
        // Alt's tip is gone.
        assert!(engine
            .load_snapshot("t", Some(&alt_tip.checkpoint_id))
            .await
            .unwrap()
            .is_none());
    }

    /// **Scenario**: copy starts a new thread whose root records lineage.
    #[tokio::test]
    async fn copy_records_lineage() {
        let engine = engine();
        let mut h = committed_head(&engine, "t").await;
        h.state = h.state.with_message(ChatMessage::user("q"));
        let tip = engine.commit(&h, CheckpointSource::Turn, 0).await.unwrap();
        h.current_checkpoint = Some(tip.checkpoint_id.clone());

        let (copied, root) = engine
            .copy("t", Some(&tip.checkpoint_id), Some("experiment".into()))
            .await
            .unwrap();
        assert_ne!(copied.thread_id, "t");
        assert_eq!(root.source, CheckpointSource::Copy);
        assert_eq!(root.parent_thread_id.as_deref(), Some("t"));
        assert_eq!(
            root.parent_checkpoint_id.as_deref(),
            Some(tip.checkpoint_id.as_str())
        );
        assert_eq!(copied.state.messages.len(), 2);
        assert_eq!(copied.display_name.as_deref(), Some("experiment"));
        assert_eq!(copied.active_branch.as_deref(), Some(DEFAULT_BRANCH));
    }

    #[tokio::test]
    async fn rename_branch_updates_labels() {
        let engine = engine();
        let mut h = committed_head(&engine, "t").await;
        let base = engine.commit(&h, CheckpointSource::Turn, 0).await.unwrap();
        h.current_checkpoint = Some(base.checkpoint_id.clone());
        engine.fork(&mut h, &base.checkpoint_id, "alt").await.unwrap();

        engine.rename_branch(&mut h, "alt", "feature").await.unwrap();
        assert!(h.branches.contains_key("feature"));
        assert!(!h.branches.contains_key("alt"));
        assert_eq!(h.active_branch.as_deref(), Some("feature"));

        let entries = engine.store().manifest("t", None, None).await.unwrap();
        assert!(entries
            .iter()
            .any(|e| e.branch.as_deref() == Some("feature")));
        assert!(!entries.iter().any(|e| e.branch.as_deref() == Some("alt")));
    }

    #[tokio::test]
    async fn variants_at_message_index() {
        let engine = engine();
        let mut h = committed_head(&engine, "t").await;
        let base = engine.commit(&h, CheckpointSource::Turn, 0).await.unwrap();
        h.current_checkpoint = Some(base.checkpoint_id.clone());
        engine.fork(&mut h, &base.checkpoint_id, "alt").await.unwrap();

        // Root, base, and fork all snapshot one system message.
        let variants = engine.list_variants_at("t", 1).await.unwrap();
        assert_eq!(variants.len(), 3);
    }
}
