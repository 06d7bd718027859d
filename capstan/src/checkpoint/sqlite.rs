//! SQLite-backed checkpoint store. Persistent across process restarts.
//!
//! Three tables: `manifest` (the DAG), `checkpoints` (snapshot payloads), and
//! `pending_writes`. All I/O runs under `spawn_blocking` with a connection
//! per operation; for single-node and dev use.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::params;

use super::store::{CheckpointError, CheckpointStore, ManifestMutator};
use super::{CheckpointSource, ManifestEntry, PendingWrite};

pub struct SqliteCheckpointStore {
    db_path: std::path::PathBuf,
}

fn storage_err(e: impl std::fmt::Display) -> CheckpointError {
    CheckpointError::Storage(e.to_string())
}

type ManifestRow = (
    String,
    Option<String>,
    Option<String>,
    String,
    i64,
    i64,
    String,
    i64,
    Option<String>,
    Option<String>,
);

fn row_to_entry(row: ManifestRow) -> ManifestEntry {
    let (
        checkpoint_id,
        parent_id,
        branch,
        source,
        step,
        message_index,
        created_at,
        seq,
        parent_thread_id,
        parent_checkpoint_id,
    ) = row;
    ManifestEntry {
        checkpoint_id,
        parent_id,
        branch,
        source: CheckpointSource::parse(&source),
        step,
        message_index: message_index.max(0) as usize,
        created_at,
        seq: seq.max(0) as u64,
        parent_thread_id,
        parent_checkpoint_id,
    }
}

const SELECT_ENTRY: &str = "checkpoint_id, parent_id, branch, source, step, message_index, \
                            created_at, seq, parent_thread_id, parent_checkpoint_id";

impl SqliteCheckpointStore {
    /// Opens (creating if needed) the database and ensures the tables exist.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS manifest (
                thread_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                checkpoint_id TEXT NOT NULL,
                parent_id TEXT,
                branch TEXT,
                source TEXT NOT NULL,
                step INTEGER NOT NULL,
                message_index INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                parent_thread_id TEXT,
                parent_checkpoint_id TEXT,
                PRIMARY KEY (thread_id, checkpoint_id)
            );
            CREATE TABLE IF NOT EXISTS checkpoints (
                thread_id TEXT NOT NULL,
                checkpoint_id TEXT NOT NULL,
                payload BLOB NOT NULL,
                PRIMARY KEY (thread_id, checkpoint_id)
            );
            CREATE TABLE IF NOT EXISTS pending_writes (
                thread_id TEXT NOT NULL,
                iteration INTEGER NOT NULL,
                call_id TEXT NOT NULL,
                payload BLOB NOT NULL,
                PRIMARY KEY (thread_id, iteration, call_id)
            );
            "#,
        )
        .map_err(storage_err)?;
        Ok(Self { db_path })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save_at(
        &self,
        thread_id: &str,
        mut entry: ManifestEntry,
        state_bytes: Vec<u8>,
    ) -> Result<ManifestEntry, CheckpointError> {
        let db_path = self.db_path.clone();
        let thread_id = thread_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            let seq: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(seq) + 1, 0) FROM manifest WHERE thread_id = ?1",
                    params![thread_id],
                    |row| row.get(0),
                )
                .map_err(storage_err)?;
            entry.seq = seq.max(0) as u64;
            conn.execute(
                r#"
                INSERT OR REPLACE INTO manifest
                (thread_id, seq, checkpoint_id, parent_id, branch, source, step,
                 message_index, created_at, parent_thread_id, parent_checkpoint_id)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
                params![
                    thread_id,
                    seq,
                    entry.checkpoint_id,
                    entry.parent_id,
                    entry.branch,
                    entry.source.as_str(),
                    entry.step,
                    entry.message_index as i64,
                    entry.created_at,
                    entry.parent_thread_id,
                    entry.parent_checkpoint_id,
                ],
            )
            .map_err(storage_err)?;
            conn.execute(
                "INSERT OR REPLACE INTO checkpoints (thread_id, checkpoint_id, payload) \
                 VALUES (?1, ?2, ?3)",
                params![thread_id, entry.checkpoint_id, state_bytes],
            )
            .map_err(storage_err)?;
            Ok::<ManifestEntry, CheckpointError>(entry)
        })
        .await
        .map_err(storage_err)?
    }

    async fn load(
        &self,
        thread_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<(ManifestEntry, Vec<u8>)>, CheckpointError> {
        let db_path = self.db_path.clone();
        let thread_id = thread_id.to_string();
        let want_id = checkpoint_id.map(String::from);
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            let sql = if want_id.is_some() {
                format!(
                    "SELECT {SELECT_ENTRY} FROM manifest \
                     WHERE thread_id = ?1 AND checkpoint_id = ?2"
                )
            } else {
                format!(
                    "SELECT {SELECT_ENTRY} FROM manifest \
                     WHERE thread_id = ?1 ORDER BY seq DESC LIMIT 1"
                )
            };
            let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
            let read_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<ManifestRow> {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                ))
            };
            let row = if let Some(ref id) = want_id {
                stmt.query_row(params![thread_id, id], read_row)
            } else {
                stmt.query_row(params![thread_id], read_row)
            };
            let row = match row {
                Ok(r) => r,
                Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
                Err(e) => return Err(storage_err(e)),
            };
            let entry = row_to_entry(row);
            let payload: Vec<u8> = conn
                .query_row(
                    "SELECT payload FROM checkpoints WHERE thread_id = ?1 AND checkpoint_id = ?2",
                    params![thread_id, entry.checkpoint_id],
                    |row| row.get(0),
                )
                .map_err(storage_err)?;
            Ok(Some((entry, payload)))
        })
        .await
        .map_err(storage_err)?
    }

    async fn manifest(
        &self,
        thread_id: &str,
        limit: Option<usize>,
        before: Option<&str>,
    ) -> Result<Vec<ManifestEntry>, CheckpointError> {
        let db_path = self.db_path.clone();
        let thread_id = thread_id.to_string();
        let before = before.map(String::from);
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            let sql = format!(
                "SELECT {SELECT_ENTRY} FROM manifest WHERE thread_id = ?1 ORDER BY seq ASC"
            );
            let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
            let rows = stmt
                .query_map(params![thread_id], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                    ))
                })
                .map_err(storage_err)?;
            let mut entries: Vec<ManifestEntry> = rows
                .collect::<Result<Vec<ManifestRow>, _>>()
                .map_err(storage_err)?
                .into_iter()
                .map(row_to_entry)
                .collect();
            if let Some(b) = &before {
                if let Some(pos) = entries.iter().position(|e| &e.checkpoint_id == b) {
                    entries.truncate(pos);
                }
            }
            if let Some(n) = limit {
                let len = entries.len();
                if len > n {
                    entries = entries.split_off(len - n);
                }
            }
            Ok::<Vec<ManifestEntry>, CheckpointError>(entries)
        })
        .await
        .map_err(storage_err)?
    }

    async fn update_manifest_entry(
        &self,
        thread_id: &str,
        checkpoint_id: &str,
        mutator: ManifestMutator,
    ) -> Result<(), CheckpointError> {
        let db_path = self.db_path.clone();
        let thread_id = thread_id.to_string();
        let checkpoint_id = checkpoint_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            let sql = format!(
                "SELECT {SELECT_ENTRY} FROM manifest \
                 WHERE thread_id = ?1 AND checkpoint_id = ?2"
            );
            let row: ManifestRow = conn
                .query_row(&sql, params![thread_id, checkpoint_id], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                    ))
                })
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        CheckpointError::NotFound(checkpoint_id.clone())
                    }
                    other => storage_err(other),
                })?;
            let mut entry = row_to_entry(row);
            mutator(&mut entry);
            conn.execute(
                r#"
                UPDATE manifest SET parent_id = ?3, branch = ?4, source = ?5, step = ?6,
                    message_index = ?7, created_at = ?8, parent_thread_id = ?9,
                    parent_checkpoint_id = ?10
                WHERE thread_id = ?1 AND checkpoint_id = ?2
                "#,
                params![
                    thread_id,
                    checkpoint_id,
                    entry.parent_id,
                    entry.branch,
                    entry.source.as_str(),
                    entry.step,
                    entry.message_index as i64,
                    entry.created_at,
                    entry.parent_thread_id,
                    entry.parent_checkpoint_id,
                ],
            )
            .map_err(storage_err)?;
            Ok::<(), CheckpointError>(())
        })
        .await
        .map_err(storage_err)?
    }

    async fn delete(
        &self,
        thread_id: &str,
        checkpoint_ids: &[String],
    ) -> Result<(), CheckpointError> {
        let db_path = self.db_path.clone();
        let thread_id = thread_id.to_string();
        let ids = checkpoint_ids.to_vec();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            for id in &ids {
                conn.execute(
                    "DELETE FROM manifest WHERE thread_id = ?1 AND checkpoint_id = ?2",
                    params![thread_id, id],
                )
                .map_err(storage_err)?;
                conn.execute(
                    "DELETE FROM checkpoints WHERE thread_id = ?1 AND checkpoint_id = ?2",
                    params![thread_id, id],
                )
                .map_err(storage_err)?;
            }
            Ok::<(), CheckpointError>(())
        })
        .await
        .map_err(storage_err)?
    }

    async fn put_pending_write(&self, write: &PendingWrite) -> Result<(), CheckpointError> {
        let db_path = self.db_path.clone();
        let payload = serde_json::to_vec(&write.result)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        let write = write.clone();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            conn.execute(
                "INSERT OR REPLACE INTO pending_writes (thread_id, iteration, call_id, payload) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![write.thread_id, write.iteration as i64, write.call_id, payload],
            )
            .map_err(storage_err)?;
            Ok::<(), CheckpointError>(())
        })
        .await
        .map_err(storage_err)?
    }

    async fn pending_writes(
        &self,
        thread_id: &str,
        iteration: u32,
    ) -> Result<Vec<PendingWrite>, CheckpointError> {
        let db_path = self.db_path.clone();
        let thread_id = thread_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT call_id, payload FROM pending_writes \
                     WHERE thread_id = ?1 AND iteration = ?2 ORDER BY rowid ASC",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(params![thread_id, iteration as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
                })
                .map_err(storage_err)?;
            let mut writes = Vec::new();
            for row in rows {
                let (call_id, payload) = row.map_err(storage_err)?;
                let result = serde_json::from_slice(&payload)
                    .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
                writes.push(PendingWrite {
                    thread_id: thread_id.clone(),
                    iteration,
                    call_id,
                    result,
                });
            }
            Ok::<Vec<PendingWrite>, CheckpointError>(writes)
        })
        .await
        .map_err(storage_err)?
    }

    async fn delete_pending_writes(&self, thread_id: &str) -> Result<(), CheckpointError> {
        let db_path = self.db_path.clone();
        let thread_id = thread_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(storage_err)?;
            conn.execute(
                "DELETE FROM pending_writes WHERE thread_id = ?1",
                params![thread_id],
            )
            .map_err(storage_err)?;
            Ok::<(), CheckpointError>(())
        })
        .await
        .map_err(storage_err)?
    }
}
