//! SQLite-backed checkpoint store: one database file per job.
//!
//! Every state change runs inside a single `BEGIN IMMEDIATE` transaction, so a
//! crash can never leave a half-applied claim and two handles on the same file
//! can never both own a chunk.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql, TransactionBehavior};
use tracing::{debug, info, warn};

use super::plan::{sha256_hex, ChunkSpec};
use crate::error::{Result, ScribeError};

/// Lock wait before a contended transaction gives up with `StoreContention`.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ABANDONED_NOTE: &str = "Chunk abandoned due to interruption";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    status TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS files (
    file_id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
    source_uri TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    total_chunks INTEGER NOT NULL,
    done_chunks INTEGER NOT NULL DEFAULT 0,
    final_output_uri TEXT,
    final_output_sha256 TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chunks (
    chunk_id TEXT PRIMARY KEY,
    file_id TEXT NOT NULL REFERENCES files(file_id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL,
    start_seconds REAL NOT NULL,
    end_seconds REAL NOT NULL,
    plan_hash TEXT NOT NULL,
    status TEXT NOT NULL,
    transcript_uri TEXT,
    transcript_sha256 TEXT,
    last_error TEXT,
    started_at TEXT,
    completed_at TEXT,
    updated_at TEXT NOT NULL,
    UNIQUE (file_id, chunk_index)
);

CREATE INDEX IF NOT EXISTS idx_chunks_status ON chunks(status);
CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_id);
"#;

const CHUNK_COLUMNS: &str = "chunk_id, chunk_index, start_seconds, end_seconds, plan_hash, \
     status, transcript_uri, transcript_sha256, last_error, started_at, completed_at, updated_at";

/// Per-chunk lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkStatus {
    Pending,
    Running,
    Done,
    RetryableFailed,
    PermanentFailed,
    /// Left `running` by a dead process. Written by older stores; claimable.
    Abandoned,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Running => "running",
            ChunkStatus::Done => "done",
            ChunkStatus::RetryableFailed => "retryable_failed",
            ChunkStatus::PermanentFailed => "permanent_failed",
            ChunkStatus::Abandoned => "abandoned",
        }
    }

    /// Whether `claim_next_chunk` may hand this chunk out.
    pub fn is_claimable(&self) -> bool {
        matches!(
            self,
            ChunkStatus::Pending | ChunkStatus::RetryableFailed | ChunkStatus::Abandoned
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChunkStatus::Done | ChunkStatus::PermanentFailed)
    }
}

impl std::fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChunkStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChunkStatus::Pending),
            "running" => Ok(ChunkStatus::Running),
            "done" => Ok(ChunkStatus::Done),
            "retryable_failed" => Ok(ChunkStatus::RetryableFailed),
            "permanent_failed" => Ok(ChunkStatus::PermanentFailed),
            "abandoned" => Ok(ChunkStatus::Abandoned),
            other => Err(format!("Unknown chunk status: {other}")),
        }
    }
}

impl ToSql for ChunkStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for ChunkStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Options controlling how a store is opened.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Reuse a matching file record and its completed chunks.
    pub resume: bool,
    /// Delete any existing store file before opening.
    pub reset: bool,
    /// Remote location the store should be copied to on close.
    pub sync_uri: Option<String>,
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            resume: true,
            reset: false,
            sync_uri: None,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

/// A chunk handed out by [`CheckpointStore::claim_next_chunk`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedChunk {
    pub index: usize,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub plan_hash: String,
}

#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub index: usize,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub plan_hash: String,
    pub status: ChunkStatus,
    pub artifact_uri: Option<String>,
    pub artifact_sha256: Option<String>,
    pub last_error: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
}

impl ChunkRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            chunk_id: row.get(0)?,
            index: row.get(1)?,
            start_seconds: row.get(2)?,
            end_seconds: row.get(3)?,
            plan_hash: row.get(4)?,
            status: row.get(5)?,
            artifact_uri: row.get(6)?,
            artifact_sha256: row.get(7)?,
            last_error: row.get(8)?,
            started_at: row.get(9)?,
            completed_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub file_id: String,
    pub job_id: String,
    pub source_uri: String,
    pub fingerprint: String,
    pub total_chunks: usize,
    pub done_chunks: usize,
    pub final_output_uri: Option<String>,
    pub final_output_sha256: Option<String>,
    pub updated_at: String,
}

/// Outcome of [`CheckpointStore::register_chunks`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registration {
    pub inserted: usize,
    pub existing: usize,
    /// Already-registered chunks whose stored plan hash differs from the new spec.
    pub mismatched: Vec<usize>,
}

/// Chunk counts per status for one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreProgress {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub retryable_failed: usize,
    pub permanent_failed: usize,
}

impl StoreProgress {
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.done == self.total
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn chunk_id(file_id: &str, index: usize) -> String {
    format!("chunk_{file_id}_{index}")
}

/// Remove a database file together with its WAL and shared-memory sidecars.
fn remove_store_files(db_path: &Path) -> Result<()> {
    let mut sidecars = Vec::with_capacity(3);
    sidecars.push(db_path.to_path_buf());
    for suffix in ["-wal", "-shm"] {
        let mut name = db_path.as_os_str().to_owned();
        name.push(suffix);
        sidecars.push(PathBuf::from(name));
    }

    for path in sidecars {
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Durable job/file/chunk bookkeeping for a single source file.
pub struct CheckpointStore {
    conn: Connection,
    db_path: PathBuf,
    job_id: String,
    file_id: String,
    sync_uri: Option<String>,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("db_path", &self.db_path)
            .field("job_id", &self.job_id)
            .field("file_id", &self.file_id)
            .finish()
    }
}

impl CheckpointStore {
    /// Open (creating if absent) the store at `db_path` for one source file.
    ///
    /// A matching `(source_uri, fingerprint)` record is resumed when
    /// `options.resume` is set; any chunk still marked `running` is then
    /// reconciled to `retryable_failed`, since the process that claimed it is
    /// gone. Otherwise the file record starts over with no chunks.
    pub fn open(
        db_path: &Path,
        source_uri: &str,
        fingerprint: &str,
        total_chunks: usize,
        options: &StoreOptions,
    ) -> Result<Self> {
        if options.reset && db_path.exists() {
            info!("Resetting checkpoint store {}", db_path.display());
            remove_store_files(db_path)?;
        }

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.busy_timeout(options.busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")?;
        // First statement that reads the file header; garbage surfaces here.
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            warn!("Checkpoint store running in {} journal mode", mode);
        }
        conn.execute_batch(SCHEMA)?;

        info!("Opened checkpoint store {}", db_path.display());

        let mut store = Self {
            conn,
            db_path: db_path.to_path_buf(),
            job_id: String::new(),
            file_id: String::new(),
            sync_uri: options.sync_uri.clone(),
        };
        store.ensure_file_and_job(source_uri, fingerprint, total_chunks, options.resume)?;
        Ok(store)
    }

    /// Open an existing store for inspection. Issues no DDL and does not
    /// reset or reconcile anything. `None` when there is no store file or no record
    /// for `(source_uri, fingerprint)`.
    pub fn open_existing(
        db_path: &Path,
        source_uri: &str,
        fingerprint: &str,
    ) -> Result<Option<Self>> {
        if !db_path.is_file() {
            return Ok(None);
        }

        let conn = Connection::open(db_path)?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;

        let has_files: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'files')",
            [],
            |row| row.get(0),
        )?;
        if !has_files {
            return Ok(None);
        }

        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT file_id, job_id FROM files WHERE source_uri = ?1 AND fingerprint = ?2",
                params![source_uri, fingerprint],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(existing.map(|(file_id, job_id)| Self {
            conn,
            db_path: db_path.to_path_buf(),
            job_id,
            file_id,
            sync_uri: None,
        }))
    }

    fn ensure_file_and_job(
        &mut self,
        source_uri: &str,
        fingerprint: &str,
        total_chunks: usize,
        resume: bool,
    ) -> Result<()> {
        let ts = now();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT file_id, job_id FROM files WHERE source_uri = ?1 AND fingerprint = ?2",
                params![source_uri, fingerprint],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let (Some((file_id, job_id)), true) = (existing, resume) {
            let reconciled = tx.execute(
                "UPDATE chunks SET status = ?1, last_error = ?2, updated_at = ?3 \
                 WHERE file_id = ?4 AND status = ?5",
                params![
                    ChunkStatus::RetryableFailed,
                    ABANDONED_NOTE,
                    ts,
                    file_id,
                    ChunkStatus::Running
                ],
            )?;
            tx.execute(
                "UPDATE jobs SET status = 'running', updated_at = ?1 WHERE job_id = ?2",
                params![ts, job_id],
            )?;
            tx.commit()?;

            if reconciled > 0 {
                warn!(
                    "Reconciled {} abandoned chunk(s) to {}",
                    reconciled,
                    ChunkStatus::RetryableFailed
                );
            }
            info!("Resuming checkpoint file {}", file_id);
            self.file_id = file_id;
            self.job_id = job_id;
            return Ok(());
        }

        let job_id = format!("job_{}", Utc::now().format("%Y%m%dT%H%M%S%.6fZ"));
        let file_id = format!("file_{}", sha256_hex(source_uri.as_bytes()));

        tx.execute(
            "INSERT INTO jobs (job_id, created_at, status, updated_at) VALUES (?1, ?2, 'running', ?2) \
             ON CONFLICT(job_id) DO UPDATE SET status = 'running', updated_at = excluded.updated_at",
            params![job_id, ts],
        )?;

        // Update in place rather than replace: a replace would cascade-delete
        // through the foreign keys mid-transaction.
        let had_file = tx
            .query_row(
                "SELECT 1 FROM files WHERE file_id = ?1",
                params![file_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        if had_file {
            let cleared = tx.execute("DELETE FROM chunks WHERE file_id = ?1", params![file_id])?;
            tx.execute(
                "UPDATE files SET job_id = ?1, source_uri = ?2, fingerprint = ?3, total_chunks = ?4, \
                 done_chunks = 0, final_output_uri = NULL, final_output_sha256 = NULL, updated_at = ?5 \
                 WHERE file_id = ?6",
                params![job_id, source_uri, fingerprint, total_chunks, ts, file_id],
            )?;
            debug!("Discarded {} chunk record(s) from previous run", cleared);
        } else {
            tx.execute(
                "INSERT INTO files (file_id, job_id, source_uri, fingerprint, total_chunks, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![file_id, job_id, source_uri, fingerprint, total_chunks, ts],
            )?;
        }

        tx.commit()?;
        info!("Initialized checkpoint file {} for job {}", file_id, job_id);
        self.file_id = file_id;
        self.job_id = job_id;
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    /// Change how long a transaction waits for a competing writer.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    /// Insert a `pending` record per spec, leaving existing records untouched.
    pub fn register_chunks(&mut self, specs: &[ChunkSpec]) -> Result<Registration> {
        let ts = now();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut report = Registration::default();

        {
            let mut insert = tx.prepare(
                "INSERT INTO chunks (chunk_id, file_id, chunk_index, start_seconds, end_seconds, \
                 plan_hash, status, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT DO NOTHING",
            )?;
            let mut stored_hash =
                tx.prepare("SELECT plan_hash FROM chunks WHERE chunk_id = ?1")?;

            for spec in specs {
                let id = chunk_id(&self.file_id, spec.index);
                let inserted = insert.execute(params![
                    id,
                    self.file_id,
                    spec.index,
                    spec.start_seconds,
                    spec.end_seconds,
                    spec.plan_hash,
                    ChunkStatus::Pending,
                    ts
                ])?;

                if inserted > 0 {
                    report.inserted += 1;
                    continue;
                }

                report.existing += 1;
                let hash: Option<String> = stored_hash
                    .query_row(params![id], |row| row.get(0))
                    .optional()?;
                if hash.as_deref() != Some(spec.plan_hash.as_str()) {
                    report.mismatched.push(spec.index);
                }
            }
        }

        tx.commit()?;
        debug!(
            "Registered chunks: {} new, {} existing, {} plan mismatches",
            report.inserted,
            report.existing,
            report.mismatched.len()
        );
        Ok(report)
    }

    /// Reset the given chunks to `pending` under their new plan, discarding prior work.
    pub fn replan_chunks(&mut self, specs: &[ChunkSpec]) -> Result<usize> {
        let ts = now();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut changed = 0;

        {
            let mut update = tx.prepare(
                "UPDATE chunks SET start_seconds = ?1, end_seconds = ?2, plan_hash = ?3, status = ?4, \
                 transcript_uri = NULL, transcript_sha256 = NULL, last_error = NULL, \
                 started_at = NULL, completed_at = NULL, updated_at = ?5 WHERE chunk_id = ?6",
            )?;
            for spec in specs {
                changed += update.execute(params![
                    spec.start_seconds,
                    spec.end_seconds,
                    spec.plan_hash,
                    ChunkStatus::Pending,
                    ts,
                    chunk_id(&self.file_id, spec.index)
                ])?;
            }
        }

        tx.execute(
            "UPDATE files SET done_chunks = \
             (SELECT COUNT(*) FROM chunks WHERE file_id = ?1 AND status = ?2), updated_at = ?3 \
             WHERE file_id = ?1",
            params![self.file_id, ChunkStatus::Done, ts],
        )?;
        tx.commit()?;

        info!("Replanned {} chunk(s)", changed);
        Ok(changed)
    }

    /// Atomically move the lowest-index eligible chunk to `running`.
    pub fn claim_next_chunk(&mut self) -> Result<Option<ClaimedChunk>> {
        self.claim_next_chunk_skipping(&BTreeSet::new())
    }

    /// Like [`claim_next_chunk`](Self::claim_next_chunk), but never claims an
    /// index in `skip`.
    pub fn claim_next_chunk_skipping(
        &mut self,
        skip: &BTreeSet<usize>,
    ) -> Result<Option<ClaimedChunk>> {
        let ts = now();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row = {
            let mut stmt = tx.prepare(
                "SELECT chunk_id, chunk_index, start_seconds, end_seconds, plan_hash FROM chunks \
                 WHERE file_id = ?1 AND status IN (?2, ?3, ?4) ORDER BY chunk_index",
            )?;
            let mut rows = stmt.query(params![
                self.file_id,
                ChunkStatus::Pending,
                ChunkStatus::RetryableFailed,
                ChunkStatus::Abandoned
            ])?;
            let mut found = None;
            while let Some(row) = rows.next()? {
                let index: usize = row.get(1)?;
                if skip.contains(&index) {
                    continue;
                }
                found = Some((
                    row.get::<_, String>(0)?,
                    ClaimedChunk {
                        index,
                        start_seconds: row.get(2)?,
                        end_seconds: row.get(3)?,
                        plan_hash: row.get(4)?,
                    },
                ));
                break;
            }
            found
        };

        let Some((id, claimed)) = row else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE chunks SET status = ?1, started_at = ?2, updated_at = ?2 WHERE chunk_id = ?3",
            params![ChunkStatus::Running, ts, id],
        )?;
        tx.commit()?;

        debug!("Claimed chunk {}", claimed.index);
        Ok(Some(claimed))
    }

    /// Record a claimed chunk as `done` and bump the file's completed counter.
    pub fn mark_chunk_done(
        &mut self,
        index: usize,
        artifact_uri: &str,
        artifact_sha256: &str,
    ) -> Result<()> {
        let ts = now();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let updated = tx.execute(
            "UPDATE chunks SET status = ?1, transcript_uri = ?2, transcript_sha256 = ?3, \
             last_error = NULL, completed_at = ?4, updated_at = ?4 \
             WHERE chunk_id = ?5 AND status = ?6",
            params![
                ChunkStatus::Done,
                artifact_uri,
                artifact_sha256,
                ts,
                chunk_id(&self.file_id, index),
                ChunkStatus::Running
            ],
        )?;
        if updated == 0 {
            return Err(ScribeError::ChunkNotClaimed(index));
        }

        tx.execute(
            "UPDATE files SET done_chunks = done_chunks + 1, updated_at = ?1 WHERE file_id = ?2",
            params![ts, self.file_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Record a claimed chunk as failed; `permanent` failures are never re-claimed.
    pub fn mark_chunk_failed(&mut self, index: usize, error: &str, permanent: bool) -> Result<()> {
        let status = if permanent {
            ChunkStatus::PermanentFailed
        } else {
            ChunkStatus::RetryableFailed
        };
        let ts = now();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let updated = tx.execute(
            "UPDATE chunks SET status = ?1, last_error = ?2, updated_at = ?3 \
             WHERE chunk_id = ?4 AND status = ?5",
            params![
                status,
                error,
                ts,
                chunk_id(&self.file_id, index),
                ChunkStatus::Running
            ],
        )?;
        if updated == 0 {
            return Err(ScribeError::ChunkNotClaimed(index));
        }
        tx.commit()?;
        Ok(())
    }

    /// Record where the reassembled transcript went and its hash.
    pub fn persist_final_output(&mut self, uri: &str, sha256: &str) -> Result<()> {
        let ts = now();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE files SET final_output_uri = ?1, final_output_sha256 = ?2, updated_at = ?3 \
             WHERE file_id = ?4",
            params![uri, sha256, ts, self.file_id],
        )?;
        tx.execute(
            "UPDATE jobs SET status = 'completed', updated_at = ?1 WHERE job_id = ?2",
            params![ts, self.job_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn file_record(&self) -> Result<FileRecord> {
        let record = self.conn.query_row(
            "SELECT file_id, job_id, source_uri, fingerprint, total_chunks, done_chunks, \
             final_output_uri, final_output_sha256, updated_at FROM files WHERE file_id = ?1",
            params![self.file_id],
            |row| {
                Ok(FileRecord {
                    file_id: row.get(0)?,
                    job_id: row.get(1)?,
                    source_uri: row.get(2)?,
                    fingerprint: row.get(3)?,
                    total_chunks: row.get(4)?,
                    done_chunks: row.get(5)?,
                    final_output_uri: row.get(6)?,
                    final_output_sha256: row.get(7)?,
                    updated_at: row.get(8)?,
                })
            },
        )?;
        Ok(record)
    }

    pub fn chunk(&self, index: usize) -> Result<Option<ChunkRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE chunk_id = ?1"),
                params![chunk_id(&self.file_id, index)],
                ChunkRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// All chunk records for this file, in index order.
    pub fn chunks(&self) -> Result<Vec<ChunkRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE file_id = ?1 ORDER BY chunk_index"
        ))?;
        let records = stmt
            .query_map(params![self.file_id], ChunkRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn progress(&self) -> Result<StoreProgress> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM chunks WHERE file_id = ?1 GROUP BY status")?;
        let rows = stmt.query_map(params![self.file_id], |row| {
            Ok((row.get::<_, ChunkStatus>(0)?, row.get::<_, usize>(1)?))
        })?;

        let mut progress = StoreProgress::default();
        for row in rows {
            let (status, count) = row?;
            progress.total += count;
            match status {
                ChunkStatus::Pending | ChunkStatus::Abandoned => progress.pending += count,
                ChunkStatus::Running => progress.running += count,
                ChunkStatus::Done => progress.done += count,
                ChunkStatus::RetryableFailed => progress.retryable_failed += count,
                ChunkStatus::PermanentFailed => progress.permanent_failed += count,
            }
        }
        Ok(progress)
    }

    /// Fold the WAL back into the main file and release the connection.
    pub fn close(self) -> Result<()> {
        if let Err(e) = self
            .conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
        {
            warn!("Failed to checkpoint WAL: {}", e);
        }

        let db_path = self.db_path;
        let sync_uri = self.sync_uri;
        self.conn.close().map_err(|(_, e)| ScribeError::from(e))?;
        info!("Checkpoint store closed {}", db_path.display());

        if let Some(uri) = sync_uri {
            // TODO: upload the store file once remote replication is supported.
            info!(
                "Checkpoint store sync to {} requested; remote sync is not implemented",
                uri
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(count: usize) -> Vec<ChunkSpec> {
        (0..count)
            .map(|i| ChunkSpec {
                index: i,
                start_seconds: i as f64,
                end_seconds: (i + 1) as f64,
                plan_hash: format!("plan-{i}"),
            })
            .collect()
    }

    fn open(dir: &Path, options: &StoreOptions) -> CheckpointStore {
        CheckpointStore::open(
            &dir.join("checkpoint.db"),
            "fake://meeting",
            "fake-fingerprint",
            3,
            options,
        )
        .unwrap()
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            ChunkStatus::Pending,
            ChunkStatus::Running,
            ChunkStatus::Done,
            ChunkStatus::RetryableFailed,
            ChunkStatus::PermanentFailed,
            ChunkStatus::Abandoned,
        ] {
            assert_eq!(status.as_str().parse::<ChunkStatus>().unwrap(), status);
        }
        assert!("finished".parse::<ChunkStatus>().is_err());
    }

    #[test]
    fn test_claimable_and_terminal() {
        assert!(ChunkStatus::Pending.is_claimable());
        assert!(ChunkStatus::Abandoned.is_claimable());
        assert!(!ChunkStatus::PermanentFailed.is_claimable());
        assert!(ChunkStatus::Done.is_terminal());
        assert!(!ChunkStatus::RetryableFailed.is_terminal());
    }

    #[test]
    fn test_register_reports_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(dir.path(), &StoreOptions::default());

        let first = store.register_chunks(&specs(3)).unwrap();
        assert_eq!(first.inserted, 3);
        assert_eq!(first.existing, 0);

        let second = store.register_chunks(&specs(3)).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.existing, 3);
        assert!(second.mismatched.is_empty());
    }

    #[test]
    fn test_register_detects_plan_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(dir.path(), &StoreOptions::default());
        store.register_chunks(&specs(3)).unwrap();

        let mut changed = specs(3);
        changed[1].plan_hash = "other".to_string();
        let report = store.register_chunks(&changed).unwrap();
        assert_eq!(report.mismatched, vec![1]);

        // Registration alone never rewrites the stored hash.
        assert_eq!(store.chunk(1).unwrap().unwrap().plan_hash, "plan-1");
    }

    #[test]
    fn test_replan_resets_only_given_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(dir.path(), &StoreOptions::default());
        store.register_chunks(&specs(3)).unwrap();
        for _ in 0..2 {
            let claimed = store.claim_next_chunk().unwrap().unwrap();
            store
                .mark_chunk_done(claimed.index, "uri", "sha")
                .unwrap();
        }
        assert_eq!(store.file_record().unwrap().done_chunks, 2);

        let mut changed = specs(3);
        changed[1].plan_hash = "other".to_string();
        let replanned = store.replan_chunks(&changed[1..2]).unwrap();
        assert_eq!(replanned, 1);

        let record = store.chunk(1).unwrap().unwrap();
        assert_eq!(record.status, ChunkStatus::Pending);
        assert_eq!(record.plan_hash, "other");
        assert!(record.artifact_uri.is_none());
        assert_eq!(store.chunk(0).unwrap().unwrap().status, ChunkStatus::Done);
        assert_eq!(store.file_record().unwrap().done_chunks, 1);
    }

    #[test]
    fn test_done_requires_claim() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(dir.path(), &StoreOptions::default());
        store.register_chunks(&specs(2)).unwrap();

        assert!(matches!(
            store.mark_chunk_done(0, "uri", "sha"),
            Err(ScribeError::ChunkNotClaimed(0))
        ));

        let claimed = store.claim_next_chunk().unwrap().unwrap();
        store.mark_chunk_done(claimed.index, "uri", "sha").unwrap();
        // A second completion must not double-count.
        assert!(store.mark_chunk_done(claimed.index, "uri", "sha").is_err());
        assert_eq!(store.file_record().unwrap().done_chunks, 1);
    }

    #[test]
    fn test_failed_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(dir.path(), &StoreOptions::default());
        store.register_chunks(&specs(2)).unwrap();

        let first = store.claim_next_chunk().unwrap().unwrap();
        store
            .mark_chunk_failed(first.index, "engine timeout", false)
            .unwrap();
        let record = store.chunk(first.index).unwrap().unwrap();
        assert_eq!(record.status, ChunkStatus::RetryableFailed);
        assert_eq!(record.last_error.as_deref(), Some("engine timeout"));

        // Retryable failures are claimed again, lowest index first.
        let again = store.claim_next_chunk().unwrap().unwrap();
        assert_eq!(again.index, 0);
        store.mark_chunk_failed(0, "bad audio", true).unwrap();

        let next = store.claim_next_chunk().unwrap().unwrap();
        assert_eq!(next.index, 1);
        store.mark_chunk_done(1, "uri", "sha").unwrap();
        assert!(store.claim_next_chunk().unwrap().is_none());

        let progress = store.progress().unwrap();
        assert_eq!(progress.total, 2);
        assert_eq!(progress.done, 1);
        assert_eq!(progress.permanent_failed, 1);
        assert!(!progress.is_complete());
    }

    #[test]
    fn test_no_resume_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(dir.path(), &StoreOptions::default());
        store.register_chunks(&specs(3)).unwrap();
        let claimed = store.claim_next_chunk().unwrap().unwrap();
        store.mark_chunk_done(claimed.index, "uri", "sha").unwrap();
        let file_id = store.file_id().to_string();
        store.close().unwrap();

        let options = StoreOptions {
            resume: false,
            ..StoreOptions::default()
        };
        let mut fresh = open(dir.path(), &options);
        assert_eq!(fresh.file_id(), file_id);
        assert_eq!(fresh.file_record().unwrap().done_chunks, 0);
        fresh.register_chunks(&specs(3)).unwrap();
        assert_eq!(fresh.claim_next_chunk().unwrap().unwrap().index, 0);
    }

    #[test]
    fn test_fingerprint_change_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("checkpoint.db");
        let options = StoreOptions::default();

        let mut store = CheckpointStore::open(&db, "file:///a.mp4", "v1", 2, &options).unwrap();
        store.register_chunks(&specs(2)).unwrap();
        let claimed = store.claim_next_chunk().unwrap().unwrap();
        store.mark_chunk_done(claimed.index, "uri", "sha").unwrap();
        store.close().unwrap();

        let store = CheckpointStore::open(&db, "file:///a.mp4", "v2", 2, &options).unwrap();
        assert_eq!(store.file_record().unwrap().fingerprint, "v2");
        assert_eq!(store.progress().unwrap().total, 0);
    }

    #[test]
    fn test_persist_final_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open(dir.path(), &StoreOptions::default());
        store.persist_final_output("/out/talk.txt", "abc123").unwrap();

        let record = store.file_record().unwrap();
        assert_eq!(record.final_output_uri.as_deref(), Some("/out/talk.txt"));
        assert_eq!(record.final_output_sha256.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_open_existing_leaves_state_alone() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("checkpoint.db");
        assert!(CheckpointStore::open_existing(&db, "fake://meeting", "fake-fingerprint")
            .unwrap()
            .is_none());

        let mut store = open(dir.path(), &StoreOptions::default());
        store.register_chunks(&specs(2)).unwrap();
        store.claim_next_chunk().unwrap().unwrap();
        store.close().unwrap();

        let inspected = CheckpointStore::open_existing(&db, "fake://meeting", "fake-fingerprint")
            .unwrap()
            .unwrap();
        let progress = inspected.progress().unwrap();
        assert_eq!(progress.running, 1);
        assert_eq!(progress.pending, 1);

        assert!(CheckpointStore::open_existing(&db, "fake://meeting", "other")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_open_existing_does_not_create_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("checkpoint.db");
        Connection::open(&db)
            .unwrap()
            .execute_batch("CREATE TABLE unrelated (id INTEGER)")
            .unwrap();

        assert!(CheckpointStore::open_existing(&db, "fake://meeting", "fake-fingerprint")
            .unwrap()
            .is_none());

        let tables: i64 = Connection::open(&db)
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('jobs', 'files', 'chunks')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 0);
    }

    #[test]
    fn test_reset_removes_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("checkpoint.db");
        std::fs::write(&db, b"garbage").unwrap();
        std::fs::write(dir.path().join("checkpoint.db-wal"), b"garbage").unwrap();

        remove_store_files(&db).unwrap();
        assert!(!db.exists());
        assert!(!dir.path().join("checkpoint.db-wal").exists());
    }
}
