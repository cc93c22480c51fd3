//! Append-only usage journal on embedded SQLite.
//!
//! Keyed by an auto-increment local sequence; WAL with full fsync so
//! an insert that returned is on disk. Rows are removed only after
//! the syncer gets a remote acknowledgment. A retention cap bounds
//! the table; overflow drops the oldest rows with a warning, never
//! silently.

use chrono::{DateTime, Utc};
use node_runtime::{JobStatus, UsageRecord, UsageSink, UsageSinkError};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default maximum row count before the oldest rows are dropped.
pub const DEFAULT_MAX_ROWS: usize = 10_000;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("Journal store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create journal directory '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt journal row {seq}: {details}")]
    Corrupt { seq: i64, details: String },
}

/// One journaled record with its local sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub seq: i64,
    pub record: UsageRecord,
}

pub struct Journal {
    conn: Mutex<Connection>,
    node_id: String,
    max_rows: usize,
}

impl Journal {
    /// Open (creating if needed) the journal at `path`.
    pub fn open(path: &Path, node_id: impl Into<String>) -> Result<Self, JournalError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| JournalError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        // WAL for concurrent readers, FULL sync so commits survive OS
        // crashes.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS usage_log (
                seq               INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id            TEXT NOT NULL,
                job_type          TEXT NOT NULL,
                backend           TEXT,
                model             TEXT,
                status            TEXT NOT NULL,
                started_at        TEXT NOT NULL,
                completed_at      TEXT NOT NULL,
                duration_ms       INTEGER NOT NULL,
                prompt_tokens     INTEGER,
                completion_tokens INTEGER,
                total_tokens      INTEGER,
                request_bytes     INTEGER,
                response_bytes    INTEGER,
                node_id           TEXT NOT NULL,
                inserted_at       TEXT NOT NULL
            )",
            [],
        )?;

        info!(path = %path.display(), "Usage journal opened");
        Ok(Self {
            conn: Mutex::new(conn),
            node_id: node_id.into(),
            max_rows: DEFAULT_MAX_ROWS,
        })
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows.max(1);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Append a record, stamping this node's id. Returns the local
    /// sequence number.
    pub fn insert(&self, record: &UsageRecord) -> Result<i64, JournalError> {
        let conn = self.conn.lock().expect("journal mutex poisoned");

        conn.execute(
            "INSERT INTO usage_log (
                job_id, job_type, backend, model, status,
                started_at, completed_at, duration_ms,
                prompt_tokens, completion_tokens, total_tokens,
                request_bytes, response_bytes, node_id, inserted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                record.job_id,
                record.job_type,
                record.backend,
                record.model,
                record.status.as_str(),
                record.started_at.to_rfc3339(),
                record.completed_at.to_rfc3339(),
                record.duration_ms,
                record.prompt_tokens,
                record.completion_tokens,
                record.total_tokens,
                record.request_bytes,
                record.response_bytes,
                self.node_id,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let seq = conn.last_insert_rowid();

        // Retention cap: drop the oldest overflow rows, loudly.
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM usage_log", [], |row| row.get(0))?;
        let overflow = count - self.max_rows as i64;
        if overflow > 0 {
            conn.execute(
                "DELETE FROM usage_log WHERE seq IN (
                    SELECT seq FROM usage_log ORDER BY seq ASC LIMIT ?1
                )",
                params![overflow],
            )?;
            warn!(
                dropped = overflow,
                max_rows = self.max_rows,
                "Usage journal over retention cap, dropped oldest unsynced rows"
            );
        }

        debug!(seq, job_id = %record.job_id, status = record.status.as_str(), "Usage record journaled");
        Ok(seq)
    }

    /// Up to `limit` oldest unsent records, in insertion order.
    pub fn peek(&self, limit: usize) -> Result<Vec<JournalEntry>, JournalError> {
        let conn = self.conn.lock().expect("journal mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT seq, job_id, job_type, backend, model, status,
                    started_at, completed_at, duration_ms,
                    prompt_tokens, completion_tokens, total_tokens,
                    request_bytes, response_bytes
             FROM usage_log ORDER BY seq ASC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, i64>(8)?,
                row.get::<_, Option<u64>>(9)?,
                row.get::<_, Option<u64>>(10)?,
                row.get::<_, Option<u64>>(11)?,
                row.get::<_, Option<u64>>(12)?,
                row.get::<_, Option<u64>>(13)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (
                seq,
                job_id,
                job_type,
                backend,
                model,
                status,
                started_at,
                completed_at,
                duration_ms,
                prompt_tokens,
                completion_tokens,
                total_tokens,
                request_bytes,
                response_bytes,
            ) = row?;

            let corrupt = |details: String| JournalError::Corrupt { seq, details };
            let status: JobStatus = status.parse().map_err(&corrupt)?;
            let started_at = parse_instant(&started_at).map_err(&corrupt)?;
            let completed_at = parse_instant(&completed_at).map_err(&corrupt)?;

            entries.push(JournalEntry {
                seq,
                record: UsageRecord {
                    job_id,
                    job_type,
                    backend,
                    model,
                    status,
                    started_at,
                    completed_at,
                    duration_ms,
                    prompt_tokens,
                    completion_tokens,
                    total_tokens,
                    request_bytes,
                    response_bytes,
                },
            });
        }
        Ok(entries)
    }

    /// Remove remotely acknowledged records.
    pub fn delete(&self, seqs: &[i64]) -> Result<usize, JournalError> {
        if seqs.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock().expect("journal mutex poisoned");
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM usage_log WHERE seq = ?1")?;
            for seq in seqs {
                deleted += stmt.execute(params![seq])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    pub fn len(&self) -> Result<usize, JournalError> {
        let conn = self.conn.lock().expect("journal mutex poisoned");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM usage_log", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, JournalError> {
        Ok(self.len()? == 0)
    }
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{raw}': {e}"))
}

/// Async adapter the runner writes through; inserts run on the
/// blocking pool so the worker task never stalls on fsync.
#[derive(Clone)]
pub struct JournalSink {
    journal: Arc<Journal>,
}

impl JournalSink {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self { journal }
    }
}

#[async_trait::async_trait]
impl UsageSink for JournalSink {
    async fn record(&self, record: UsageRecord) -> Result<(), UsageSinkError> {
        let journal = Arc::clone(&self.journal);
        tokio::task::spawn_blocking(move || journal.insert(&record))
            .await
            .map_err(|e| UsageSinkError(e.to_string()))?
            .map(|_| ())
            .map_err(|e| UsageSinkError(e.to_string()))
    }
}
