//! Run coordinator - lease-based mutual exclusion for scheduled tasks.
//!
//! Each task (fetch, flush, downsync) takes a lease before doing any work.
//! A live lease means another invocation is still running: the caller
//! skips the whole cycle and exits cleanly (that is expected concurrency
//! control, not an error). Acquire/expiry-check/claim happens inside one
//! immediate transaction so two overlapping invocations cannot both win,
//! and an expired lease is reclaimable even if the previous holder
//! crashed without releasing it.
//!
//! Minimal run-state (last start, last success) is persisted alongside
//! for observability.

use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;

#[derive(Debug)]
pub enum LeaseError {
    Database(String),
}

impl From<rusqlite::Error> for LeaseError {
    fn from(err: rusqlite::Error) -> Self {
        LeaseError::Database(err.to_string())
    }
}

impl std::fmt::Display for LeaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseError::Database(e) => write!(f, "lease store error: {}", e),
        }
    }
}

impl std::error::Error for LeaseError {}

/// Proof of a held lease; pass back to `release`.
#[derive(Debug, Clone)]
pub struct LeaseHandle {
    pub task_name: String,
    pub holder_id: String,
}

pub struct LeaseStore {
    conn: Connection,
}

impl LeaseStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, LeaseError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LeaseError::Database(format!("create dir: {}", e)))?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS run_leases (
                task_name   TEXT PRIMARY KEY,
                holder_id   TEXT NOT NULL,
                acquired_at INTEGER NOT NULL,
                expires_at  INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS run_state (
                task_name    TEXT PRIMARY KEY,
                last_start   INTEGER,
                last_success INTEGER
            );",
        )?;
        Ok(Self { conn })
    }

    /// Try to take the lease for `task_name`. Returns `None` when a live
    /// lease exists - the caller must skip this cycle entirely.
    pub fn acquire(&mut self, task_name: &str, ttl_secs: i64) -> Result<Option<LeaseHandle>, LeaseError> {
        let holder_id = format!(
            "{}-{:08x}",
            std::process::id(),
            rand::thread_rng().gen::<u32>()
        );
        let now = chrono::Utc::now().timestamp();

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let live: Option<(String, i64)> = tx
            .query_row(
                "SELECT holder_id, expires_at FROM run_leases WHERE task_name = ?1",
                [task_name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((holder, expires_at)) = live {
            if expires_at > now {
                tx.commit()?;
                log::info!(
                    "🔒 [{}] lease held by {} for another {}s; skipping cycle",
                    task_name,
                    holder,
                    expires_at - now
                );
                return Ok(None);
            }
            log::warn!(
                "⚠️  [{}] reclaiming expired lease from {} (expired {}s ago)",
                task_name,
                holder,
                now - expires_at
            );
        }
        tx.execute(
            "INSERT OR REPLACE INTO run_leases (task_name, holder_id, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![task_name, holder_id, now, now + ttl_secs],
        )?;
        tx.commit()?;
        log::debug!("🔑 [{}] lease acquired by {}", task_name, holder_id);
        Ok(Some(LeaseHandle {
            task_name: task_name.to_string(),
            holder_id,
        }))
    }

    /// Release only our own lease; a reclaimed-and-reassigned lease is
    /// left alone.
    pub fn release(&self, handle: &LeaseHandle) -> Result<(), LeaseError> {
        self.conn.execute(
            "DELETE FROM run_leases WHERE task_name = ?1 AND holder_id = ?2",
            params![handle.task_name, handle.holder_id],
        )?;
        Ok(())
    }

    pub fn record_start(&self, task_name: &str) -> Result<(), LeaseError> {
        let now = chrono::Utc::now().timestamp();
        self.conn.execute(
            "INSERT INTO run_state (task_name, last_start) VALUES (?1, ?2)
             ON CONFLICT(task_name) DO UPDATE SET last_start = excluded.last_start",
            params![task_name, now],
        )?;
        Ok(())
    }

    pub fn record_success(&self, task_name: &str) -> Result<(), LeaseError> {
        let now = chrono::Utc::now().timestamp();
        self.conn.execute(
            "INSERT INTO run_state (task_name, last_success) VALUES (?1, ?2)
             ON CONFLICT(task_name) DO UPDATE SET last_success = excluded.last_success",
            params![task_name, now],
        )?;
        Ok(())
    }

    /// `(last_start, last_success)` epoch seconds for a task.
    pub fn run_state(&self, task_name: &str) -> Result<Option<(Option<i64>, Option<i64>)>, LeaseError> {
        let row = self
            .conn
            .query_row(
                "SELECT last_start, last_success FROM run_state WHERE task_name = ?1",
                [task_name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }
}
