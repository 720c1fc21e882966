//! Cursor store - per-table replication watermarks.
//!
//! One row per replicated table in the local state database, owned
//! exclusively by the incremental replicator. A cursor only ever moves
//! forward: `advance` refuses a value below the stored one (that would
//! mean a bug upstream, and corrupting sync state is worse than alerting).

use crate::schema::Value;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

#[derive(Debug)]
pub enum CursorError {
    Database(String),
    Encoding(String),
    /// Proposed value is below the stored watermark.
    Regression {
        table: String,
        stored: String,
        proposed: String,
    },
}

impl From<rusqlite::Error> for CursorError {
    fn from(err: rusqlite::Error) -> Self {
        CursorError::Database(err.to_string())
    }
}

impl std::fmt::Display for CursorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CursorError::Database(e) => write!(f, "cursor store error: {}", e),
            CursorError::Encoding(e) => write!(f, "cursor encoding error: {}", e),
            CursorError::Regression {
                table,
                stored,
                proposed,
            } => write!(
                f,
                "cursor regression on {}: stored {} vs proposed {}",
                table, stored, proposed
            ),
        }
    }
}

impl std::error::Error for CursorError {}

#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    pub table_name: String,
    pub cursor_column: String,
    pub last_value: Value,
    /// Millisecond timestamp of the last advance.
    pub updated_at: i64,
}

pub struct CursorStore {
    conn: Connection,
}

impl CursorStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, CursorError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CursorError::Database(format!("create dir: {}", e)))?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_cursors (
                table_name    TEXT PRIMARY KEY,
                cursor_column TEXT NOT NULL,
                last_value    TEXT NOT NULL,
                updated_at    INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(Self { conn })
    }

    pub fn get(&self, table: &str) -> Result<Option<Cursor>, CursorError> {
        let row = self
            .conn
            .query_row(
                "SELECT cursor_column, last_value, updated_at
                 FROM sync_cursors WHERE table_name = ?1",
                [table],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((cursor_column, encoded, updated_at)) => {
                let last_value: Value = serde_json::from_str(&encoded)
                    .map_err(|e| CursorError::Encoding(format!("{}: {}", encoded, e)))?;
                Ok(Some(Cursor {
                    table_name: table.to_string(),
                    cursor_column,
                    last_value,
                    updated_at,
                }))
            }
        }
    }

    /// Persist a new watermark. Equal values are fine (non-decreasing);
    /// a lower value is refused with `Regression`. Changing the cursor
    /// column resets the watermark (an operator override took effect).
    pub fn advance(&self, table: &str, column: &str, value: &Value) -> Result<(), CursorError> {
        if let Some(existing) = self.get(table)? {
            if existing.cursor_column == column {
                match value.cmp_same(&existing.last_value) {
                    Some(std::cmp::Ordering::Less) | None => {
                        return Err(CursorError::Regression {
                            table: table.to_string(),
                            stored: existing.last_value.to_string(),
                            proposed: value.to_string(),
                        });
                    }
                    _ => {}
                }
            } else {
                log::warn!(
                    "⚠️  cursor column for {} changed {} -> {}; watermark reset",
                    table,
                    existing.cursor_column,
                    column
                );
            }
        }
        let encoded = serde_json::to_string(value)
            .map_err(|e| CursorError::Encoding(e.to_string()))?;
        let now = chrono::Utc::now().timestamp_millis();
        self.conn.execute(
            "INSERT INTO sync_cursors (table_name, cursor_column, last_value, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(table_name) DO UPDATE SET
                cursor_column = excluded.cursor_column,
                last_value = excluded.last_value,
                updated_at = excluded.updated_at",
            params![table, column, encoded, now],
        )?;
        Ok(())
    }
}
