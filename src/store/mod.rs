//! Analytical store capability.
//!
//! The flush engine and the replicator talk to targets only through the
//! `AnalyticalStore` trait: idempotent inserts, table-level compaction,
//! schema introspection, DDL and bounded windowed selects. Two backends:
//!
//! - `clickhouse` - ClickHouse over its HTTP interface (production targets)
//! - `sqlite` - embedded SQLite (tests, local near-store option)
//!
//! Store handles are constructed per task invocation and passed in
//! explicitly; nothing in this crate holds a module-global connection.

pub mod clickhouse;
pub mod sqlite;

pub use clickhouse::ClickHouseStore;
pub use sqlite::SqliteStore;

use crate::registry::StreamDef;
use crate::schema::{Row, Value};
use async_trait::async_trait;

#[derive(Debug)]
pub enum StoreError {
    /// Network-level failure (connect, timeout) - retry next cycle.
    Transport(String),
    /// The data does not fit the table (unknown column, type mismatch).
    Schema(String),
    /// Everything else the backend rejected.
    Backend(String),
}

impl StoreError {
    pub fn is_schema(&self) -> bool {
        matches!(self, StoreError::Schema(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Transport(e) => write!(f, "transport error: {}", e),
            StoreError::Schema(e) => write!(f, "schema error: {}", e),
            StoreError::Backend(e) => write!(f, "backend error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

/// One introspected column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub type_name: String,
}

#[async_trait]
pub trait AnalyticalStore: Send + Sync {
    /// Backend label for logging.
    fn backend_type(&self) -> &'static str;

    /// Create the configured database/namespace if the backend has one.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Insert rows. For tables keyed on a dedup key this is replace-on-key;
    /// re-inserting an already applied batch must not create duplicate
    /// logical rows at read time.
    async fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Row],
    ) -> Result<(), StoreError>;

    /// Table-level deduplication (compaction) for keyed tables.
    async fn optimize_table(&self, table: &str) -> Result<(), StoreError>;

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError>;

    /// Base tables only - no views.
    async fn list_tables(&self) -> Result<Vec<String>, StoreError>;

    /// Columns in table order.
    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnDef>, StoreError>;

    /// The table's creation DDL, as the backend reports it.
    async fn show_create(&self, table: &str) -> Result<String, StoreError>;

    async fn execute_ddl(&self, sql: &str) -> Result<(), StoreError>;

    /// Create the target table for a registry stream if missing.
    async fn create_stream_table(&self, def: &StreamDef) -> Result<(), StoreError>;

    /// `max(column)`, or `None` when the table is empty.
    async fn max_value(&self, table: &str, column: &str) -> Result<Option<Value>, StoreError>;

    /// Rows with `cursor_column > after` (all rows when `after` is None),
    /// ordered by the cursor column, bounded to `limit`.
    async fn select_after(
        &self,
        table: &str,
        columns: &[String],
        cursor_column: &str,
        after: Option<&Value>,
        limit: u64,
    ) -> Result<Vec<Row>, StoreError>;

    /// All rows with `cursor_column == value` - the window-boundary refetch.
    async fn select_equal(
        &self,
        table: &str,
        columns: &[String],
        cursor_column: &str,
        value: &Value,
    ) -> Result<Vec<Row>, StoreError>;

    /// Unbounded copy source for tables without a cursor column.
    async fn select_all(&self, table: &str, columns: &[String]) -> Result<Vec<Row>, StoreError>;
}

/// Which of the two configured targets a store handle plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetRole {
    Primary,
    Secondary,
}

impl std::fmt::Display for TargetRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetRole::Primary => write!(f, "primary"),
            TargetRole::Secondary => write!(f, "secondary"),
        }
    }
}

/// A flush destination: role + store handle, built per invocation.
pub struct Target {
    pub role: TargetRole,
    pub store: std::sync::Arc<dyn AnalyticalStore>,
}
