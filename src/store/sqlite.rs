//! Embedded SQLite backend for the analytical-store capability.
//!
//! Used by the test suite and as a local near-store option. Replace-on-key
//! comes from `INSERT OR REPLACE`: dedup-keyed stream tables carry their
//! dedup key as PRIMARY KEY, append-only tables carry a UNIQUE index over
//! all columns so a crash-then-retry re-insert is a no-op instead of a
//! duplicate row.

use super::{AnalyticalStore, ColumnDef, StoreError};
use crate::registry::StreamDef;
use crate::schema::{FieldType, Row, Value};
use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, ToSql};
use std::path::Path;
use std::sync::{Arc, Mutex};

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Bool(b) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*b as i64)),
            Value::Int(i) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*i)),
            Value::UInt(u) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*u as i64)),
            Value::Float(x) => ToSqlOutput::Owned(rusqlite::types::Value::Real(*x)),
            Value::Str(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::DateTime(ms) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*ms)),
        })
    }
}

fn value_from_sqlite(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(x) => Value::Float(x),
        ValueRef::Text(t) => Value::Str(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => Value::Str(String::from_utf8_lossy(b).to_string()),
    }
}

fn sqlite_type(ty: FieldType) -> &'static str {
    match ty {
        FieldType::Str => "TEXT",
        FieldType::Float => "REAL",
        FieldType::Int | FieldType::UInt | FieldType::Bool => "INTEGER",
        // Declared name keeps cursor-column inference working; stored as
        // millisecond integers.
        FieldType::DateTime => "DATETIME",
    }
}

fn classify(err: rusqlite::Error) -> StoreError {
    let msg = err.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("no column")
        || lower.contains("datatype mismatch")
        || lower.contains("no such table")
    {
        StoreError::Schema(msg)
    } else {
        StoreError::Backend(msg)
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Backend(format!("create dir: {}", e)))?;
            }
        }
        let conn = Connection::open(db_path).map_err(classify)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(classify)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(classify)?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(classify)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn select_rows(
        &self,
        sql: &str,
        params: &[&dyn ToSql],
        width: usize,
    ) -> Result<Vec<Row>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql).map_err(classify)?;
        let mut out = Vec::new();
        let mut rows = stmt.query(params).map_err(classify)?;
        while let Some(row) = rows.next().map_err(classify)? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(value_from_sqlite(row.get_ref(i).map_err(classify)?));
            }
            out.push(values);
        }
        Ok(out)
    }
}

#[async_trait]
impl AnalyticalStore for SqliteStore {
    fn backend_type(&self) -> &'static str {
        "SQLite"
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        // Single-file database; nothing to create.
        Ok(())
    }

    async fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Row],
    ) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let col_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            quote_ident(table),
            col_list,
            placeholders
        );

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(classify)?;
        {
            let mut stmt = tx.prepare(&sql).map_err(classify)?;
            for row in rows {
                stmt.execute(rusqlite::params_from_iter(row.iter()))
                    .map_err(classify)?;
            }
        }
        tx.commit().map_err(classify)?;
        Ok(())
    }

    async fn optimize_table(&self, _table: &str) -> Result<(), StoreError> {
        // Replace-on-key already holds at insert time; nothing to collapse.
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA optimize").map_err(classify)?;
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .map_err(classify)?;
        stmt.exists([table]).map_err(classify)
    }

    async fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )
            .map_err(classify)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(classify)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify)?;
        Ok(names)
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnDef>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("PRAGMA table_info({})", quote_ident(table));
        let mut stmt = conn.prepare(&sql).map_err(classify)?;
        let cols = stmt
            .query_map([], |row| {
                Ok(ColumnDef {
                    name: row.get::<_, String>(1)?,
                    type_name: row.get::<_, String>(2)?,
                })
            })
            .map_err(classify)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify)?;
        if cols.is_empty() {
            return Err(StoreError::Schema(format!("no such table: {}", table)));
        }
        Ok(cols)
    }

    async fn show_create(&self, table: &str) -> Result<String, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get::<_, String>(0),
        )
        .map_err(classify)
    }

    async fn execute_ddl(&self, sql: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(sql).map_err(classify)
    }

    async fn create_stream_table(&self, def: &StreamDef) -> Result<(), StoreError> {
        let mut cols: Vec<String> = def
            .fields
            .iter()
            .map(|(name, ty)| format!("{} {}", quote_ident(name), sqlite_type(*ty)))
            .collect();
        if def.is_dedup() {
            let key = def
                .dedup_key
                .iter()
                .map(|k| quote_ident(k))
                .collect::<Vec<_>>()
                .join(", ");
            cols.push(format!("PRIMARY KEY ({})", key));
        }
        let mut ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            quote_ident(def.target_table),
            cols.join(",\n    ")
        );
        if !def.is_dedup() {
            // Full-row uniqueness makes re-inserting an already applied
            // batch a no-op for snapshot tables.
            let all = def
                .fields
                .iter()
                .map(|(name, _)| quote_ident(name))
                .collect::<Vec<_>>()
                .join(", ");
            ddl.push_str(&format!(
                ";\nCREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
                quote_ident(&format!("uq_{}", def.target_table)),
                quote_ident(def.target_table),
                all
            ));
        }
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(&ddl).map_err(classify)
    }

    async fn max_value(&self, table: &str, column: &str) -> Result<Option<Value>, StoreError> {
        let sql = format!(
            "SELECT max({}) FROM {}",
            quote_ident(column),
            quote_ident(table)
        );
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(&sql, [], |row| row.get_ref(0).map(value_from_sqlite))
            .map_err(classify)?;
        Ok(match value {
            Value::Null => None,
            v => Some(v),
        })
    }

    async fn select_after(
        &self,
        table: &str,
        columns: &[String],
        cursor_column: &str,
        after: Option<&Value>,
        limit: u64,
    ) -> Result<Vec<Row>, StoreError> {
        let col_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        match after {
            Some(v) => {
                let sql = format!(
                    "SELECT {} FROM {} WHERE {} > ?1 ORDER BY {} ASC LIMIT {}",
                    col_list,
                    quote_ident(table),
                    quote_ident(cursor_column),
                    quote_ident(cursor_column),
                    limit
                );
                self.select_rows(&sql, &[v], columns.len())
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM {} ORDER BY {} ASC LIMIT {}",
                    col_list,
                    quote_ident(table),
                    quote_ident(cursor_column),
                    limit
                );
                self.select_rows(&sql, &[], columns.len())
            }
        }
    }

    async fn select_equal(
        &self,
        table: &str,
        columns: &[String],
        cursor_column: &str,
        value: &Value,
    ) -> Result<Vec<Row>, StoreError> {
        let col_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            col_list,
            quote_ident(table),
            quote_ident(cursor_column)
        );
        self.select_rows(&sql, &[value], columns.len())
    }

    async fn select_all(&self, table: &str, columns: &[String]) -> Result<Vec<Row>, StoreError> {
        let col_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {} FROM {}", col_list, quote_ident(table));
        self.select_rows(&sql, &[], columns.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;
    use tempfile::tempdir;

    fn trade_row(coin: &str, time_ms: i64, tid: u64, px: f64) -> Row {
        vec![
            Value::Str(coin.into()),
            Value::Str("B".into()),
            Value::Float(px),
            Value::Float(1.0),
            Value::DateTime(time_ms),
            Value::Str("0xabc".into()),
            Value::Float(0.0),
            Value::Str("Open Long".into()),
            Value::Float(0.0),
            Value::UInt(1),
            Value::Str("".into()),
            Value::Float(0.01),
            Value::UInt(tid),
            Value::Str("0xaddr".into()),
        ]
    }

    #[tokio::test]
    async fn test_dedup_table_replaces_on_key() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("t.db")).unwrap();
        let def = registry::stream("trades").unwrap();
        store.create_stream_table(def).await.unwrap();

        let cols = def.column_names();
        store
            .insert_rows("trades", &cols, &[trade_row("BTC", 1000, 1, 100.0)])
            .await
            .unwrap();
        // Same dedup key, newer px - must replace, not duplicate.
        store
            .insert_rows("trades", &cols, &[trade_row("BTC", 1000, 1, 101.0)])
            .await
            .unwrap();

        let rows = store.select_all("trades", &cols).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][2], Value::Float(101.0));
    }

    #[tokio::test]
    async fn test_append_only_reinsert_is_noop() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("t.db")).unwrap();
        let def = registry::stream("account").unwrap();
        store.create_stream_table(def).await.unwrap();

        let cols = def.column_names();
        let row = vec![
            Value::DateTime(1000),
            Value::Float(10_000.0),
            Value::Float(0.0),
            Value::Float(0.0),
            Value::Float(0.0),
            Value::Float(0.0),
            Value::Float(10_000.0),
            Value::Str("0xaddr".into()),
        ];
        store
            .insert_rows("account_snapshots", &cols, &[row.clone()])
            .await
            .unwrap();
        store
            .insert_rows("account_snapshots", &cols, &[row])
            .await
            .unwrap();

        let rows = store.select_all("account_snapshots", &cols).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_select_after_window_and_max() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("t.db")).unwrap();
        let def = registry::stream("trades").unwrap();
        store.create_stream_table(def).await.unwrap();
        let cols = def.column_names();

        assert_eq!(store.max_value("trades", "time").await.unwrap(), None);

        let rows: Vec<Row> = (0..5)
            .map(|i| trade_row("BTC", 1000 + i, i as u64 + 1, 100.0))
            .collect();
        store.insert_rows("trades", &cols, &rows).await.unwrap();

        assert_eq!(
            store.max_value("trades", "time").await.unwrap(),
            Some(Value::Int(1004))
        );

        let window = store
            .select_after("trades", &cols, "time", Some(&Value::Int(1001)), 2)
            .await
            .unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0][4], Value::Int(1002));
        assert_eq!(window[1][4], Value::Int(1003));
    }

    #[tokio::test]
    async fn test_insert_into_unknown_column_is_schema_error() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("t.db")).unwrap();
        let def = registry::stream("trades").unwrap();
        store.create_stream_table(def).await.unwrap();

        let err = store
            .insert_rows(
                "trades",
                &["not_a_column".to_string()],
                &[vec![Value::Int(1)]],
            )
            .await
            .unwrap_err();
        assert!(err.is_schema(), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_introspection() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("t.db")).unwrap();
        let def = registry::stream("candles").unwrap();
        store.create_stream_table(def).await.unwrap();

        assert!(store.table_exists("candles").await.unwrap());
        assert!(!store.table_exists("nope").await.unwrap());
        assert_eq!(store.list_tables().await.unwrap(), vec!["candles"]);

        let cols = store.describe_table("candles").await.unwrap();
        assert_eq!(cols.len(), def.fields.len());
        assert_eq!(cols[2].name, "ts");
        assert_eq!(cols[2].type_name, "DATETIME");

        let ddl = store.show_create("candles").await.unwrap();
        assert!(ddl.contains("PRIMARY KEY"));
    }
}
