//! ClickHouse backend for the analytical-store capability.
//!
//! Talks to the HTTP interface with bounded timeouts. Inserts go as
//! `FORMAT JSONEachRow` bodies; introspection reads `system.tables` /
//! `system.columns`; selects come back as `FORMAT JSON` and are decoded
//! into typed values using the response metadata. Dedup-keyed stream
//! tables are created as ReplacingMergeTree ordered by the dedup key, so
//! re-inserting a batch collapses at merge time and `OPTIMIZE TABLE ...
//! FINAL` is the compaction operation.

use super::{AnalyticalStore, ColumnDef, StoreError};
use crate::registry::StreamDef;
use crate::schema::{self, FieldType, Row, Value};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

pub struct ClickHouseStore {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    database: String,
}

#[derive(Debug, Deserialize)]
struct JsonMeta {
    name: String,
    #[serde(rename = "type")]
    type_name: String,
}

#[derive(Debug, Deserialize)]
struct JsonResult {
    meta: Vec<JsonMeta>,
    data: Vec<serde_json::Map<String, serde_json::Value>>,
}

fn transport(err: reqwest::Error) -> StoreError {
    StoreError::Transport(err.to_string())
}

fn classify_response(status: reqwest::StatusCode, body: String) -> StoreError {
    let schema_markers = [
        "NO_SUCH_COLUMN",
        "UNKNOWN_IDENTIFIER",
        "TYPE_MISMATCH",
        "CANNOT_PARSE",
        "Cannot parse",
        "There is no column",
    ];
    if schema_markers.iter().any(|m| body.contains(m)) {
        StoreError::Schema(body)
    } else {
        StoreError::Backend(format!("HTTP {}: {}", status, body))
    }
}

/// Strip `Nullable(...)` / `LowCardinality(...)` wrappers.
fn base_type(type_name: &str) -> &str {
    let mut t = type_name.trim();
    loop {
        let inner = ["Nullable(", "LowCardinality("]
            .iter()
            .find_map(|w| t.strip_prefix(w).and_then(|rest| rest.strip_suffix(')')));
        match inner {
            Some(i) => t = i.trim(),
            None => return t,
        }
    }
}

/// Decode one FORMAT JSON cell. 64-bit integers arrive as JSON strings.
fn value_from_json(type_name: &str, v: &serde_json::Value) -> Value {
    if v.is_null() {
        return Value::Null;
    }
    let t = base_type(type_name);
    if t.starts_with("DateTime") || t.starts_with("Date") {
        return match v.as_str().and_then(schema::parse_datetime_str) {
            Some(ms) => Value::DateTime(ms),
            None => Value::Null,
        };
    }
    if t == "Bool" {
        return Value::Bool(v.as_bool().unwrap_or(false));
    }
    if t.starts_with("UInt") {
        let parsed = v
            .as_u64()
            .or_else(|| v.as_str().and_then(|s| s.parse().ok()));
        return parsed.map(Value::UInt).unwrap_or(Value::Null);
    }
    if t.starts_with("Int") {
        let parsed = v
            .as_i64()
            .or_else(|| v.as_str().and_then(|s| s.parse().ok()));
        return parsed.map(Value::Int).unwrap_or(Value::Null);
    }
    if t.starts_with("Float") || t.starts_with("Decimal") {
        let parsed = v
            .as_f64()
            .or_else(|| v.as_str().and_then(|s| s.parse().ok()));
        return parsed.map(Value::Float).unwrap_or(Value::Null);
    }
    match v.as_str() {
        Some(s) => Value::Str(s.to_string()),
        None => Value::Str(v.to_string()),
    }
}

/// Encode a cell for a JSONEachRow insert body.
fn value_to_json(v: &Value) -> serde_json::Value {
    match v {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::json!(*b as u8),
        Value::Int(i) => serde_json::json!(i),
        Value::UInt(u) => serde_json::json!(u),
        Value::Float(x) => serde_json::json!(x),
        Value::Str(s) => serde_json::json!(s),
        Value::DateTime(ms) => serde_json::json!(schema::format_datetime_ms(*ms)),
    }
}

/// Render a value as a SQL literal for cursor predicates.
fn sql_literal(v: &Value) -> String {
    match v {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => format!("{}", *b as u8),
        Value::Int(i) => format!("{}", i),
        Value::UInt(u) => format!("{}", u),
        Value::Float(x) => format!("{}", x),
        Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        Value::DateTime(ms) => format!("'{}'", schema::format_datetime_ms(*ms)),
    }
}

fn escape_str(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn ch_type(ty: FieldType) -> &'static str {
    match ty {
        FieldType::Str => "String",
        FieldType::Float => "Float64",
        FieldType::Int => "Int64",
        FieldType::UInt => "UInt64",
        FieldType::Bool => "UInt8",
        FieldType::DateTime => "DateTime64(3)",
    }
}

fn backtick(name: &str) -> String {
    format!("`{}`", name.replace('`', "\\`"))
}

impl ClickHouseStore {
    pub fn new(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        database: &str,
        secure: bool,
    ) -> Result<Self, StoreError> {
        let scheme = if secure { "https" } else { "http" };
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(transport)?;
        Ok(Self {
            http,
            base_url: format!("{}://{}:{}/", scheme, host, port),
            user: user.to_string(),
            password: password.to_string(),
            database: database.to_string(),
        })
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", backtick(&self.database), backtick(table))
    }

    async fn run_query(&self, sql: &str, body: Option<String>) -> Result<String, StoreError> {
        // Unqualified names (replicator ALTERs) resolve to our database.
        self.run_query_with(sql, body, true).await
    }

    async fn run_query_with(
        &self,
        sql: &str,
        body: Option<String>,
        with_db: bool,
    ) -> Result<String, StoreError> {
        let mut req = self
            .http
            .post(&self.base_url)
            .header("X-ClickHouse-User", &self.user)
            .header("X-ClickHouse-Key", &self.password);
        if with_db {
            req = req.query(&[("database", self.database.as_str())]);
        }
        req = match body {
            Some(b) => req.query(&[("query", sql)]).body(b),
            None => req.body(sql.to_string()),
        };
        let resp = req.send().await.map_err(transport)?;
        let status = resp.status();
        let text = resp.text().await.map_err(transport)?;
        if status.is_success() {
            Ok(text)
        } else {
            Err(classify_response(status, text))
        }
    }

    async fn query_json(&self, sql: &str) -> Result<JsonResult, StoreError> {
        let text = self.run_query(&format!("{} FORMAT JSON", sql), None).await?;
        serde_json::from_str(&text)
            .map_err(|e| StoreError::Backend(format!("bad FORMAT JSON response: {}", e)))
    }

    fn rows_from_result(&self, columns: &[String], result: &JsonResult) -> Vec<Row> {
        let types: HashMap<&str, &str> = result
            .meta
            .iter()
            .map(|m| (m.name.as_str(), m.type_name.as_str()))
            .collect();
        result
            .data
            .iter()
            .map(|obj| {
                columns
                    .iter()
                    .map(|c| {
                        let ty = types.get(c.as_str()).copied().unwrap_or("String");
                        obj.get(c)
                            .map(|v| value_from_json(ty, v))
                            .unwrap_or(Value::Null)
                    })
                    .collect()
            })
            .collect()
    }
}

#[async_trait]
impl AnalyticalStore for ClickHouseStore {
    fn backend_type(&self) -> &'static str {
        "ClickHouse"
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        // The database may not exist yet, so this one runs without the
        // default-database parameter.
        self.run_query_with(
            &format!("CREATE DATABASE IF NOT EXISTS {}", backtick(&self.database)),
            None,
            false,
        )
        .await?;
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
            .map(|c| backtick(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) FORMAT JSONEachRow",
            self.qualified(table),
            col_list
        );
        let mut body = String::new();
        for row in rows {
            let obj: serde_json::Map<String, serde_json::Value> = columns
                .iter()
                .cloned()
                .zip(row.iter().map(value_to_json))
                .collect();
            body.push_str(&serde_json::Value::Object(obj).to_string());
            body.push('\n');
        }
        self.run_query(&sql, Some(body)).await?;
        Ok(())
    }

    async fn optimize_table(&self, table: &str) -> Result<(), StoreError> {
        self.run_query(&format!("OPTIMIZE TABLE {} FINAL", self.qualified(table)), None)
            .await?;
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let sql = format!(
            "SELECT 1 FROM system.tables WHERE database = '{}' AND name = '{}' LIMIT 1",
            escape_str(&self.database),
            escape_str(table)
        );
        let result = self.query_json(&sql).await?;
        Ok(!result.data.is_empty())
    }

    async fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        let sql = format!(
            "SELECT name FROM system.tables
             WHERE database = '{}' AND engine NOT IN ('View', 'MaterializedView')
             ORDER BY name",
            escape_str(&self.database)
        );
        let result = self.query_json(&sql).await?;
        Ok(result
            .data
            .iter()
            .filter_map(|obj| obj.get("name").and_then(|v| v.as_str()).map(String::from))
            .collect())
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnDef>, StoreError> {
        let sql = format!(
            "SELECT name, type FROM system.columns
             WHERE database = '{}' AND table = '{}'
             ORDER BY position",
            escape_str(&self.database),
            escape_str(table)
        );
        let result = self.query_json(&sql).await?;
        if result.data.is_empty() {
            return Err(StoreError::Schema(format!("no such table: {}", table)));
        }
        Ok(result
            .data
            .iter()
            .map(|obj| ColumnDef {
                name: obj
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                type_name: obj
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect())
    }

    async fn show_create(&self, table: &str) -> Result<String, StoreError> {
        let result = self
            .query_json(&format!("SHOW CREATE TABLE {}", self.qualified(table)))
            .await?;
        result
            .data
            .first()
            .and_then(|obj| obj.get("statement"))
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| StoreError::Backend(format!("no create statement for {}", table)))
    }

    async fn execute_ddl(&self, sql: &str) -> Result<(), StoreError> {
        self.run_query(sql, None).await?;
        Ok(())
    }

    async fn create_stream_table(&self, def: &StreamDef) -> Result<(), StoreError> {
        let cols = def
            .fields
            .iter()
            .map(|(name, ty)| format!("    {} {}", backtick(name), ch_type(*ty)))
            .collect::<Vec<_>>()
            .join(",\n");
        let (engine, order_by) = if def.is_dedup() {
            let key = def
                .dedup_key
                .iter()
                .map(|k| backtick(k))
                .collect::<Vec<_>>()
                .join(", ");
            ("ReplacingMergeTree()".to_string(), format!("({})", key))
        } else {
            // Snapshot tables are ordered by their first timestamp column.
            let ts = def
                .fields
                .iter()
                .find(|(_, ty)| *ty == FieldType::DateTime)
                .map(|(name, _)| backtick(name))
                .unwrap_or_else(|| "tuple()".to_string());
            ("MergeTree()".to_string(), ts)
        };
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n) ENGINE = {}\nORDER BY {}",
            self.qualified(def.target_table),
            cols,
            engine,
            order_by
        );
        self.run_query(&ddl, None).await?;
        Ok(())
    }

    async fn max_value(&self, table: &str, column: &str) -> Result<Option<Value>, StoreError> {
        let sql = format!(
            "SELECT count() AS c, max({}) AS v FROM {}",
            backtick(column),
            self.qualified(table)
        );
        let result = self.query_json(&sql).await?;
        let row = match result.data.first() {
            Some(r) => r,
            None => return Ok(None),
        };
        let count = row
            .get("c")
            .map(|v| value_from_json("UInt64", v))
            .unwrap_or(Value::Null);
        if count == Value::UInt(0) {
            return Ok(None);
        }
        let vtype = result
            .meta
            .iter()
            .find(|m| m.name == "v")
            .map(|m| m.type_name.as_str())
            .unwrap_or("String");
        let value = row
            .get("v")
            .map(|v| value_from_json(vtype, v))
            .unwrap_or(Value::Null);
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
            .map(|c| backtick(c))
            .collect::<Vec<_>>()
            .join(", ");
        let predicate = match after {
            Some(v) => format!("WHERE {} > {}", backtick(cursor_column), sql_literal(v)),
            None => String::new(),
        };
        let sql = format!(
            "SELECT {} FROM {} {} ORDER BY {} ASC LIMIT {}",
            col_list,
            self.qualified(table),
            predicate,
            backtick(cursor_column),
            limit
        );
        let result = self.query_json(&sql).await?;
        Ok(self.rows_from_result(columns, &result))
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
            .map(|c| backtick(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = {}",
            col_list,
            self.qualified(table),
            backtick(cursor_column),
            sql_literal(value)
        );
        let result = self.query_json(&sql).await?;
        Ok(self.rows_from_result(columns, &result))
    }

    async fn select_all(&self, table: &str, columns: &[String]) -> Result<Vec<Row>, StoreError> {
        let col_list = columns
            .iter()
            .map(|c| backtick(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {} FROM {}", col_list, self.qualified(table));
        let result = self.query_json(&sql).await?;
        Ok(self.rows_from_result(columns, &result))
    }
}
