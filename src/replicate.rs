//! Incremental replicator - pulls tables from the far store down into the
//! near store on a slow cadence, gated by persisted per-table cursors.
//!
//! Per-table lifecycle: if the destination table is missing it is created
//! from the source's own CREATE statement (cloud-only engine directives
//! normalized to their on-premise equivalents) and filled by an initial
//! copy; after that the table stays in steady-state incremental mode:
//! windowed pulls of rows past the cursor, insert, then advance. The
//! cursor is advanced only after the destination insert commits, so a
//! crash mid-pull replays at most the last window - and the destination's
//! replace-on-key semantics make that replay harmless.

use crate::cursor::CursorStore;
use crate::outcome::{SyncError, UnitOutcome};
use crate::schema::{Row, Value};
use crate::store::{AnalyticalStore, ColumnDef, StoreError};
use std::cmp::Ordering;

/// One table to replicate, with an optional cursor-column override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    pub cursor_override: Option<String>,
}

impl TableSpec {
    /// Parse `table` or `table:cursor_column`.
    pub fn parse(s: &str) -> Self {
        match s.split_once(':') {
            Some((name, col)) => Self {
                name: name.trim().to_string(),
                cursor_override: Some(col.trim().to_string()),
            },
            None => Self {
                name: s.trim().to_string(),
                cursor_override: None,
            },
        }
    }
}

/// Cursor columns for tables whose schema is known in advance. Discovered
/// tables not listed here fall back to inference.
pub fn default_cursor_override(table: &str) -> Option<&'static str> {
    match table {
        "account_snapshots" => Some("timestamp"),
        "positions_snapshots" => Some("timestamp"),
        "trades" => Some("time"),
        "orders" => Some("timestamp"),
        "funding_payments" => Some("time"),
        "ledger_updates" => Some("time"),
        "candles" => Some("ts"),
        "hl_meta" => Some("updated_at"),
        _ => None,
    }
}

/// Convert cloud-only engine directives to on-premise equivalents and make
/// the statement idempotent.
pub fn normalize_create_statement(ddl: &str) -> String {
    let mut out = ddl
        .replace("SharedReplacingMergeTree", "ReplacingMergeTree")
        .replace("SharedMergeTree", "MergeTree")
        .replace("SharedAggregatingMergeTree", "AggregatingMergeTree");
    for engine in ["ReplacingMergeTree", "AggregatingMergeTree", "MergeTree"] {
        out = strip_engine_args(&out, engine);
    }
    if !out.contains("IF NOT EXISTS") {
        out = out.replacen("CREATE TABLE ", "CREATE TABLE IF NOT EXISTS ", 1);
    }
    out
}

/// Drop legacy engine parameters: `ENGINE = MergeTree(a, b)` -> `ENGINE = MergeTree()`.
fn strip_engine_args(ddl: &str, engine: &str) -> String {
    let pat = format!("ENGINE = {}", engine);
    let pos = match ddl.find(&pat) {
        Some(p) => p,
        None => return ddl.to_string(),
    };
    let args_at = pos + pat.len();
    let rest = &ddl[args_at..];
    if !rest.starts_with('(') {
        return ddl.to_string();
    }
    let mut depth = 0usize;
    for (i, c) in rest.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return format!("{}(){}", &ddl[..args_at], &rest[i + 1..]);
                }
            }
            _ => {}
        }
    }
    ddl.to_string()
}

/// Pick a monotonic column from the schema: Date/DateTime-typed, names
/// containing `timestamp` preferred over `time` over `date`.
pub fn infer_cursor_column(columns: &[ColumnDef]) -> Option<String> {
    let mut candidates: Vec<(u8, &ColumnDef)> = columns
        .iter()
        .filter(|c| {
            let t = c.type_name.to_lowercase();
            t.contains("date") || t.contains("time")
        })
        .map(|c| {
            let n = c.name.to_lowercase();
            let rank = if n.contains("timestamp") {
                1
            } else if n.contains("time") {
                2
            } else if n.contains("date") {
                3
            } else {
                4
            };
            (rank, c)
        })
        .collect();
    candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name.cmp(&b.1.name)));
    candidates.first().map(|(_, c)| c.name.clone())
}

pub struct Replicator<'a> {
    source: &'a dyn AnalyticalStore,
    dest: &'a dyn AnalyticalStore,
    cursors: &'a CursorStore,
    window_rows: u64,
}

impl<'a> Replicator<'a> {
    pub fn new(
        source: &'a dyn AnalyticalStore,
        dest: &'a dyn AnalyticalStore,
        cursors: &'a CursorStore,
        window_rows: u64,
    ) -> Self {
        Self {
            source,
            dest,
            cursors,
            window_rows: window_rows.max(1),
        }
    }

    /// Table list from the source when none is configured.
    pub async fn discover_tables(&self) -> Result<Vec<TableSpec>, StoreError> {
        let names = self.source.list_tables().await?;
        Ok(names
            .into_iter()
            .map(|name| {
                let cursor_override = default_cursor_override(&name).map(String::from);
                TableSpec {
                    name,
                    cursor_override,
                }
            })
            .collect())
    }

    pub async fn run(&self, tables: &[TableSpec], dry_run: bool) -> Vec<UnitOutcome> {
        let mut outcomes = Vec::new();
        for spec in tables {
            let outcome = if dry_run {
                self.dry_run_table(spec).await
            } else {
                self.sync_table(spec).await
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn dry_run_table(&self, spec: &TableSpec) -> UnitOutcome {
        let cursor = match self.cursors.get(&spec.name) {
            Ok(c) => c,
            Err(e) => return UnitOutcome::failed(&spec.name, e.to_string()),
        };
        let detail = match cursor {
            Some(c) => format!("dry-run: cursor {} = {}", c.cursor_column, c.last_value),
            None => "dry-run: no cursor yet".to_string(),
        };
        UnitOutcome::succeeded(&spec.name, 0, detail)
    }

    /// Replicate one table. Source unreachable -> `Skipped` with the cursor
    /// untouched; destination failure -> `Failed` with the cursor untouched
    /// (the same window is retried next cycle).
    pub async fn sync_table(&self, spec: &TableSpec) -> UnitOutcome {
        let table = spec.name.as_str();

        let src_cols = match self.source.describe_table(table).await {
            Ok(c) => c,
            Err(StoreError::Transport(e)) => {
                log::warn!("⚠️  [{}] source unreachable, skipping cycle: {}", table, e);
                return UnitOutcome::skipped(table, format!("source unreachable: {}", e));
            }
            Err(e) => return UnitOutcome::failed(table, e.to_string()),
        };

        let created = match self.ensure_destination(table).await {
            Ok(c) => c,
            Err(e) => return UnitOutcome::failed(table, e.to_string()),
        };
        if !created {
            if let Err(e) = self.reconcile_schema(table, &src_cols).await {
                return UnitOutcome::failed(table, e.to_string());
            }
        }

        let dest_cols = match self.dest.describe_table(table).await {
            Ok(c) => c,
            Err(e) => return UnitOutcome::failed(table, e.to_string()),
        };
        // Safe insert projection: source ∩ destination, in destination
        // column order.
        let common: Vec<String> = dest_cols
            .iter()
            .filter(|d| src_cols.iter().any(|s| s.name == d.name))
            .map(|d| d.name.clone())
            .collect();
        if common.is_empty() {
            return UnitOutcome::failed(table, "no common columns between source and destination");
        }

        let cursor_col = match self.pick_cursor_column(spec, &src_cols) {
            Some(c) => c,
            None => {
                // No monotonic column: full-copy-only mode, explicitly
                // flagged. Only a freshly created destination gets a copy.
                if created {
                    return match self.full_copy(table, &common).await {
                        Ok(n) => UnitOutcome::succeeded(
                            table,
                            n,
                            "full-copy-only (no cursor column)",
                        ),
                        Err(e) => UnitOutcome::failed(table, e.to_string()),
                    };
                }
                return UnitOutcome::skipped(table, "no cursor column; full-copy-only table");
            }
        };
        if !common.iter().any(|c| c == &cursor_col) {
            return UnitOutcome::failed(
                table,
                format!("cursor column {} missing from destination", cursor_col),
            );
        }

        let start = match self.cursors.get(table) {
            Ok(Some(c)) if c.cursor_column == cursor_col => Some(c.last_value),
            Ok(_) => {
                // First run against this table (or a cursor-column change):
                // bootstrap from what the destination already holds.
                match self.dest.max_value(table, &cursor_col).await {
                    Ok(v) => v,
                    Err(e) => return UnitOutcome::failed(table, e.to_string()),
                }
            }
            Err(e) => return UnitOutcome::failed(table, e.to_string()),
        };

        match self.pull_windows(table, &common, &cursor_col, start).await {
            Ok(total) => {
                if total > 0 {
                    log::info!("✅ [{}] synced {} new rows", table, total);
                } else {
                    log::debug!("📥 [{}] up to date", table);
                }
                UnitOutcome::succeeded(table, total, "")
            }
            Err(e) => {
                log::error!("❌ [{}] sync failed, cursor untouched: {}", table, e);
                UnitOutcome::failed(table, e.to_string())
            }
        }
    }

    async fn ensure_destination(&self, table: &str) -> Result<bool, StoreError> {
        if self.dest.table_exists(table).await? {
            return Ok(false);
        }
        log::info!("🆕 [{}] destination missing; creating from source schema", table);
        let ddl = self.source.show_create(table).await?;
        self.dest
            .execute_ddl(&normalize_create_statement(&ddl))
            .await?;
        Ok(true)
    }

    /// Additive drift is applied; destructive drift fails loudly.
    async fn reconcile_schema(&self, table: &str, src_cols: &[ColumnDef]) -> Result<(), StoreError> {
        let dest_cols = self.dest.describe_table(table).await?;
        for dest_col in &dest_cols {
            match src_cols.iter().find(|s| s.name == dest_col.name) {
                None => {
                    return Err(StoreError::Schema(format!(
                        "column {} was removed on source; refusing destructive alteration",
                        dest_col.name
                    )));
                }
                Some(src_col)
                    if !src_col.type_name.eq_ignore_ascii_case(&dest_col.type_name) =>
                {
                    return Err(StoreError::Schema(format!(
                        "column {} changed type on source ({} -> {}); refusing alteration",
                        dest_col.name, dest_col.type_name, src_col.type_name
                    )));
                }
                _ => {}
            }
        }
        for src_col in src_cols {
            if !dest_cols.iter().any(|d| d.name == src_col.name) {
                log::info!(
                    "🔧 [{}] new source column {} {}; altering destination additively",
                    table,
                    src_col.name,
                    src_col.type_name
                );
                self.dest
                    .execute_ddl(&format!(
                        "ALTER TABLE {} ADD COLUMN {} {}",
                        table, src_col.name, src_col.type_name
                    ))
                    .await?;
            }
        }
        Ok(())
    }

    fn pick_cursor_column(&self, spec: &TableSpec, src_cols: &[ColumnDef]) -> Option<String> {
        if let Some(col) = &spec.cursor_override {
            if src_cols.iter().any(|c| &c.name == col) {
                return Some(col.clone());
            }
            log::warn!(
                "⚠️  [{}] override cursor column {} not on source; inferring instead",
                spec.name,
                col
            );
        }
        let inferred = infer_cursor_column(src_cols);
        if let Some(col) = &inferred {
            log::debug!("📐 [{}] inferred cursor column: {}", spec.name, col);
        }
        inferred
    }

    async fn full_copy(&self, table: &str, columns: &[String]) -> Result<u64, StoreError> {
        let rows = self.source.select_all(table, columns).await?;
        let n = rows.len() as u64;
        self.dest.insert_rows(table, columns, &rows).await?;
        log::info!("✅ [{}] full copy of {} rows", table, n);
        Ok(n)
    }

    /// Bounded windowed pull loop. Commit-before-advance: the cursor moves
    /// only after the destination insert succeeded, and never past the max
    /// value actually inserted.
    async fn pull_windows(
        &self,
        table: &str,
        columns: &[String],
        cursor_col: &str,
        start: Option<Value>,
    ) -> Result<u64, SyncError> {
        let ci = match columns.iter().position(|c| c == cursor_col) {
            Some(i) => i,
            None => {
                return Err(SyncError::SchemaMismatch(format!(
                    "cursor column {} missing from projection",
                    cursor_col
                )))
            }
        };
        let mut after = start;
        let mut total = 0u64;

        loop {
            let rows = self
                .source
                .select_after(table, columns, cursor_col, after.as_ref(), self.window_rows)
                .await?;
            if rows.is_empty() {
                break;
            }
            let full = rows.len() as u64 >= self.window_rows;
            let window_max = max_cursor_value(&rows, ci);

            let batch: Vec<Row> = if full {
                // A full window may cut through rows sharing the max value;
                // holding those back (or refetching them by equality when
                // the whole window is one value) keeps the boundary
                // loss-free with a strict `>` predicate.
                let held_back: Vec<Row> = rows
                    .iter()
                    .filter(|r| r[ci].cmp_same(&window_max) == Some(Ordering::Less))
                    .cloned()
                    .collect();
                if held_back.is_empty() {
                    self.source
                        .select_equal(table, columns, cursor_col, &window_max)
                        .await?
                } else {
                    held_back
                }
            } else {
                rows
            };
            if batch.is_empty() {
                break;
            }
            let batch_max = max_cursor_value(&batch, ci);

            self.dest.insert_rows(table, columns, &batch).await?;
            self.cursors.advance(table, cursor_col, &batch_max)?;

            total += batch.len() as u64;
            after = Some(batch_max);
            if !full {
                break;
            }
        }
        Ok(total)
    }
}

fn max_cursor_value(rows: &[Row], ci: usize) -> Value {
    let mut max = rows[0][ci].clone();
    for row in rows.iter().skip(1) {
        if row[ci].cmp_same(&max) == Some(Ordering::Greater) {
            max = row[ci].clone();
        }
    }
    max
}
