//! End-to-end tests across staging, flush and replication.
//!
//! Targets are embedded SQLite stores wrapped in a switchable fault
//! injector, so "secondary down for two cycles" and "killed mid-flush"
//! run as real drains against real files.

use crate::cursor::CursorStore;
use crate::fetch::{run_fetch, FetchConfig};
use crate::flush::FlushEngine;
use crate::outcome::OutcomeStatus;
use crate::registry;
use crate::replicate::{Replicator, TableSpec};
use crate::schema::{Row, Value};
use crate::staging::StagingBuffer;
use crate::store::{AnalyticalStore, ColumnDef, SqliteStore, StoreError, Target, TargetRole};
use crate::venue::{
    Candle, ClearinghouseState, Fill, FundingEvent, LedgerEvent, OrderStatus, VenueApi,
    VenueError, VenueMeta,
};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

/// SQLite store behind a kill switch: while "down" every call fails with a
/// transport error, like an unreachable target.
struct FlakyStore {
    inner: SqliteStore,
    down: AtomicBool,
    /// Per insert call: (table, trailing UInt ids) for ordering assertions.
    inserts: Mutex<Vec<(String, Vec<u64>)>>,
}

impl FlakyStore {
    fn open(path: impl AsRef<Path>) -> Self {
        Self {
            inner: SqliteStore::open(path).unwrap(),
            down: AtomicBool::new(false),
            inserts: Mutex::new(Vec::new()),
        }
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Transport("connection refused".into()))
        } else {
            Ok(())
        }
    }

    fn insert_log(&self, table: &str) -> Vec<Vec<u64>> {
        self.inserts
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, ids)| ids.clone())
            .collect()
    }
}

#[async_trait]
impl AnalyticalStore for FlakyStore {
    fn backend_type(&self) -> &'static str {
        "FlakySQLite"
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.check()?;
        self.inner.ensure_schema().await
    }

    async fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Row],
    ) -> Result<(), StoreError> {
        self.check()?;
        let ids = rows
            .iter()
            .filter_map(|r| {
                r.iter().rev().find_map(|v| match v {
                    Value::UInt(u) => Some(*u),
                    _ => None,
                })
            })
            .collect();
        self.inserts
            .lock()
            .unwrap()
            .push((table.to_string(), ids));
        self.inner.insert_rows(table, columns, rows).await
    }

    async fn optimize_table(&self, table: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.optimize_table(table).await
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.table_exists(table).await
    }

    async fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        self.check()?;
        self.inner.list_tables().await
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnDef>, StoreError> {
        self.check()?;
        self.inner.describe_table(table).await
    }

    async fn show_create(&self, table: &str) -> Result<String, StoreError> {
        self.check()?;
        self.inner.show_create(table).await
    }

    async fn execute_ddl(&self, sql: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.execute_ddl(sql).await
    }

    async fn create_stream_table(&self, def: &crate::registry::StreamDef) -> Result<(), StoreError> {
        self.check()?;
        self.inner.create_stream_table(def).await
    }

    async fn max_value(&self, table: &str, column: &str) -> Result<Option<Value>, StoreError> {
        self.check()?;
        self.inner.max_value(table, column).await
    }

    async fn select_after(
        &self,
        table: &str,
        columns: &[String],
        cursor_column: &str,
        after: Option<&Value>,
        limit: u64,
    ) -> Result<Vec<Row>, StoreError> {
        self.check()?;
        self.inner
            .select_after(table, columns, cursor_column, after, limit)
            .await
    }

    async fn select_equal(
        &self,
        table: &str,
        columns: &[String],
        cursor_column: &str,
        value: &Value,
    ) -> Result<Vec<Row>, StoreError> {
        self.check()?;
        self.inner
            .select_equal(table, columns, cursor_column, value)
            .await
    }

    async fn select_all(&self, table: &str, columns: &[String]) -> Result<Vec<Row>, StoreError> {
        self.check()?;
        self.inner.select_all(table, columns).await
    }
}

fn trade_row(coin: &str, time_ms: i64, tid: u64) -> Row {
    vec![
        Value::Str(coin.into()),
        Value::Str("B".into()),
        Value::Float(100.0),
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

fn flaky_targets(dir: &Path) -> (Vec<Target>, Arc<FlakyStore>, Arc<FlakyStore>) {
    let near = Arc::new(FlakyStore::open(dir.join("near.db")));
    let far = Arc::new(FlakyStore::open(dir.join("far.db")));
    let targets = vec![
        Target {
            role: TargetRole::Primary,
            store: near.clone(),
        },
        Target {
            role: TargetRole::Secondary,
            store: far.clone(),
        },
    ];
    (targets, near, far)
}

#[tokio::test]
async fn test_secondary_down_for_two_cycles_then_converges_in_order() {
    let dir = tempdir().unwrap();
    let def = registry::stream("trades").unwrap();
    let mut staging = StagingBuffer::open(dir.path().join("buffer")).unwrap();
    let (targets, near, far) = flaky_targets(dir.path());
    let cols = def.column_names();

    far.set_down(true);

    // Cycles 1 and 2: batches keep arriving, secondary unreachable.
    for cycle in 0..2i64 {
        for b in 0..2i64 {
            let n = cycle * 2 + b;
            staging
                .append(def, vec![trade_row("BTC", 1000 + n, (n + 1) as u64)])
                .unwrap();
        }
        let mut engine = FlushEngine::new(&mut staging, &targets);
        let outcome = engine.drain(def).await;
        assert_eq!(outcome.status, OutcomeStatus::Failed);
    }
    // Fifth batch lands before the recovery cycle.
    staging.append(def, vec![trade_row("BTC", 1004, 5)]).unwrap();

    // Primary already converged on everything it has seen.
    assert_eq!(near.inner.select_all("trades", &cols).await.unwrap().len(), 4);
    assert_eq!(staging.list_pending("trades").unwrap().len(), 5);

    // Cycle 3: secondary restored - all 5 batches flow in original order.
    far.set_down(false);
    let mut engine = FlushEngine::new(&mut staging, &targets);
    let outcome = engine.drain(def).await;
    assert_eq!(outcome.status, OutcomeStatus::Succeeded);

    assert_eq!(near.inner.select_all("trades", &cols).await.unwrap().len(), 5);
    assert_eq!(far.inner.select_all("trades", &cols).await.unwrap().len(), 5);
    assert!(staging.list_pending("trades").unwrap().is_empty());

    // Secondary saw the batches oldest-first, one insert per batch.
    let order: Vec<u64> = far
        .insert_log("trades")
        .iter()
        .map(|ids| ids[0])
        .collect();
    assert_eq!(order, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_crash_between_write_and_mark_is_idempotent() {
    let dir = tempdir().unwrap();
    let def = registry::stream("trades").unwrap();
    let mut staging = StagingBuffer::open(dir.path().join("buffer")).unwrap();
    let (targets, near, far) = flaky_targets(dir.path());
    let cols = def.column_names();

    staging.append(def, vec![trade_row("BTC", 1000, 1)]).unwrap();

    // Cycle 1: secondary down, so the batch parks at flushed_primary.
    far.set_down(true);
    {
        let mut engine = FlushEngine::new(&mut staging, &targets);
        engine.drain(def).await;
    }
    let pending = staging.list_pending("trades").unwrap();
    assert_eq!(pending.len(), 1);

    // Simulate a crash that happened after the primary write but before
    // the durable mark: the batch is back in `staged` while the primary
    // already holds its rows.
    let parked = &pending[0];
    let reverted = parked
        .path
        .with_file_name(format!("{}.staged.json", parked.stem()));
    std::fs::rename(&parked.path, &reverted).unwrap();

    // Restarted run with both targets up: same destination state as an
    // uninterrupted run.
    far.set_down(false);
    let mut engine = FlushEngine::new(&mut staging, &targets);
    let outcome = engine.drain(def).await;
    assert_eq!(outcome.status, OutcomeStatus::Succeeded);

    assert_eq!(near.inner.select_all("trades", &cols).await.unwrap().len(), 1);
    assert_eq!(far.inner.select_all("trades", &cols).await.unwrap().len(), 1);
    assert!(staging.list_pending("trades").unwrap().is_empty());
    // Primary was written twice - visible state must not show it.
    assert_eq!(near.insert_log("trades").len(), 2);
}

#[tokio::test]
async fn test_primary_failure_preserves_order_for_later_batches() {
    let dir = tempdir().unwrap();
    let def = registry::stream("trades").unwrap();
    let mut staging = StagingBuffer::open(dir.path().join("buffer")).unwrap();
    let (targets, near, _far) = flaky_targets(dir.path());

    staging.append(def, vec![trade_row("BTC", 1000, 1)]).unwrap();
    near.set_down(true);
    {
        let mut engine = FlushEngine::new(&mut staging, &targets);
        assert_eq!(engine.drain(def).await.status, OutcomeStatus::Failed);
    }
    staging.append(def, vec![trade_row("BTC", 1001, 2)]).unwrap();

    near.set_down(false);
    let mut engine = FlushEngine::new(&mut staging, &targets);
    assert_eq!(engine.drain(def).await.status, OutcomeStatus::Succeeded);

    // tid 1 must reach the primary before tid 2.
    let order: Vec<u64> = near
        .insert_log("trades")
        .iter()
        .map(|ids| ids[0])
        .collect();
    assert_eq!(order, vec![1, 2]);
}

#[tokio::test]
async fn test_cursor_never_regresses_across_failed_cycles() {
    let dir = tempdir().unwrap();
    let source = SqliteStore::open(dir.path().join("src.db")).unwrap();
    let dest = FlakyStore::open(dir.path().join("dst.db"));
    let cursors = CursorStore::open(dir.path().join("state.db")).unwrap();

    source
        .execute_ddl("CREATE TABLE metrics (ts DATETIME, v REAL)")
        .await
        .unwrap();
    let cols = vec!["ts".to_string(), "v".to_string()];
    let seed: Vec<Row> = (1..=5)
        .map(|i| vec![Value::Int(i), Value::Float(i as f64)])
        .collect();
    source.insert_rows("metrics", &cols, &seed).await.unwrap();

    let spec = TableSpec::parse("metrics:ts");
    let mut watermarks: Vec<i64> = Vec::new();
    let record = |cursors: &CursorStore, watermarks: &mut Vec<i64>| {
        if let Some(c) = cursors.get("metrics").unwrap() {
            if let Value::Int(v) = c.last_value {
                watermarks.push(v);
            }
        }
    };

    // Destination down: failed cycle, cursor untouched.
    dest.set_down(true);
    {
        let replicator = Replicator::new(&source, &dest, &cursors, 2);
        assert_eq!(
            replicator.sync_table(&spec).await.status,
            OutcomeStatus::Failed
        );
    }
    record(&cursors, &mut watermarks);

    dest.set_down(false);
    {
        let replicator = Replicator::new(&source, &dest, &cursors, 2);
        assert_eq!(
            replicator.sync_table(&spec).await.status,
            OutcomeStatus::Succeeded
        );
    }
    record(&cursors, &mut watermarks);

    let more: Vec<Row> = (6..=8)
        .map(|i| vec![Value::Int(i), Value::Float(i as f64)])
        .collect();
    source.insert_rows("metrics", &cols, &more).await.unwrap();

    dest.set_down(true);
    {
        let replicator = Replicator::new(&source, &dest, &cursors, 2);
        assert_eq!(
            replicator.sync_table(&spec).await.status,
            OutcomeStatus::Failed
        );
    }
    record(&cursors, &mut watermarks);

    dest.set_down(false);
    {
        let replicator = Replicator::new(&source, &dest, &cursors, 2);
        let outcome = replicator.sync_table(&spec).await;
        assert_eq!(outcome.status, OutcomeStatus::Succeeded);
    }
    record(&cursors, &mut watermarks);

    // Non-decreasing at every observation, ending at the source max.
    assert!(watermarks.windows(2).all(|w| w[0] <= w[1]), "{:?}", watermarks);
    assert_eq!(watermarks.last(), Some(&8));
    assert_eq!(
        dest.inner.select_all("metrics", &cols).await.unwrap().len(),
        8
    );
}

/// Canned venue for the fetch -> stage -> flush path.
struct FakeVenue;

#[async_trait]
impl VenueApi for FakeVenue {
    async fn clearinghouse_state(&self, _user: &str) -> Result<ClearinghouseState, VenueError> {
        let mut state = ClearinghouseState::default();
        state.margin_summary.account_value = "1000.0".into();
        state.withdrawable = "900.0".into();
        Ok(state)
    }

    async fn user_fills(&self, _user: &str) -> Result<Vec<Fill>, VenueError> {
        let mut a = Fill::default();
        a.coin = "BTC".into();
        a.px = "100.0".into();
        a.sz = "1".into();
        a.time = 1_700_000_000_000;
        a.tid = Some(1);
        let mut b = a.clone();
        b.coin = "ETH".into();
        b.time = 1_700_000_001_000;
        b.tid = Some(2);
        Ok(vec![a.clone(), a, b])
    }

    async fn historical_orders(&self, _user: &str) -> Result<Vec<OrderStatus>, VenueError> {
        Ok(Vec::new())
    }

    async fn user_funding(
        &self,
        _user: &str,
        _start_ms: i64,
    ) -> Result<Vec<FundingEvent>, VenueError> {
        Ok(Vec::new())
    }

    async fn ledger_updates(
        &self,
        _user: &str,
        _start_ms: i64,
    ) -> Result<Vec<LedgerEvent>, VenueError> {
        Ok(Vec::new())
    }

    async fn candles(
        &self,
        _coin: &str,
        _interval: &str,
        _start_ms: i64,
        _end_ms: i64,
    ) -> Result<Vec<Candle>, VenueError> {
        Ok(Vec::new())
    }

    async fn meta(&self) -> Result<VenueMeta, VenueError> {
        Ok(VenueMeta::default())
    }
}

#[tokio::test]
async fn test_fetch_stage_flush_pipeline() {
    let dir = tempdir().unwrap();
    let mut staging = StagingBuffer::open(dir.path().join("buffer")).unwrap();
    let fetch_config = FetchConfig {
        addresses: vec!["0xaddr".to_string()],
        candle_coins: Vec::new(),
        lookback_days: 30,
        min_notional_usd: 10.0,
    };

    let outcomes = run_fetch(&FakeVenue, &mut staging, &fetch_config, Some("trades"), false).await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, OutcomeStatus::Succeeded);
    assert_eq!(outcomes[0].rows, 3);

    let (targets, near, far) = flaky_targets(dir.path());
    let def = registry::stream("trades").unwrap();
    let mut engine = FlushEngine::new(&mut staging, &targets);
    let outcome = engine.drain(def).await;
    assert_eq!(outcome.status, OutcomeStatus::Succeeded);

    // The duplicated BTC fill collapses on its dedup key at both targets.
    let cols = def.column_names();
    assert_eq!(near.inner.select_all("trades", &cols).await.unwrap().len(), 2);
    assert_eq!(far.inner.select_all("trades", &cols).await.unwrap().len(), 2);
}
