//! Flush engine - drains staged batches into both analytical targets.
//!
//! Per stream, batches are applied strictly in creation order to each
//! target: primary first, then secondary, deleting the batch file only
//! once both have confirmed. A target failure blocks that target for the
//! rest of the stream's drain (order preservation) but never the other
//! target and never other streams; the batch simply stays at its last
//! durable state and the next scheduled drain retries it. Re-applying a
//! batch after a crash is safe because targets expose replace-on-key
//! semantics for dedup-keyed streams, and compaction runs after writes.
//!
//! Schema-level rejections are not retried: the whole batch is renamed
//! into quarantine for operator inspection.

use crate::outcome::{SyncError, UnitOutcome};
use crate::registry::{self, StreamDef};
use crate::staging::{BatchState, StagingBuffer};
use crate::store::{StoreError, Target, TargetRole};

pub struct FlushEngine<'a> {
    staging: &'a mut StagingBuffer,
    targets: &'a [Target],
}

struct TargetState<'a> {
    target: &'a Target,
    /// First failure this drain; later batches skip this target.
    blocked: Option<StoreError>,
    wrote: bool,
}

impl<'a> FlushEngine<'a> {
    pub fn new(staging: &'a mut StagingBuffer, targets: &'a [Target]) -> Self {
        Self { staging, targets }
    }

    fn target(&self, role: TargetRole) -> Option<&'a Target> {
        self.targets.iter().find(|t| t.role == role)
    }

    /// Drain every pending batch of one stream.
    pub async fn drain(&mut self, def: &StreamDef) -> UnitOutcome {
        let primary = match self.target(TargetRole::Primary) {
            Some(t) => t,
            None => return UnitOutcome::failed(def.name, "no primary target configured"),
        };
        let secondary = match self.target(TargetRole::Secondary) {
            Some(t) => t,
            None => return UnitOutcome::failed(def.name, "no secondary target configured"),
        };

        let pending = match self.staging.list_pending(def.name) {
            Ok(p) => p,
            Err(e) => return UnitOutcome::failed(def.name, e.to_string()),
        };
        if pending.is_empty() {
            return UnitOutcome::succeeded(def.name, 0, "nothing to flush");
        }
        log::info!("🔄 [{}] draining {} pending batches", def.name, pending.len());

        let mut primary_state = TargetState {
            target: primary,
            blocked: None,
            wrote: false,
        };
        let mut secondary_state = TargetState {
            target: secondary,
            blocked: None,
            wrote: false,
        };
        for state in [&mut primary_state, &mut secondary_state] {
            if let Err(e) = ensure_table(state.target, def).await {
                log::warn!(
                    "⚠️  [{}] {} target unavailable: {}",
                    def.name,
                    state.target.role,
                    e
                );
                state.blocked = Some(e);
            }
        }

        let mut rows_flushed = 0u64;
        let mut batches_flushed = 0usize;
        let mut quarantined: Vec<SyncError> = Vec::new();
        let mut local_error: Option<String> = None;

        for mut batch in pending {
            let file = match self.staging.load(&batch) {
                Ok(f) => f,
                Err(crate::staging::StagingError::Corrupt(e)) => {
                    let seq = batch.seq;
                    if let Err(qe) = self.staging.quarantine(batch, &e) {
                        local_error = Some(qe.to_string());
                        break;
                    }
                    quarantined.push(SyncError::Quarantined {
                        stream: def.name.to_string(),
                        batch: format!("seq={}", seq),
                        reason: e,
                    });
                    continue;
                }
                Err(e) => {
                    local_error = Some(e.to_string());
                    break;
                }
            };
            let rows = file.rows();

            if batch.state == BatchState::Staged {
                if primary_state.blocked.is_some() {
                    // Creation-order visibility: nothing later may reach the
                    // primary before this batch does.
                    continue;
                }
                match primary_state
                    .target
                    .store
                    .insert_rows(def.target_table, &file.columns, &rows)
                    .await
                {
                    Ok(()) => {
                        if let Err(e) = self.staging.mark(&mut batch, BatchState::FlushedPrimary) {
                            local_error = Some(e.to_string());
                            break;
                        }
                        primary_state.wrote = true;
                    }
                    Err(e) if e.is_schema() => {
                        let seq = batch.seq;
                        if let Err(qe) = self.staging.quarantine(batch, &e.to_string()) {
                            local_error = Some(qe.to_string());
                            break;
                        }
                        quarantined.push(SyncError::Quarantined {
                            stream: def.name.to_string(),
                            batch: format!("seq={}", seq),
                            reason: e.to_string(),
                        });
                        continue;
                    }
                    Err(e) => {
                        log::warn!(
                            "⚠️  [{}] primary write failed for batch seq={}: {}",
                            def.name,
                            batch.seq,
                            e
                        );
                        primary_state.blocked = Some(e);
                        continue;
                    }
                }
            }

            // Primary confirmed (now or in an earlier cycle).
            if secondary_state.blocked.is_some() {
                continue;
            }
            match secondary_state
                .target
                .store
                .insert_rows(def.target_table, &file.columns, &rows)
                .await
            {
                Ok(()) => {
                    secondary_state.wrote = true;
                    rows_flushed += rows.len() as u64;
                    batches_flushed += 1;
                    if let Err(e) = self.staging.delete(batch) {
                        local_error = Some(e.to_string());
                        break;
                    }
                }
                Err(e) if e.is_schema() => {
                    let seq = batch.seq;
                    if let Err(qe) = self.staging.quarantine(batch, &e.to_string()) {
                        local_error = Some(qe.to_string());
                        break;
                    }
                    quarantined.push(SyncError::Quarantined {
                        stream: def.name.to_string(),
                        batch: format!("seq={}", seq),
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    log::warn!(
                        "⚠️  [{}] secondary write failed for batch seq={}: {}",
                        def.name,
                        batch.seq,
                        e
                    );
                    secondary_state.blocked = Some(e);
                }
            }
        }

        // Post-write compaction for latest-wins streams. Asynchronous from
        // the engine's point of view: failure is logged, never fatal.
        if def.is_dedup() {
            for state in [&primary_state, &secondary_state] {
                if state.wrote && state.blocked.is_none() {
                    if let Err(e) = state.target.store.optimize_table(def.target_table).await {
                        log::warn!(
                            "⚠️  [{}] compaction on {} target failed (non-fatal): {}",
                            def.name,
                            state.target.role,
                            e
                        );
                    }
                }
            }
        }

        let mut problems: Vec<String> = Vec::new();
        if let Some(e) = local_error {
            problems.push(format!("local storage: {}", e));
        }
        if let Some(e) = primary_state.blocked.take() {
            problems.push(format!("primary: {}", SyncError::from(e)));
        }
        if let Some(e) = secondary_state.blocked.take() {
            problems.push(format!("secondary: {}", SyncError::from(e)));
        }
        for q in &quarantined {
            problems.push(q.to_string());
        }

        if problems.is_empty() {
            log::info!(
                "✅ [{}] flushed {} batches ({} rows) to both targets",
                def.name,
                batches_flushed,
                rows_flushed
            );
            UnitOutcome::succeeded(
                def.name,
                rows_flushed,
                format!("{} batches", batches_flushed),
            )
        } else {
            UnitOutcome::failed(def.name, problems.join("; "))
        }
    }

    /// Drain every stream (or one, with `--stream`). One stream's failure
    /// never aborts the others.
    pub async fn drain_all(&mut self, only_stream: Option<&str>) -> Vec<UnitOutcome> {
        let mut outcomes = Vec::new();
        for def in registry::all_streams() {
            if let Some(only) = only_stream {
                if only != def.name {
                    continue;
                }
            }
            outcomes.push(self.drain(def).await);
        }
        outcomes
    }

    /// Dry-run view: pending batch/row counts, no writes.
    pub fn pending_summary(&self, only_stream: Option<&str>) -> Vec<UnitOutcome> {
        let mut outcomes = Vec::new();
        for def in registry::all_streams() {
            if let Some(only) = only_stream {
                if only != def.name {
                    continue;
                }
            }
            match self.staging.list_pending(def.name) {
                Ok(pending) => {
                    let rows: u64 = pending
                        .iter()
                        .filter_map(|b| self.staging.load(b).ok())
                        .map(|f| f.row_count() as u64)
                        .sum();
                    outcomes.push(UnitOutcome::succeeded(
                        def.name,
                        rows,
                        format!("dry-run: {} batches pending", pending.len()),
                    ));
                }
                Err(e) => outcomes.push(UnitOutcome::failed(def.name, e.to_string())),
            }
        }
        outcomes
    }
}

async fn ensure_table(target: &Target, def: &StreamDef) -> Result<(), StoreError> {
    if !target.store.table_exists(def.target_table).await? {
        log::info!(
            "🔧 [{}] creating table {} on {} target",
            def.name,
            def.target_table,
            target.role
        );
        target.store.create_stream_table(def).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::OutcomeStatus;
    use crate::schema::{Row, Value};
    use crate::store::{AnalyticalStore, SqliteStore};
    use std::sync::Arc;
    use tempfile::tempdir;

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

    fn targets(dir: &std::path::Path) -> (Vec<Target>, Arc<SqliteStore>, Arc<SqliteStore>) {
        let near = Arc::new(SqliteStore::open(dir.join("near.db")).unwrap());
        let far = Arc::new(SqliteStore::open(dir.join("far.db")).unwrap());
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
    async fn test_drain_reaches_both_targets_and_clears_staging() {
        let dir = tempdir().unwrap();
        let def = registry::stream("trades").unwrap();
        let mut staging = StagingBuffer::open(dir.path().join("buffer")).unwrap();
        staging
            .append(def, vec![trade_row("BTC", 1000, 1), trade_row("ETH", 2000, 2)])
            .unwrap();

        let (targets, near, far) = targets(dir.path());
        let mut engine = FlushEngine::new(&mut staging, &targets);
        let outcome = engine.drain(def).await;
        assert_eq!(outcome.status, OutcomeStatus::Succeeded);
        assert_eq!(outcome.rows, 2);

        let cols = def.column_names();
        assert_eq!(near.select_all("trades", &cols).await.unwrap().len(), 2);
        assert_eq!(far.select_all("trades", &cols).await.unwrap().len(), 2);
        assert!(staging.list_pending("trades").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_keys_collapse_after_flush() {
        // [(BTC,t1,1), (BTC,t1,1), (ETH,t2,2)] collapses to 2 logical rows.
        let dir = tempdir().unwrap();
        let def = registry::stream("trades").unwrap();
        let mut staging = StagingBuffer::open(dir.path().join("buffer")).unwrap();
        staging
            .append(
                def,
                vec![
                    trade_row("BTC", 1000, 1),
                    trade_row("BTC", 1000, 1),
                    trade_row("ETH", 2000, 2),
                ],
            )
            .unwrap();

        let (targets, near, _far) = targets(dir.path());
        let mut engine = FlushEngine::new(&mut staging, &targets);
        let outcome = engine.drain(def).await;
        assert_eq!(outcome.status, OutcomeStatus::Succeeded);

        let rows = near.select_all("trades", &def.column_names()).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_schema_mismatch_quarantines_batch() {
        let dir = tempdir().unwrap();
        let def = registry::stream("trades").unwrap();
        let mut staging = StagingBuffer::open(dir.path().join("buffer")).unwrap();
        staging.append(def, vec![trade_row("BTC", 1000, 1)]).unwrap();

        let (targets, near, _far) = targets(dir.path());
        // Pre-create a drifted table on the primary: inserts must fail as a
        // schema error, not a retryable one.
        near.execute_ddl("CREATE TABLE trades (coin TEXT)").await.unwrap();

        let mut engine = FlushEngine::new(&mut staging, &targets);
        let outcome = engine.drain(def).await;
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.detail.contains("quarantined"));

        // Batch is preserved under quarantine/, not pending and not deleted.
        assert!(staging.list_pending("trades").unwrap().is_empty());
        let qdir = dir.path().join("buffer").join("quarantine");
        assert_eq!(std::fs::read_dir(qdir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_redrain_after_flush_is_idempotent() {
        let dir = tempdir().unwrap();
        let def = registry::stream("trades").unwrap();
        let mut staging = StagingBuffer::open(dir.path().join("buffer")).unwrap();
        staging.append(def, vec![trade_row("BTC", 1000, 1)]).unwrap();

        let (targets, near, _far) = targets(dir.path());
        {
            let mut engine = FlushEngine::new(&mut staging, &targets);
            engine.drain(def).await;
        }
        // Same batch appended again (at-least-once delivery upstream).
        staging.append(def, vec![trade_row("BTC", 1000, 1)]).unwrap();
        {
            let mut engine = FlushEngine::new(&mut staging, &targets);
            let outcome = engine.drain(def).await;
            assert_eq!(outcome.status, OutcomeStatus::Succeeded);
        }

        let rows = near.select_all("trades", &def.column_names()).await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
