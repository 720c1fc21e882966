//! Reverse replication task - far store down to the near store.
//!
//! Scheduled daily. Tables come from `DOWNSYNC_TABLES` or are discovered
//! from the source; each table keeps its own monotonic cursor in the local
//! state database, so overlapping or repeated invocations never replay
//! already-applied rows beyond the last committed window.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin downsync [-- --table=trades --dry-run]
//! ```

use telesync::config::{arg_value, has_flag, Config, TargetConfig};
use telesync::cursor::CursorStore;
use telesync::lease::LeaseStore;
use telesync::outcome::{summarize, UnitOutcome};
use telesync::replicate::{default_cursor_override, Replicator, TableSpec};
use telesync::store::{AnalyticalStore, ClickHouseStore, StoreError};

const TASK: &str = "downsync";

fn open_store(config: &TargetConfig) -> Result<ClickHouseStore, Box<dyn std::error::Error>> {
    Ok(ClickHouseStore::new(
        &config.host,
        config.port,
        &config.user,
        &config.password,
        &config.database,
        config.secure,
    )?)
}

async fn run_cycle(config: &Config, args: &[String]) -> Result<Vec<UnitOutcome>, Box<dyn std::error::Error>> {
    let only_table = arg_value(args, "table");
    let dry_run = has_flag(args, "dry-run");

    let source = open_store(&config.far)?;
    let dest = open_store(&config.near)?;
    if let Err(e) = dest.ensure_schema().await {
        log::warn!("⚠️  destination schema check failed: {}", e);
    }
    let cursors = CursorStore::open(&config.state_db)?;
    let replicator = Replicator::new(&source, &dest, &cursors, config.sync_window_rows);

    let mut tables: Vec<TableSpec> = if config.downsync_tables.is_empty() {
        match replicator.discover_tables().await {
            Ok(t) => t,
            Err(StoreError::Transport(e)) => {
                // Source unreachable: skip the cycle, cursors untouched.
                log::warn!("⚠️  [{}] source unreachable, skipping cycle: {}", TASK, e);
                return Ok(vec![UnitOutcome::skipped("discovery", e)]);
            }
            Err(e) => return Err(e.into()),
        }
    } else {
        config
            .downsync_tables
            .iter()
            .map(|spec| TableSpec {
                name: spec.name.clone(),
                cursor_override: spec
                    .cursor_override
                    .clone()
                    .or_else(|| default_cursor_override(&spec.name).map(String::from)),
            })
            .collect()
    };
    if let Some(only) = &only_table {
        tables.retain(|t| &t.name == only);
        if tables.is_empty() {
            return Err(format!("table {} not in the downsync set", only).into());
        }
    }

    log::info!(
        "🚀 [{}] syncing {} tables (window {} rows{})",
        TASK,
        tables.len(),
        config.sync_window_rows,
        if dry_run { ", dry-run" } else { "" }
    );

    Ok(replicator.run(&tables, dry_run).await)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config = Config::from_env()?;

    let mut leases = LeaseStore::open(&config.state_db)?;
    let handle = match leases.acquire(TASK, config.lease_ttl_secs)? {
        Some(h) => h,
        None => return Ok(()),
    };
    leases.record_start(TASK)?;

    let code = match run_cycle(&config, &args).await {
        Ok(outcomes) => summarize(TASK, &outcomes),
        Err(e) => {
            log::error!("❌ [{}] fatal: {}", TASK, e);
            1
        }
    };
    if code == 0 {
        leases.record_success(TASK)?;
    }
    leases.release(&handle)?;
    std::process::exit(code);
}
