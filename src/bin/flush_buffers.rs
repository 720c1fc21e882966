//! Flush task - staged batches to both analytical targets.
//!
//! Scheduled less frequently than the fetch task (e.g. every 3 hours) so
//! the far store is not woken on every ping. A batch file is deleted only
//! after both targets confirm; an unreachable target leaves its batches
//! in place for the next cycle without blocking the other target.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin flush_buffers [-- --stream=trades --dry-run]
//! ```

use std::sync::Arc;
use telesync::config::{arg_value, has_flag, Config, TargetConfig};
use telesync::flush::FlushEngine;
use telesync::lease::LeaseStore;
use telesync::outcome::{summarize, UnitOutcome};
use telesync::staging::StagingBuffer;
use telesync::store::{AnalyticalStore, ClickHouseStore, Target, TargetRole};

const TASK: &str = "flush_buffers";

fn open_target(config: &TargetConfig, role: TargetRole) -> Result<Target, Box<dyn std::error::Error>> {
    let store = ClickHouseStore::new(
        &config.host,
        config.port,
        &config.user,
        &config.password,
        &config.database,
        config.secure,
    )?;
    log::info!(
        "🔌 {} target: {} @ {}:{}/{}",
        role,
        store.backend_type(),
        config.host,
        config.port,
        config.database
    );
    Ok(Target {
        role,
        store: Arc::new(store),
    })
}

async fn run_cycle(config: &Config, args: &[String]) -> Result<Vec<UnitOutcome>, Box<dyn std::error::Error>> {
    let only_stream = arg_value(args, "stream");
    let dry_run = has_flag(args, "dry-run");

    let targets = vec![
        open_target(&config.near, TargetRole::Primary)?,
        open_target(&config.far, TargetRole::Secondary)?,
    ];
    let mut staging = StagingBuffer::open(&config.staging_dir)?;

    if dry_run {
        let engine = FlushEngine::new(&mut staging, &targets);
        return Ok(engine.pending_summary(only_stream.as_deref()));
    }

    for target in &targets {
        if let Err(e) = target.store.ensure_schema().await {
            // The drain will record this target as blocked per stream.
            log::warn!("⚠️  {} target schema check failed: {}", target.role, e);
        }
    }

    let mut engine = FlushEngine::new(&mut staging, &targets);
    Ok(engine.drain_all(only_stream.as_deref()).await)
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
