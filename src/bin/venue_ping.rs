//! Fetch task - venue APIs to staging buffer.
//!
//! Scheduled frequently (e.g. every 15 minutes). Buffer-only: this task
//! never talks to the analytical targets, so it keeps collecting telemetry
//! while either target is down.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin venue_ping [-- --stream=trades --lookback-window=7 --dry-run]
//! ```
//!
//! Exit code 0 on full success (and on a clean lease-contention skip),
//! non-zero if any stream failed.

use telesync::config::{arg_value, has_flag, Config};
use telesync::fetch::{run_fetch, FetchConfig};
use telesync::lease::LeaseStore;
use telesync::outcome::{summarize, UnitOutcome};
use telesync::staging::StagingBuffer;
use telesync::venue::InfoClient;

const TASK: &str = "venue_ping";

async fn run_cycle(config: &Config, args: &[String]) -> Result<Vec<UnitOutcome>, Box<dyn std::error::Error>> {
    if config.addresses.is_empty() {
        return Err("VENUE_ADDRESSES is empty; nothing to fetch".into());
    }

    let lookback_days = match arg_value(args, "lookback-window") {
        Some(raw) => raw.parse::<i64>().map_err(|_| format!("bad --lookback-window: {}", raw))?,
        None => config.lookback_days,
    };
    let only_stream = arg_value(args, "stream");
    let dry_run = has_flag(args, "dry-run");

    let venue = InfoClient::new(&config.venue_info_url)?;
    let mut staging = StagingBuffer::open(&config.staging_dir)?;
    let fetch_config = FetchConfig {
        addresses: config.addresses.clone(),
        candle_coins: config.candle_coins.clone(),
        lookback_days,
        min_notional_usd: config.min_notional_usd,
    };

    log::info!(
        "🚀 [{}] fetching {} streams for {} accounts (lookback {}d{})",
        TASK,
        only_stream.as_deref().unwrap_or("all"),
        config.addresses.len(),
        lookback_days,
        if dry_run { ", dry-run" } else { "" }
    );

    Ok(run_fetch(
        &venue,
        &mut staging,
        &fetch_config,
        only_stream.as_deref(),
        dry_run,
    )
    .await)
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
        // Expected concurrency-control outcome: another invocation is
        // still running. Skip the whole cycle, exit clean.
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
