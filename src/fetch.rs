//! Fetch adapter - venue records in, staged batches out.
//!
//! One invocation fetches every stream (or one, with `--stream`) for every
//! configured account address, flattens the typed venue records into
//! registry-schema rows and appends one batch per stream to the staging
//! buffer. This task never talks to the analytical targets; a venue
//! failure isolates to its stream and is simply retried on the next
//! scheduled run.

use crate::outcome::UnitOutcome;
use crate::registry::{self, StreamDef};
use crate::schema::{Row, Value};
use crate::staging::StagingBuffer;
use crate::venue::{ClearinghouseState, VenueApi, VenueError};

pub struct FetchConfig {
    pub addresses: Vec<String>,
    pub candle_coins: Vec<String>,
    pub lookback_days: i64,
    pub min_notional_usd: f64,
}

fn fnum(s: &str) -> f64 {
    s.parse().unwrap_or(0.0)
}

fn fnum_opt(s: Option<&String>) -> f64 {
    s.map(|v| fnum(v)).unwrap_or(0.0)
}

pub fn account_row(state: &ClearinghouseState, address: &str, ts_ms: i64) -> Row {
    vec![
        Value::DateTime(ts_ms),
        Value::Float(fnum(&state.margin_summary.account_value)),
        Value::Float(fnum(&state.margin_summary.total_margin_used)),
        Value::Float(fnum(&state.margin_summary.total_ntl_pos)),
        Value::Float(fnum(&state.margin_summary.total_raw_usd)),
        Value::Float(fnum(&state.cross_margin_summary.margin_used)),
        Value::Float(fnum(&state.withdrawable)),
        Value::Str(address.to_string()),
    ]
}

/// Zero-size positions are dropped - the snapshot records exposure, not
/// history.
pub fn position_rows(state: &ClearinghouseState, address: &str, ts_ms: i64) -> Vec<Row> {
    state
        .asset_positions
        .iter()
        .map(|ap| &ap.position)
        .filter(|p| fnum(&p.szi) != 0.0)
        .map(|p| {
            vec![
                Value::DateTime(ts_ms),
                Value::Str(p.coin.clone()),
                Value::Float(fnum(&p.szi)),
                Value::Float(fnum_opt(p.entry_px.as_ref())),
                Value::Float(fnum(&p.position_value)),
                Value::Float(fnum(&p.unrealized_pnl)),
                Value::Float(fnum(&p.return_on_equity)),
                Value::Float(fnum_opt(p.liquidation_px.as_ref())),
                Value::Float(p.leverage.value),
                Value::Int(p.max_leverage),
                Value::Float(fnum(&p.margin_used)),
                Value::Str(address.to_string()),
            ]
        })
        .collect()
}

pub fn fill_row(fill: &crate::venue::Fill, address: &str) -> Row {
    vec![
        Value::Str(fill.coin.clone()),
        Value::Str(fill.side.clone()),
        Value::Float(fnum(&fill.px)),
        Value::Float(fnum(&fill.sz)),
        Value::DateTime(fill.time),
        Value::Str(fill.hash.clone()),
        Value::Float(fnum(&fill.start_position)),
        Value::Str(fill.dir.clone()),
        Value::Float(fnum(&fill.closed_pnl)),
        Value::UInt(fill.oid),
        Value::Str(fill.cloid.clone().unwrap_or_default()),
        Value::Float(fnum(&fill.fee)),
        // Older fills lack a trade id; fall back to the timestamp like the
        // upstream feed does.
        Value::UInt(fill.tid.unwrap_or(fill.time.max(0) as u64)),
        Value::Str(address.to_string()),
    ]
}

pub fn order_row(order: &crate::venue::OrderStatus, address: &str) -> Row {
    let o = &order.order;
    vec![
        Value::Str(o.coin.clone()),
        Value::Str(o.side.clone()),
        Value::Float(fnum(&o.limit_px)),
        Value::Float(fnum(&o.sz)),
        Value::UInt(o.oid),
        Value::DateTime(o.timestamp),
        Value::Str(order.status.clone()),
        Value::Str(o.order_type.clone()),
        Value::Bool(o.reduce_only),
        Value::Str(address.to_string()),
    ]
}

pub fn funding_row(event: &crate::venue::FundingEvent, address: &str) -> Row {
    vec![
        Value::DateTime(event.time),
        Value::Str(event.delta.coin.clone()),
        Value::Float(fnum(&event.delta.usdc)),
        Value::Float(fnum(&event.delta.szi)),
        Value::Float(fnum(&event.delta.funding_rate)),
        Value::UInt(event.time.max(0) as u64),
        Value::Str(address.to_string()),
    ]
}

pub fn ledger_row(event: &crate::venue::LedgerEvent, address: &str) -> Row {
    let delta = &event.delta;
    let kind = delta
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let usdc = delta
        .get("usdc")
        .map(|v| match v {
            serde_json::Value::String(s) => fnum(s),
            other => other.as_f64().unwrap_or(0.0),
        })
        .unwrap_or(0.0);
    let coin = delta.get("coin").and_then(|v| v.as_str()).unwrap_or("");
    vec![
        Value::DateTime(event.time),
        Value::Str(event.hash.clone()),
        Value::Str(kind.to_string()),
        Value::Float(usdc),
        Value::Str(coin.to_string()),
        Value::Str(delta.to_string()),
        Value::Str(address.to_string()),
    ]
}

pub fn candle_row(coin: &str, interval: &str, candle: &crate::venue::Candle) -> Row {
    vec![
        Value::Str(coin.to_string()),
        Value::Str(interval.to_string()),
        Value::DateTime(candle.open_time),
        Value::Float(fnum(&candle.open)),
        Value::Float(fnum(&candle.high)),
        Value::Float(fnum(&candle.low)),
        Value::Float(fnum(&candle.close)),
        Value::Float(fnum(&candle.volume)),
    ]
}

pub fn meta_rows(meta: &crate::venue::VenueMeta, min_usd: f64, ts_ms: i64) -> Vec<Row> {
    meta.universe
        .iter()
        .filter(|entry| !entry.name.is_empty())
        .map(|entry| {
            let sz_decimals = entry.sz_decimals;
            let px_decimals = (6 - sz_decimals).max(0);
            vec![
                Value::Str(entry.name.to_uppercase()),
                Value::Int(sz_decimals),
                Value::Int(px_decimals),
                Value::Float(10f64.powi(-(sz_decimals as i32))),
                Value::Float(10f64.powi(-(px_decimals as i32))),
                Value::Float(fnum_opt(entry.min_sz.as_ref())),
                Value::Float(min_usd),
                Value::DateTime(ts_ms),
            ]
        })
        .collect()
}

/// Candle windows fetched per coin: (interval, hours back).
const CANDLE_WINDOWS: &[(&str, i64)] = &[("1h", 48), ("1d", 7 * 24)];

async fn collect_stream_rows(
    def: &StreamDef,
    venue: &dyn VenueApi,
    cfg: &FetchConfig,
    states: &[(String, ClearinghouseState)],
    now_ms: i64,
) -> Result<Vec<Row>, VenueError> {
    let lookback_start = now_ms - cfg.lookback_days * 24 * 3600 * 1000;
    match def.name {
        "account" => Ok(states
            .iter()
            .map(|(addr, state)| account_row(state, addr, now_ms))
            .collect()),
        "positions" => Ok(states
            .iter()
            .flat_map(|(addr, state)| position_rows(state, addr, now_ms))
            .collect()),
        "trades" => {
            let mut rows = Vec::new();
            for addr in &cfg.addresses {
                let fills = venue.user_fills(addr).await?;
                rows.extend(fills.iter().map(|f| fill_row(f, addr)));
            }
            Ok(rows)
        }
        "orders" => {
            let mut rows = Vec::new();
            for addr in &cfg.addresses {
                let orders = venue.historical_orders(addr).await?;
                rows.extend(orders.iter().map(|o| order_row(o, addr)));
            }
            Ok(rows)
        }
        "funding" => {
            let mut rows = Vec::new();
            for addr in &cfg.addresses {
                let events = venue.user_funding(addr, lookback_start).await?;
                rows.extend(events.iter().map(|e| funding_row(e, addr)));
            }
            Ok(rows)
        }
        "ledger" => {
            let mut rows = Vec::new();
            for addr in &cfg.addresses {
                let events = venue.ledger_updates(addr, lookback_start).await?;
                rows.extend(events.iter().map(|e| ledger_row(e, addr)));
            }
            Ok(rows)
        }
        "candles" => {
            let mut rows = Vec::new();
            let mut errors = 0usize;
            for coin in &cfg.candle_coins {
                for (interval, hours_back) in CANDLE_WINDOWS {
                    let start = now_ms - hours_back * 3600 * 1000;
                    match venue.candles(coin, interval, start, now_ms).await {
                        Ok(candles) => {
                            rows.extend(candles.iter().map(|c| candle_row(coin, interval, c)));
                        }
                        Err(e) => {
                            errors += 1;
                            log::warn!("⚠️  [candles] {} {} fetch failed: {}", coin, interval, e);
                        }
                    }
                }
            }
            if rows.is_empty() && errors > 0 {
                return Err(VenueError::Http(format!(
                    "all {} candle requests failed",
                    errors
                )));
            }
            Ok(rows)
        }
        "meta" => {
            let meta = venue.meta().await?;
            Ok(meta_rows(&meta, cfg.min_notional_usd, now_ms))
        }
        other => Err(VenueError::Decode(format!("unknown stream: {}", other))),
    }
}

fn needs_state(name: &str) -> bool {
    matches!(name, "account" | "positions")
}

/// Run one fetch cycle. Returns one outcome per stream; a venue failure on
/// one stream never aborts the others, and nothing here depends on the
/// analytical targets being reachable.
pub async fn run_fetch(
    venue: &dyn VenueApi,
    staging: &mut StagingBuffer,
    cfg: &FetchConfig,
    only_stream: Option<&str>,
    dry_run: bool,
) -> Vec<UnitOutcome> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let selected: Vec<&StreamDef> = registry::all_streams()
        .iter()
        .filter(|def| only_stream.map(|s| s == def.name).unwrap_or(true))
        .collect();

    // Account and position snapshots share one clearinghouse call per
    // address; fetch them up front.
    let mut states: Vec<(String, ClearinghouseState)> = Vec::new();
    let mut state_error: Option<VenueError> = None;
    if selected.iter().any(|def| needs_state(def.name)) {
        for addr in &cfg.addresses {
            match venue.clearinghouse_state(addr).await {
                Ok(state) => states.push((addr.clone(), state)),
                Err(e) => {
                    log::error!("❌ [account/positions] state fetch failed for {}: {}", addr, e);
                    state_error = Some(e);
                    break;
                }
            }
        }
    }

    let mut outcomes = Vec::new();
    for def in selected {
        if needs_state(def.name) {
            if let Some(e) = &state_error {
                outcomes.push(UnitOutcome::failed(def.name, e.to_string()));
                continue;
            }
        }
        match collect_stream_rows(def, venue, cfg, &states, now_ms).await {
            Ok(rows) if rows.is_empty() => {
                log::info!("📥 [{}] no new records", def.name);
                outcomes.push(UnitOutcome::succeeded(def.name, 0, "no new records"));
            }
            Ok(rows) => {
                let count = rows.len() as u64;
                if dry_run {
                    log::info!("📥 [{}] dry-run: would stage {} rows", def.name, count);
                    outcomes.push(UnitOutcome::succeeded(def.name, count, "dry-run"));
                    continue;
                }
                match staging.append(def, rows) {
                    Ok(batch) => {
                        log::info!(
                            "📥 [{}] staged {} rows (batch seq={})",
                            def.name,
                            count,
                            batch.seq
                        );
                        outcomes.push(UnitOutcome::succeeded(def.name, count, ""));
                    }
                    Err(e) => {
                        // Local storage trouble is fatal to this cycle for
                        // this stream; surface it loudly.
                        log::error!("❌ [{}] staging append failed: {}", def.name, e);
                        outcomes.push(UnitOutcome::failed(def.name, e.to_string()));
                    }
                }
            }
            Err(e) => {
                log::error!("❌ [{}] fetch failed: {}", def.name, e);
                outcomes.push(UnitOutcome::failed(def.name, e.to_string()));
            }
        }
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::{AssetPosition, Candle, Fill, Position, UniverseEntry, VenueMeta};

    #[test]
    fn test_account_row_shape() {
        let mut state = ClearinghouseState::default();
        state.margin_summary.account_value = "12500.5".into();
        state.margin_summary.total_margin_used = "250.0".into();
        state.withdrawable = "12000".into();

        let row = account_row(&state, "0xaddr", 1_700_000_000_000);
        let def = registry::stream("account").unwrap();
        assert_eq!(row.len(), def.fields.len());
        assert_eq!(row[1], Value::Float(12500.5));
        assert_eq!(row[6], Value::Float(12000.0));
        assert_eq!(row[7], Value::Str("0xaddr".into()));
    }

    #[test]
    fn test_zero_positions_dropped() {
        let mut state = ClearinghouseState::default();
        let mut open = Position::default();
        open.coin = "BTC".into();
        open.szi = "0.5".into();
        let mut flat = Position::default();
        flat.coin = "ETH".into();
        flat.szi = "0".into();
        state.asset_positions = vec![
            AssetPosition { position: open },
            AssetPosition { position: flat },
        ];

        let rows = position_rows(&state, "0xaddr", 1);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1], Value::Str("BTC".into()));
    }

    #[test]
    fn test_fill_row_tid_fallback() {
        let mut fill = Fill::default();
        fill.coin = "BTC".into();
        fill.time = 1_700_000_000_000;
        fill.tid = None;
        let row = fill_row(&fill, "0xaddr");
        assert_eq!(row[12], Value::UInt(1_700_000_000_000));

        fill.tid = Some(42);
        let row = fill_row(&fill, "0xaddr");
        assert_eq!(row[12], Value::UInt(42));
    }

    #[test]
    fn test_ledger_row_flattens_delta() {
        let event = crate::venue::LedgerEvent {
            time: 1000,
            hash: "0xh".into(),
            delta: serde_json::json!({"type": "deposit", "usdc": "100.5"}),
        };
        let row = ledger_row(&event, "0xaddr");
        assert_eq!(row[2], Value::Str("deposit".into()));
        assert_eq!(row[3], Value::Float(100.5));
        // Raw payload preserved for inspection.
        assert!(matches!(&row[5], Value::Str(s) if s.contains("deposit")));
    }

    #[test]
    fn test_candle_row_matches_schema() {
        let candle = Candle {
            open_time: 1_700_000_000_000,
            open: "1.0".into(),
            high: "2.0".into(),
            low: "0.5".into(),
            close: "1.5".into(),
            volume: "321".into(),
        };
        let row = candle_row("BTC", "1h", &candle);
        let def = registry::stream("candles").unwrap();
        assert_eq!(row.len(), def.fields.len());
        assert_eq!(row[7], Value::Float(321.0));
    }

    #[test]
    fn test_meta_rows_derive_steps() {
        let meta = VenueMeta {
            universe: vec![UniverseEntry {
                name: "btc".into(),
                sz_decimals: 4,
                min_sz: Some("0.0001".into()),
            }],
        };
        let rows = meta_rows(&meta, 10.0, 1);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], Value::Str("BTC".into()));
        assert_eq!(rows[0][2], Value::Int(2)); // px_decimals = 6 - 4
        assert_eq!(rows[0][3], Value::Float(0.0001));
        assert_eq!(rows[0][4], Value::Float(0.01));
    }
}
