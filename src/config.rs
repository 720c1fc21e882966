//! Configuration loaded from environment variables.
//!
//! Every recognized option lives in one fixed struct, validated at
//! startup: missing required keys fail fast before any work starts.
//! Target credentials come only from the environment - there are no
//! hard-coded secret defaults.
//!
//! ## Environment Variables
//!
//! - TELESYNC_STAGING_DIR - staging buffer directory (default: data/buffer)
//! - TELESYNC_STATE_DB - cursors/leases database (default: data/telesync_state.db)
//! - NEAR_CH_HOST / NEAR_CH_PORT / NEAR_CH_USER / NEAR_CH_PASSWORD /
//!   NEAR_CH_DATABASE / NEAR_CH_SECURE - near (primary) target
//! - FAR_CH_* - far (secondary) target, same keys
//! - VENUE_INFO_URL - venue info endpoint (default: public endpoint)
//! - VENUE_ADDRESSES - comma-separated account addresses (fetch task)
//! - CANDLE_COINS - candle universe (default: BTC,ETH,SOL,HYPE,XRP,DOGE)
//! - MIN_NOTIONAL_USD - metadata minimum notional (default: 10)
//! - LEASE_TTL_SECS - run lease TTL (default: 3600)
//! - SYNC_WINDOW_ROWS - replication window size (default: 50000)
//! - LOOKBACK_DAYS - funding/ledger lookback (default: 30)
//! - DOWNSYNC_TABLES - comma-separated `table[:cursor_column]`; empty means
//!   discover every table from the source

use crate::replicate::TableSpec;
use std::env;
use std::path::PathBuf;

#[derive(Debug)]
pub enum ConfigError {
    Missing(String),
    Invalid { key: String, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "missing required env var: {}", key),
            ConfigError::Invalid { key, value } => {
                write!(f, "invalid value for {}: {}", key, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key.to_string()))
}

fn optional(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parsed<T: std::str::FromStr>(key: &str, default: &str) -> Result<T, ConfigError> {
    let raw = optional(key, default);
    raw.parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value: raw,
    })
}

fn csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Connection options for one analytical target.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub secure: bool,
}

impl TargetConfig {
    /// Read `{prefix}_HOST` etc. Host, user and password are required -
    /// credentials are never defaulted.
    fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let key = |suffix: &str| format!("{}_{}", prefix, suffix);
        Ok(Self {
            host: required(&key("HOST"))?,
            port: parsed::<u16>(&key("PORT"), "8123")?,
            user: required(&key("USER"))?,
            password: required(&key("PASSWORD"))?,
            database: optional(&key("DATABASE"), "maicro_monitors"),
            secure: optional(&key("SECURE"), "false").to_lowercase() == "true",
        })
    }
}

/// Everything a task invocation can be configured with.
#[derive(Debug)]
pub struct Config {
    pub staging_dir: PathBuf,
    pub state_db: PathBuf,
    pub near: TargetConfig,
    pub far: TargetConfig,
    pub venue_info_url: String,
    pub addresses: Vec<String>,
    pub candle_coins: Vec<String>,
    pub min_notional_usd: f64,
    pub lease_ttl_secs: i64,
    pub sync_window_rows: u64,
    pub lookback_days: i64,
    pub downsync_tables: Vec<TableSpec>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let lease_ttl_secs = parsed::<i64>("LEASE_TTL_SECS", "3600")?;
        let sync_window_rows = parsed::<u64>("SYNC_WINDOW_ROWS", "50000")?;
        let lookback_days = parsed::<i64>("LOOKBACK_DAYS", "30")?;
        if lease_ttl_secs <= 0 {
            return Err(ConfigError::Invalid {
                key: "LEASE_TTL_SECS".to_string(),
                value: lease_ttl_secs.to_string(),
            });
        }
        if sync_window_rows == 0 {
            return Err(ConfigError::Invalid {
                key: "SYNC_WINDOW_ROWS".to_string(),
                value: "0".to_string(),
            });
        }

        Ok(Self {
            staging_dir: optional("TELESYNC_STAGING_DIR", "data/buffer").into(),
            state_db: optional("TELESYNC_STATE_DB", "data/telesync_state.db").into(),
            near: TargetConfig::from_env("NEAR_CH")?,
            far: TargetConfig::from_env("FAR_CH")?,
            venue_info_url: optional("VENUE_INFO_URL", "https://api.hyperliquid.xyz/info"),
            addresses: csv(&optional("VENUE_ADDRESSES", "")),
            candle_coins: csv(&optional("CANDLE_COINS", "BTC,ETH,SOL,HYPE,XRP,DOGE")),
            min_notional_usd: parsed::<f64>("MIN_NOTIONAL_USD", "10")?,
            lease_ttl_secs,
            sync_window_rows,
            lookback_days,
            downsync_tables: csv(&optional("DOWNSYNC_TABLES", ""))
                .iter()
                .map(|s| TableSpec::parse(s))
                .collect(),
        })
    }
}

/// `--name=value` or `--name value` from a raw argument list.
pub fn arg_value(args: &[String], name: &str) -> Option<String> {
    let flag = format!("--{}", name);
    let prefix = format!("--{}=", name);
    for (i, arg) in args.iter().enumerate() {
        if let Some(v) = arg.strip_prefix(&prefix) {
            return Some(v.to_string());
        }
        if arg == &flag {
            return args.get(i + 1).cloned();
        }
    }
    None
}

pub fn has_flag(args: &[String], name: &str) -> bool {
    let flag = format!("--{}", name);
    args.iter().any(|a| a == &flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_trims_and_drops_empty() {
        assert_eq!(csv("BTC, ETH ,,SOL"), vec!["BTC", "ETH", "SOL"]);
        assert!(csv("").is_empty());
    }

    #[test]
    fn test_arg_value_both_forms() {
        let args: Vec<String> = ["--stream=trades", "--lookback-window", "7", "--dry-run"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(arg_value(&args, "stream"), Some("trades".into()));
        assert_eq!(arg_value(&args, "lookback-window"), Some("7".into()));
        assert_eq!(arg_value(&args, "table"), None);
        assert!(has_flag(&args, "dry-run"));
        assert!(!has_flag(&args, "verbose"));
    }

    #[test]
    fn test_target_config_requires_credentials() {
        // Isolated prefix so parallel tests cannot interfere.
        std::env::remove_var("TESTCFG_CH_HOST");
        assert!(matches!(
            TargetConfig::from_env("TESTCFG_CH"),
            Err(ConfigError::Missing(_))
        ));

        std::env::set_var("TESTCFG_CH_HOST", "db.example.com");
        std::env::set_var("TESTCFG_CH_USER", "ingest");
        std::env::set_var("TESTCFG_CH_PASSWORD", "");
        let cfg = TargetConfig::from_env("TESTCFG_CH").unwrap();
        assert_eq!(cfg.host, "db.example.com");
        assert_eq!(cfg.port, 8123);
        assert_eq!(cfg.database, "maicro_monitors");
        assert!(!cfg.secure);

        std::env::remove_var("TESTCFG_CH_HOST");
        std::env::remove_var("TESTCFG_CH_USER");
        std::env::remove_var("TESTCFG_CH_PASSWORD");
    }
}
