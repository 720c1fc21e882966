//! Venue API capability - typed records or a typed error.
//!
//! The fetch adapter depends only on the `VenueApi` trait; `InfoClient` is
//! the HTTP implementation against the venue's `/info` endpoint (every
//! request is a POST with a `type` discriminator). Numeric fields arrive
//! as strings on the wire and are kept as strings here; the fetch adapter
//! owns the parsing.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum VenueError {
    Http(String),
    Decode(String),
}

impl std::fmt::Display for VenueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VenueError::Http(e) => write!(f, "HTTP error: {}", e),
            VenueError::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for VenueError {}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MarginSummary {
    pub account_value: String,
    pub total_margin_used: String,
    pub total_ntl_pos: String,
    pub total_raw_usd: String,
    pub margin_used: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Leverage {
    pub value: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Position {
    pub coin: String,
    pub szi: String,
    pub entry_px: Option<String>,
    pub position_value: String,
    pub unrealized_pnl: String,
    pub return_on_equity: String,
    pub liquidation_px: Option<String>,
    pub leverage: Leverage,
    pub max_leverage: i64,
    pub margin_used: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssetPosition {
    pub position: Position,
}

/// User state: account value, margin, open positions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClearinghouseState {
    pub margin_summary: MarginSummary,
    pub cross_margin_summary: MarginSummary,
    pub withdrawable: String,
    pub asset_positions: Vec<AssetPosition>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Fill {
    pub coin: String,
    pub side: String,
    pub px: String,
    pub sz: String,
    /// Millisecond timestamp.
    pub time: i64,
    pub hash: String,
    pub start_position: String,
    pub dir: String,
    pub closed_pnl: String,
    pub oid: u64,
    pub cloid: Option<String>,
    pub fee: String,
    /// Venue trade id; older records may lack it.
    pub tid: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Order {
    pub coin: String,
    pub side: String,
    pub limit_px: String,
    pub sz: String,
    pub oid: u64,
    /// Millisecond placement timestamp.
    pub timestamp: i64,
    pub order_type: String,
    pub reduce_only: bool,
}

/// Historical order envelope: the order plus its lifecycle status.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrderStatus {
    pub order: Order,
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FundingDelta {
    pub coin: String,
    pub usdc: String,
    pub szi: String,
    pub funding_rate: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FundingEvent {
    pub time: i64,
    pub delta: FundingDelta,
}

/// Non-funding ledger update (deposit, withdrawal, transfer). The delta
/// payload varies by type, so it is kept raw and flattened at fetch time.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LedgerEvent {
    pub time: i64,
    pub hash: String,
    pub delta: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Candle {
    #[serde(rename = "t", default)]
    pub open_time: i64,
    #[serde(rename = "o", default)]
    pub open: String,
    #[serde(rename = "h", default)]
    pub high: String,
    #[serde(rename = "l", default)]
    pub low: String,
    #[serde(rename = "c", default)]
    pub close: String,
    #[serde(rename = "v", default)]
    pub volume: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UniverseEntry {
    pub name: String,
    pub sz_decimals: i64,
    pub min_sz: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VenueMeta {
    pub universe: Vec<UniverseEntry>,
}

#[async_trait]
pub trait VenueApi: Send + Sync {
    async fn clearinghouse_state(&self, user: &str) -> Result<ClearinghouseState, VenueError>;

    async fn user_fills(&self, user: &str) -> Result<Vec<Fill>, VenueError>;

    async fn historical_orders(&self, user: &str) -> Result<Vec<OrderStatus>, VenueError>;

    async fn user_funding(&self, user: &str, start_ms: i64) -> Result<Vec<FundingEvent>, VenueError>;

    async fn ledger_updates(&self, user: &str, start_ms: i64)
        -> Result<Vec<LedgerEvent>, VenueError>;

    async fn candles(
        &self,
        coin: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>, VenueError>;

    async fn meta(&self) -> Result<VenueMeta, VenueError>;
}

/// HTTP client for the venue's `/info` endpoint.
pub struct InfoClient {
    http: reqwest::Client,
    info_url: String,
}

impl InfoClient {
    pub fn new(info_url: &str) -> Result<Self, VenueError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| VenueError::Http(e.to_string()))?;
        Ok(Self {
            http,
            info_url: info_url.to_string(),
        })
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        payload: serde_json::Value,
    ) -> Result<T, VenueError> {
        let resp = self
            .http
            .post(&self.info_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| VenueError::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(VenueError::Http(format!("{}: {}", status, body)));
        }
        resp.json::<T>()
            .await
            .map_err(|e| VenueError::Decode(e.to_string()))
    }
}

#[async_trait]
impl VenueApi for InfoClient {
    async fn clearinghouse_state(&self, user: &str) -> Result<ClearinghouseState, VenueError> {
        self.post(json!({"type": "clearinghouseState", "user": user}))
            .await
    }

    async fn user_fills(&self, user: &str) -> Result<Vec<Fill>, VenueError> {
        self.post(json!({"type": "userFills", "user": user})).await
    }

    async fn historical_orders(&self, user: &str) -> Result<Vec<OrderStatus>, VenueError> {
        self.post(json!({"type": "historicalOrders", "user": user}))
            .await
    }

    async fn user_funding(
        &self,
        user: &str,
        start_ms: i64,
    ) -> Result<Vec<FundingEvent>, VenueError> {
        self.post(json!({"type": "userFunding", "user": user, "startTime": start_ms}))
            .await
    }

    async fn ledger_updates(
        &self,
        user: &str,
        start_ms: i64,
    ) -> Result<Vec<LedgerEvent>, VenueError> {
        self.post(json!({
            "type": "userNonFundingLedgerUpdates",
            "user": user,
            "startTime": start_ms
        }))
        .await
    }

    async fn candles(
        &self,
        coin: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>, VenueError> {
        self.post(json!({
            "type": "candleSnapshot",
            "req": {
                "coin": coin,
                "interval": interval,
                "startTime": start_ms,
                "endTime": end_ms
            }
        }))
        .await
    }

    async fn meta(&self) -> Result<VenueMeta, VenueError> {
        self.post(json!({"type": "meta"})).await
    }
}
