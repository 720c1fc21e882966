//! Stream registry - static catalog of telemetry streams.
//!
//! Maps each stream to its record schema, dedup key and target table.
//! Dedup key present means latest-write-wins at the target (the table is
//! keyed and compacted); absent means append-only snapshot semantics.
//!
//! Column names follow the venue wire format (camelCase where the venue
//! uses it) so flushed tables line up with what downstream queries expect.

use crate::schema::FieldType;

#[derive(Debug, Clone, Copy)]
pub struct StreamDef {
    pub name: &'static str,
    pub target_table: &'static str,
    /// Ordered `(column, type)` pairs.
    pub fields: &'static [(&'static str, FieldType)],
    /// Empty slice = append-only.
    pub dedup_key: &'static [&'static str],
}

impl StreamDef {
    pub fn is_dedup(&self) -> bool {
        !self.dedup_key.is_empty()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.fields.iter().map(|(n, _)| n.to_string()).collect()
    }

    pub fn column_types(&self) -> Vec<FieldType> {
        self.fields.iter().map(|(_, t)| *t).collect()
    }
}

use FieldType::{Bool, DateTime, Float, Int, Str, UInt};

const ACCOUNT: StreamDef = StreamDef {
    name: "account",
    target_table: "account_snapshots",
    fields: &[
        ("timestamp", DateTime),
        ("accountValue", Float),
        ("totalMarginUsed", Float),
        ("totalNtlPos", Float),
        ("totalRawUsd", Float),
        ("marginUsed", Float),
        ("withdrawable", Float),
        ("address", Str),
    ],
    dedup_key: &[],
};

const POSITIONS: StreamDef = StreamDef {
    name: "positions",
    target_table: "positions_snapshots",
    fields: &[
        ("timestamp", DateTime),
        ("coin", Str),
        ("szi", Float),
        ("entryPx", Float),
        ("positionValue", Float),
        ("unrealizedPnl", Float),
        ("returnOnEquity", Float),
        ("liquidationPx", Float),
        ("leverage", Float),
        ("maxLeverage", Int),
        ("marginUsed", Float),
        ("address", Str),
    ],
    dedup_key: &[],
};

const TRADES: StreamDef = StreamDef {
    name: "trades",
    target_table: "trades",
    fields: &[
        ("coin", Str),
        ("side", Str),
        ("px", Float),
        ("sz", Float),
        ("time", DateTime),
        ("hash", Str),
        ("startPosition", Float),
        ("dir", Str),
        ("closedPnl", Float),
        ("oid", UInt),
        ("cloid", Str),
        ("fee", Float),
        ("tid", UInt),
        ("address", Str),
    ],
    dedup_key: &["coin", "time", "tid"],
};

const ORDERS: StreamDef = StreamDef {
    name: "orders",
    target_table: "orders",
    fields: &[
        ("coin", Str),
        ("side", Str),
        ("limitPx", Float),
        ("sz", Float),
        ("oid", UInt),
        ("timestamp", DateTime),
        ("status", Str),
        ("orderType", Str),
        ("reduceOnly", Bool),
        ("address", Str),
    ],
    // An order is re-observed every cycle while its status evolves
    // (open -> filled); latest observation per (address, oid) wins.
    dedup_key: &["address", "oid"],
};

const FUNDING: StreamDef = StreamDef {
    name: "funding",
    target_table: "funding_payments",
    fields: &[
        ("time", DateTime),
        ("coin", Str),
        ("usdc", Float),
        ("szi", Float),
        ("fundingRate", Float),
        ("tid", UInt),
        ("address", Str),
    ],
    dedup_key: &["address", "coin", "time"],
};

const LEDGER: StreamDef = StreamDef {
    name: "ledger",
    target_table: "ledger_updates",
    fields: &[
        ("time", DateTime),
        ("hash", Str),
        ("type", Str),
        ("usdc", Float),
        ("coin", Str),
        ("raw_json", Str),
        ("address", Str),
    ],
    dedup_key: &["hash", "time"],
};

const CANDLES: StreamDef = StreamDef {
    name: "candles",
    target_table: "candles",
    fields: &[
        ("coin", Str),
        ("interval", Str),
        ("ts", DateTime),
        ("open", Float),
        ("high", Float),
        ("low", Float),
        ("close", Float),
        ("volume", Float),
    ],
    dedup_key: &["coin", "interval", "ts"],
};

const META: StreamDef = StreamDef {
    name: "meta",
    target_table: "hl_meta",
    fields: &[
        ("symbol", Str),
        ("sz_decimals", Int),
        ("px_decimals", Int),
        ("size_step", Float),
        ("tick_size", Float),
        ("min_units", Float),
        ("min_usd", Float),
        ("updated_at", DateTime),
    ],
    dedup_key: &["symbol"],
};

const ALL_STREAMS: &[StreamDef] = &[
    ACCOUNT, POSITIONS, TRADES, ORDERS, FUNDING, LEDGER, CANDLES, META,
];

pub fn all_streams() -> &'static [StreamDef] {
    ALL_STREAMS
}

pub fn stream(name: &str) -> Option<&'static StreamDef> {
    ALL_STREAMS.iter().find(|s| s.name == name)
}
