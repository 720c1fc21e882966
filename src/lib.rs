//! telesync - buffered venue-telemetry ingestion with dual-target flush
//! and cursor-gated reverse replication.
//!
//! Three cron-driven tasks share a staging directory and a small local
//! state database, each guarded by a run lease:
//!
//! 1. `venue_ping` - fetches account state, positions, fills, orders,
//!    funding, ledger events, candles and venue metadata and stages them
//!    as durable per-stream batch files (never touches the targets).
//! 2. `flush_buffers` - drains staged batches into the near (primary) and
//!    far (secondary) analytical stores with idempotent, order-preserving
//!    writes, then triggers compaction for latest-wins streams.
//! 3. `downsync` - replicates a disjoint table set in the opposite
//!    direction (far -> near) in bounded windows gated by persisted,
//!    monotonic per-table cursors.
//!
//! External collaborators are capabilities: `venue::VenueApi` for the
//! venue HTTP API and `store::AnalyticalStore` for the targets. Handles
//! are constructed per invocation and passed in explicitly.

#[cfg(test)]
mod tests;

pub mod config;
pub mod cursor;
pub mod fetch;
pub mod flush;
pub mod lease;
pub mod outcome;
pub mod registry;
pub mod replicate;
pub mod schema;
pub mod staging;
pub mod store;
pub mod venue;

pub use config::Config;
pub use outcome::{OutcomeStatus, SyncError, UnitOutcome};
pub use registry::StreamDef;
pub use schema::{FieldType, Row, Value};
