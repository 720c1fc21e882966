//! Error taxonomy and per-unit outcome reporting.
//!
//! Expected conditions (nothing to sync, lease already held) are modelled
//! as `Skipped` outcomes, not errors. Every task logs a structured summary
//! of all stream/table outcomes before exiting, and the exit code is
//! non-zero iff any unit failed.

use std::fmt;

#[derive(Debug)]
pub enum SyncError {
    /// Network/timeout against a target - retried next cycle, no data loss.
    TransientTarget(String),
    /// Batch/table shape does not match the destination - operator action.
    SchemaMismatch(String),
    /// Local disk failure - fatal to the current cycle.
    LocalStorage(std::io::Error),
    /// Batch renamed into quarantine/ for inspection.
    Quarantined {
        stream: String,
        batch: String,
        reason: String,
    },
    /// A computed cursor would move backwards - refused.
    CursorRegression {
        table: String,
        stored: String,
        proposed: String,
    },
    /// Venue API failure - isolated to one stream, retried next cycle.
    Venue(String),
    Config(String),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::TransientTarget(e) => write!(f, "transient target failure: {}", e),
            SyncError::SchemaMismatch(e) => write!(f, "schema mismatch: {}", e),
            SyncError::LocalStorage(e) => write!(f, "local storage failure: {}", e),
            SyncError::Quarantined {
                stream,
                batch,
                reason,
            } => write!(f, "batch {} of stream {} quarantined: {}", batch, stream, reason),
            SyncError::CursorRegression {
                table,
                stored,
                proposed,
            } => write!(
                f,
                "cursor regression on {}: stored {} > proposed {}",
                table, stored, proposed
            ),
            SyncError::Venue(e) => write!(f, "venue API failure: {}", e),
            SyncError::Config(e) => write!(f, "configuration error: {}", e),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::LocalStorage(err)
    }
}

impl From<crate::store::StoreError> for SyncError {
    fn from(err: crate::store::StoreError) -> Self {
        use crate::store::StoreError;
        match err {
            StoreError::Schema(e) => SyncError::SchemaMismatch(e),
            StoreError::Transport(e) | StoreError::Backend(e) => SyncError::TransientTarget(e),
        }
    }
}

impl From<crate::staging::StagingError> for SyncError {
    fn from(err: crate::staging::StagingError) -> Self {
        use crate::staging::StagingError;
        match err {
            StagingError::Io(e) => SyncError::LocalStorage(e),
            StagingError::Corrupt(e) | StagingError::Shape(e) => SyncError::SchemaMismatch(e),
            StagingError::IllegalTransition(e) => {
                SyncError::LocalStorage(std::io::Error::new(std::io::ErrorKind::Other, e))
            }
        }
    }
}

impl From<crate::cursor::CursorError> for SyncError {
    fn from(err: crate::cursor::CursorError) -> Self {
        use crate::cursor::CursorError;
        match err {
            CursorError::Regression {
                table,
                stored,
                proposed,
            } => SyncError::CursorRegression {
                table,
                stored,
                proposed,
            },
            CursorError::Database(e) | CursorError::Encoding(e) => {
                SyncError::LocalStorage(std::io::Error::new(std::io::ErrorKind::Other, e))
            }
        }
    }
}

impl From<crate::venue::VenueError> for SyncError {
    fn from(err: crate::venue::VenueError) -> Self {
        SyncError::Venue(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Succeeded,
    Skipped,
    Failed,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Succeeded => write!(f, "OK"),
            OutcomeStatus::Skipped => write!(f, "SKIP"),
            OutcomeStatus::Failed => write!(f, "FAIL"),
        }
    }
}

/// Outcome of one stream or table within a task invocation.
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub unit: String,
    pub status: OutcomeStatus,
    pub rows: u64,
    pub detail: String,
}

impl UnitOutcome {
    pub fn succeeded(unit: impl Into<String>, rows: u64, detail: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            status: OutcomeStatus::Succeeded,
            rows,
            detail: detail.into(),
        }
    }

    pub fn skipped(unit: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            status: OutcomeStatus::Skipped,
            rows: 0,
            detail: detail.into(),
        }
    }

    pub fn failed(unit: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            status: OutcomeStatus::Failed,
            rows: 0,
            detail: detail.into(),
        }
    }
}

/// Log the per-unit summary and return the process exit code.
pub fn summarize(task: &str, outcomes: &[UnitOutcome]) -> i32 {
    let failed = outcomes
        .iter()
        .filter(|o| o.status == OutcomeStatus::Failed)
        .count();
    let succeeded = outcomes
        .iter()
        .filter(|o| o.status == OutcomeStatus::Succeeded)
        .count();

    log::info!("📋 [{}] outcome summary:", task);
    for o in outcomes {
        let line = if o.detail.is_empty() {
            format!("   {:<4} {:<12} rows={}", o.status.to_string(), o.unit, o.rows)
        } else {
            format!(
                "   {:<4} {:<12} rows={} ({})",
                o.status.to_string(),
                o.unit,
                o.rows,
                o.detail
            )
        };
        match o.status {
            OutcomeStatus::Failed => log::error!("{}", line),
            _ => log::info!("{}", line),
        }
    }

    if failed > 0 {
        log::error!(
            "❌ [{}] {} of {} units failed",
            task,
            failed,
            outcomes.len()
        );
        1
    } else {
        log::info!("✅ [{}] {} units succeeded", task, succeeded);
        0
    }
}
