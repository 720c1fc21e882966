//! Staging buffer - durable, per-stream, timestamped batch files.
//!
//! The fetch task appends here without ever touching the network targets;
//! the flush task drains from here. Batch state lives in the file name and
//! every transition is an atomic rename, so a crash at any point leaves
//! each batch at its last durable state:
//!
//!   `{stream}_{YYYYmmdd_HHMMSS_micros}_{seq}.staged.json`   fetched, not flushed
//!   `{stream}_{...}_{seq}.primary.json`                     primary target confirmed
//!   deleted                                                 both targets confirmed
//!   `quarantine/{...}.json`                                 rejected by a target, kept
//!
//! File names embed stream + timestamp + sequence so lexicographic order is
//! creation order. The staging directory is exclusively owned by this
//! module; other components interact only through its contract.

use crate::registry::StreamDef;
use crate::schema::{BatchFile, Row};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum StagingError {
    Io(std::io::Error),
    /// Batch file exists but cannot be decoded.
    Corrupt(String),
    /// Row arity does not match the stream schema.
    Shape(String),
    /// mark/delete called from a state that does not allow it.
    IllegalTransition(String),
}

impl From<std::io::Error> for StagingError {
    fn from(err: std::io::Error) -> Self {
        StagingError::Io(err)
    }
}

impl std::fmt::Display for StagingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StagingError::Io(e) => write!(f, "IO error: {}", e),
            StagingError::Corrupt(e) => write!(f, "corrupt batch file: {}", e),
            StagingError::Shape(e) => write!(f, "row shape error: {}", e),
            StagingError::IllegalTransition(e) => write!(f, "illegal batch transition: {}", e),
        }
    }
}

impl std::error::Error for StagingError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Staged,
    /// Primary target confirmed; awaiting secondary.
    FlushedPrimary,
}

impl BatchState {
    fn suffix(&self) -> &'static str {
        match self {
            BatchState::Staged => "staged",
            BatchState::FlushedPrimary => "primary",
        }
    }
}

/// Handle to one staged batch.
#[derive(Debug, Clone)]
pub struct BatchRef {
    pub stream: String,
    pub seq: u64,
    pub state: BatchState,
    pub path: PathBuf,
}

impl BatchRef {
    /// File name without the state suffix - the drain sort key.
    pub fn stem(&self) -> String {
        let name = self.path.file_name().unwrap_or_default().to_string_lossy();
        name.trim_end_matches(".staged.json")
            .trim_end_matches(".primary.json")
            .to_string()
    }
}

pub struct StagingBuffer {
    dir: PathBuf,
    next_seq: HashMap<String, u64>,
}

impl StagingBuffer {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StagingError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            next_seq: HashMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn quarantine_dir(&self) -> PathBuf {
        self.dir.join("quarantine")
    }

    /// Next per-stream sequence id, initialized from the highest sequence
    /// already on disk (including quarantined batches, so ids are never
    /// reused after a restart).
    fn next_seq(&mut self, stream: &str) -> Result<u64, StagingError> {
        if let Some(seq) = self.next_seq.get(stream) {
            return Ok(*seq);
        }
        let mut max_seen = 0u64;
        for dir in [self.dir.clone(), self.quarantine_dir()] {
            if !dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some((s, seq)) = parse_batch_name(&name) {
                    if s == stream && seq > max_seen {
                        max_seen = seq;
                    }
                }
            }
        }
        let next = max_seen + 1;
        self.next_seq.insert(stream.to_string(), next);
        Ok(next)
    }

    /// Write a new immutable batch for `stream`. The batch is durable on
    /// disk before this returns: data is written to a temp file, fsynced,
    /// renamed into place, and the directory entry is fsynced.
    ///
    /// Fails only on local storage problems - never on network conditions.
    pub fn append(&mut self, def: &StreamDef, rows: Vec<Row>) -> Result<BatchRef, StagingError> {
        for (i, row) in rows.iter().enumerate() {
            if row.len() != def.fields.len() {
                return Err(StagingError::Shape(format!(
                    "stream {} row {} has {} values, schema has {}",
                    def.name,
                    i,
                    row.len(),
                    def.fields.len()
                )));
            }
        }

        fs::create_dir_all(&self.dir)?;
        let seq = self.next_seq(def.name)?;
        let now = chrono::Utc::now();
        let batch = BatchFile::from_rows(
            def.name,
            seq,
            now.timestamp_millis(),
            def.column_names(),
            def.column_types(),
            rows,
        );

        let stamp = now.format("%Y%m%d_%H%M%S_%6f");
        let name = format!("{}_{}_{:06}.staged.json", def.name, stamp, seq);
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!(".{}.tmp", name));

        let json = serde_json::to_vec(&batch)
            .map_err(|e| StagingError::Corrupt(format!("encode failed: {}", e)))?;
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        self.sync_dir()?;

        self.next_seq.insert(def.name.to_string(), seq + 1);
        log::debug!(
            "📝 [{}] staged batch seq={} ({} rows) -> {}",
            def.name,
            seq,
            batch.row_count(),
            name
        );

        Ok(BatchRef {
            stream: def.name.to_string(),
            seq,
            state: BatchState::Staged,
            path,
        })
    }

    /// All batches of `stream` not yet confirmed by every target, oldest
    /// first. Quarantined batches are excluded.
    pub fn list_pending(&self, stream: &str) -> Result<Vec<BatchRef>, StagingError> {
        let mut batches = Vec::new();
        if !self.dir.exists() {
            return Ok(batches);
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let state = if name.ends_with(".staged.json") {
                BatchState::Staged
            } else if name.ends_with(".primary.json") {
                BatchState::FlushedPrimary
            } else {
                continue;
            };
            match parse_batch_name(&name) {
                Some((s, seq)) if s == stream => {
                    batches.push(BatchRef {
                        stream: s,
                        seq,
                        state,
                        path: entry.path(),
                    });
                }
                _ => {}
            }
        }
        batches.sort_by_key(|b| b.stem());
        Ok(batches)
    }

    /// Decode a batch file back into its columnar form.
    pub fn load(&self, batch: &BatchRef) -> Result<BatchFile, StagingError> {
        let bytes = fs::read(&batch.path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| StagingError::Corrupt(format!("{}: {}", batch.path.display(), e)))
    }

    /// Atomic, crash-safe state transition. Only `Staged -> FlushedPrimary`
    /// is a legal rename.
    pub fn mark(&self, batch: &mut BatchRef, state: BatchState) -> Result<(), StagingError> {
        if !(batch.state == BatchState::Staged && state == BatchState::FlushedPrimary) {
            return Err(StagingError::IllegalTransition(format!(
                "{:?} -> {:?} for {}",
                batch.state,
                state,
                batch.path.display()
            )));
        }
        let new_path = self
            .dir
            .join(format!("{}.{}.json", batch.stem(), state.suffix()));
        fs::rename(&batch.path, &new_path)?;
        self.sync_dir()?;
        batch.path = new_path;
        batch.state = state;
        Ok(())
    }

    /// Remove a fully-flushed batch. Legal only once every configured
    /// target has confirmed, i.e. from `FlushedPrimary` after the secondary
    /// write succeeded.
    pub fn delete(&self, batch: BatchRef) -> Result<(), StagingError> {
        if batch.state != BatchState::FlushedPrimary {
            return Err(StagingError::IllegalTransition(format!(
                "delete from {:?} for {}",
                batch.state,
                batch.path.display()
            )));
        }
        fs::remove_file(&batch.path)?;
        self.sync_dir()?;
        Ok(())
    }

    /// Move a rejected batch into `quarantine/` for operator inspection.
    /// The file is renamed, never deleted.
    pub fn quarantine(&self, batch: BatchRef, reason: &str) -> Result<PathBuf, StagingError> {
        let qdir = self.quarantine_dir();
        fs::create_dir_all(&qdir)?;
        let name = batch
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("{}_{}.json", batch.stream, batch.seq));
        let dest = qdir.join(&name);
        fs::rename(&batch.path, &dest)?;
        self.sync_dir()?;
        log::error!(
            "🚧 [{}] batch seq={} quarantined ({}): {}",
            batch.stream,
            batch.seq,
            reason,
            dest.display()
        );
        Ok(dest)
    }

    fn sync_dir(&self) -> Result<(), StagingError> {
        // Directory fsync so renames/creates survive a crash.
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

/// Parse `{stream}_{stamp}_{seq}.{state}.json` -> (stream, seq).
fn parse_batch_name(name: &str) -> Option<(String, u64)> {
    let stem = name
        .strip_suffix(".staged.json")
        .or_else(|| name.strip_suffix(".primary.json"))
        .or_else(|| name.strip_suffix(".json"))?;
    let stream = stem.split('_').next()?.to_string();
    let seq: u64 = stem.rsplit('_').next()?.parse().ok()?;
    Some((stream, seq))
}
