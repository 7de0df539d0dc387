//! Durable idempotency ledger of committed message identifiers.
//!
//! The state file is JSON:
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "processed_message_ids": ["18d4f2a1b3c5e6f7", "..."],
//!   "total_emails_processed": 42,
//!   "last_run_timestamp": "2026-01-25T10:30:00Z"
//! }
//! ```
//!
//! Writes go to a sibling `.tmp` file which is fsynced and renamed over the
//! previous one, so readers see either the old file or the new one.

use std::collections::HashSet;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::StateError;
use crate::pipeline::types::ProcessingRecord;

/// Current on-disk schema version.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// In-memory processing state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingState {
    processed: HashSet<String>,
    total_processed: u64,
    last_run: Option<DateTime<Utc>>,
}

/// Summary numbers for display and reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateStats {
    pub total_processed: u64,
    pub tracked_ids: usize,
    pub last_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    schema_version: u32,
    processed_message_ids: Vec<String>,
    total_emails_processed: u64,
    #[serde(default)]
    last_run_timestamp: Option<DateTime<Utc>>,
}

impl StateFile {
    fn from_state(state: &ProcessingState) -> Self {
        let mut ids: Vec<String> = state.processed.iter().cloned().collect();
        ids.sort_unstable();
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            processed_message_ids: ids,
            total_emails_processed: state.total_processed,
            last_run_timestamp: state.last_run,
        }
    }

    fn into_state(self) -> ProcessingState {
        ProcessingState {
            processed: self.processed_message_ids.into_iter().collect(),
            total_processed: self.total_emails_processed,
            last_run: self.last_run_timestamp,
        }
    }
}

/// File-backed state ledger. Owned by one run at a time.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: ProcessingState,
}

impl StateStore {
    /// Load the ledger at `path`, or start empty if the file does not exist.
    ///
    /// A file that exists but cannot be read or parsed is an error, never a
    /// silent reset: resetting would reprocess every message ever seen.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();

        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "No state file yet, starting empty");
                return Ok(Self {
                    path,
                    state: ProcessingState::default(),
                });
            }
            Err(e) => {
                return Err(StateError::Corrupt {
                    path,
                    reason: e.to_string(),
                });
            }
        };

        let state = Self::parse(&path, &raw)?;
        info!(
            path = %path.display(),
            tracked = state.processed.len(),
            total = state.total_processed,
            "Loaded processing state"
        );
        Ok(Self { path, state })
    }

    fn parse(path: &Path, raw: &[u8]) -> Result<ProcessingState, StateError> {
        let value: serde_json::Value =
            serde_json::from_slice(raw).map_err(|e| StateError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let version = value
            .get("schema_version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| StateError::Corrupt {
                path: path.to_path_buf(),
                reason: "missing schema_version".into(),
            })?;
        if version != u64::from(STATE_SCHEMA_VERSION) {
            return Err(StateError::UnsupportedVersion {
                path: path.to_path_buf(),
                found: u32::try_from(version).unwrap_or(u32::MAX),
                expected: STATE_SCHEMA_VERSION,
            });
        }

        let file: StateFile = serde_json::from_value(value).map_err(|e| StateError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(file.into_state())
    }

    /// Path of the durable state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `id` has already been committed in some run.
    pub fn contains(&self, id: &str) -> bool {
        self.state.processed.contains(id)
    }

    /// Fold a confirmed sink commit into the in-memory state.
    ///
    /// Does not touch disk; call [`persist`](Self::persist) once per run.
    /// Returns `false` if the identifier was already recorded.
    pub fn record_success(&mut self, record: &ProcessingRecord) -> bool {
        if !self.state.processed.insert(record.message_id.clone()) {
            return false;
        }
        self.state.total_processed += 1;
        debug!(
            id = %record.message_id,
            category = %record.category,
            row = record.row_ref.as_ref().map(|r| r.0.as_str()).unwrap_or("-"),
            "Recorded success"
        );
        true
    }

    /// Atomically write the full state, stamping the last-run time.
    ///
    /// The write runs to completion on a blocking thread even if the caller
    /// stops waiting. On failure the previous file is left byte-identical and
    /// the in-memory last-run time is not advanced.
    pub async fn persist(&mut self) -> Result<(), StateError> {
        let mut next = self.state.clone();
        next.last_run = Some(Utc::now());

        let bytes = encode(&next).map_err(|e| write_error(&self.path, e))?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| write_error(&self.path, e))??;

        self.state = next;
        info!(
            path = %self.path.display(),
            tracked = self.state.processed.len(),
            "State saved"
        );
        Ok(())
    }

    /// All-time statistics.
    pub fn stats(&self) -> StateStats {
        StateStats {
            total_processed: self.state.total_processed,
            tracked_ids: self.state.processed.len(),
            last_run: self.state.last_run,
        }
    }

    /// Read-only view of the in-memory state.
    pub fn state(&self) -> &ProcessingState {
        &self.state
    }
}

fn encode(state: &ProcessingState) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec_pretty(&StateFile::from_state(state))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Write to a sibling temp file, fsync, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StateError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| write_error(path, e))?;
    }

    let tmp_path = tmp_path_for(path);
    let write = || -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp_path, path)
    };

    if let Err(e) = write() {
        if let Err(cleanup) = std::fs::remove_file(&tmp_path)
            && cleanup.kind() != ErrorKind::NotFound
        {
            warn!(
                path = %tmp_path.display(),
                error = %cleanup,
                "Could not remove temp state file"
            );
        }
        return Err(write_error(path, e));
    }
    Ok(())
}

fn write_error(path: &Path, e: impl std::fmt::Display) -> StateError {
    StateError::Write {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "state.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}
