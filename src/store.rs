//! Durable FIFO of pending admissions.
//!
//! Only *queued* sessions are persisted. In-flight model state is not
//! resumable across a process restart, so active sessions are deliberately
//! left out of the on-disk image: their clients observe `not_found` after a
//! restart and re-submit, while every reclaimable admission is replayed.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::StartSessionRequest;

/// One pending admission: the id, the full start request needed to resume
/// it, and its arrival time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub session_id: String,
    /// Snapshot of every field the admission path needs to resume.
    #[serde(rename = "request_data")]
    pub request: StartSessionRequest,
    /// Seconds since the Unix epoch.
    pub enqueue_time: f64,
}

/// Persists the pending queue as a single JSON array.
///
/// `save` replaces the file atomically (write a sibling temp file, then
/// rename), so a reader racing a save observes either the pre-save or the
/// post-save image in full, never a truncated prefix.
pub struct QueueStore {
    path: PathBuf,
}

impl QueueStore {
    /// Open a store at `path`, creating the parent directory if needed.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        tracing::info!(path = %path.display(), "queue store opened");
        Ok(QueueStore { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replace the on-disk image with `entries`.
    ///
    /// Takes the entries by slice, so the caller may invoke this from
    /// inside or outside its own bookkeeping lock without re-entry.
    pub fn save(&self, entries: &[QueueEntry]) -> Result<()> {
        let json = serde_json::to_vec(entries)
            .map_err(|e| Error::Persistence(format!("serialize queue: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json).map_err(|e| {
            Error::Persistence(format!("write {}: {e}", tmp.display()))
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            Error::Persistence(format!("rename into {}: {e}", self.path.display()))
        })?;

        tracing::debug!(entries = entries.len(), "queue image saved");
        Ok(())
    }

    /// Load the ordered sequence of pending admissions.
    ///
    /// An absent file is an empty queue. Records that no longer parse into
    /// a known request shape are skipped with a warning; recovery is never
    /// aborted by one bad record.
    pub fn load(&self) -> Result<Vec<QueueEntry>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no queue file, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(Error::Persistence(format!(
                    "read {}: {e}",
                    self.path.display()
                )));
            }
        };

        let raw: Vec<serde_json::Value> = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Persistence(format!("parse queue file: {e}")))?;

        let mut entries = Vec::with_capacity(raw.len());
        for value in raw {
            match serde_json::from_value::<QueueEntry>(value) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unrecognized queue record");
                }
            }
        }

        tracing::info!(entries = entries.len(), "queue image loaded");
        Ok(entries)
    }
}
