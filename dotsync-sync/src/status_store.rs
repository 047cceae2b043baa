//! Durable record of the most recent sync run.
//!
//! Persists a single [`SyncStatus`] JSON document at
//! `<state_dir>/sync-status.json`, written with `.tmp` + rename.
//! The record is informational only; nothing coordinates on it.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dotsync_core::SyncStatus;

use crate::error::{io_err, SyncError};

pub const STATUS_FILE: &str = "sync-status.json";

pub trait StatusStore: Send + Sync {
    /// The last recorded run, or `None` if no run was ever recorded.
    fn load(&self) -> Result<Option<SyncStatus>, SyncError>;
    fn save(&self, status: &SyncStatus) -> Result<(), SyncError>;
}

/// [`StatusStore`] backed by a JSON file in the agent's state directory.
#[derive(Debug, Clone)]
pub struct JsonStatusStore {
    path: PathBuf,
}

impl JsonStatusStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(STATUS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StatusStore for JsonStatusStore {
    fn load(&self) -> Result<Option<SyncStatus>, SyncError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path).map_err(|e| io_err(&self.path, e))?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn save(&self, status: &SyncStatus) -> Result<(), SyncError> {
        let Some(dir) = self.path.parent() else {
            return Err(io_err(
                &self.path,
                std::io::Error::other("invalid status file path"),
            ));
        };
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        let json = serde_json::to_string_pretty(status)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))?;
        Ok(())
    }
}

/// In-memory store for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    last: Mutex<Option<SyncStatus>>,
}

impl StatusStore for MemoryStatusStore {
    fn load(&self) -> Result<Option<SyncStatus>, SyncError> {
        Ok(self.last.lock().map(|s| s.clone()).unwrap_or_default())
    }

    fn save(&self, status: &SyncStatus) -> Result<(), SyncError> {
        if let Ok(mut last) = self.last.lock() {
            *last = Some(status.clone());
        }
        Ok(())
    }
}
