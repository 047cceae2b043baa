//! Error types for dotsync-sync.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use dotsync_core::ConfigError;

/// All errors that can arise from sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A pipeline was asked to run without any steps.
    #[error("sync pipeline has no steps")]
    EmptyPipeline,

    /// Configuration or manifest problem.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote API answered with a non-success status.
    #[error("unable to fetch {what}: HTTP {status}")]
    RemoteStatus { what: &'static str, status: u16 },

    #[error("remote repository has no commits on the tracked branch")]
    NoRemoteCommits,

    #[error("`{program}` not found in PATH")]
    CommandNotFound { program: String },

    #[error("`{program}` exited with status {code}: {output}")]
    Command {
        program: String,
        code: i32,
        output: String,
    },

    #[error("unexpected `git log` output: {0:?}")]
    MalformedLog(String),

    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("manifest lists no dotfiles present in the repository")]
    NothingToSync,

    /// A step body panicked.
    #[error("step panicked: {0}")]
    Panicked(String),

    /// A consumer could not take delivery of an event.
    #[error("delivery to {consumer} failed: {reason}")]
    Delivery { consumer: String, reason: String },

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
