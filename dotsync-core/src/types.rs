//! Domain types shared by the pipeline, the daemon and the CLI.
//!
//! Everything here is plain data: serializable with serde, cheap to clone,
//! and never mutated once handed to another component.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// An opaque commit identifier (content hash). Compared byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(pub String);

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for CommitId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CommitId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Commits
// ---------------------------------------------------------------------------

/// A commit as reported by the local repository or the remote API.
///
/// `time` is informational only and never takes part in equality decisions
/// made by the divergence check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    #[serde(
        rename = "commit_time",
        alias = "time",
        alias = "timestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub time: Option<String>,
}

impl Commit {
    pub fn new(id: impl Into<CommitId>) -> Self {
        Self {
            id: id.into(),
            time: None,
        }
    }

    pub fn with_time(mut self, time: impl Into<String>) -> Self {
        self.time = Some(time.into());
        self
    }

    /// Parse `time` as RFC 3339, if present and well-formed.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// What started a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncKind {
    Manual,
    Automatic,
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncKind::Manual => write!(f, "Manual"),
            SyncKind::Automatic => write!(f, "Automatic"),
        }
    }
}

// ---------------------------------------------------------------------------
// Progress events
// ---------------------------------------------------------------------------

/// One progress notification of a sync run.
///
/// Within a run `progress` never decreases, and exactly one event carries
/// `done = true`: the last one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub progress: u8,
    pub success: bool,
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub done: bool,
}

impl SyncEvent {
    pub fn completed(step: impl Into<String>, progress: u8, done: bool) -> Self {
        Self {
            progress,
            success: true,
            step: step.into(),
            error: None,
            done,
        }
    }

    /// The terminal event of a run whose step `step` failed.
    pub fn failed(step: impl Into<String>, progress: u8, error: impl Into<String>) -> Self {
        Self {
            progress,
            success: false,
            step: step.into(),
            error: Some(error.into()),
            done: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Local vs remote head at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub local_commit: Option<Commit>,
    pub remote_commit: Option<Commit>,
    pub is_synced: bool,
}

impl SyncSnapshot {
    /// Build a snapshot; unknown commits are never considered synced.
    pub fn new(local_commit: Option<Commit>, remote_commit: Option<Commit>) -> Self {
        let is_synced = match (&local_commit, &remote_commit) {
            (Some(local), Some(remote)) => local.id == remote.id,
            _ => false,
        };
        Self {
            local_commit,
            remote_commit,
            is_synced,
        }
    }

    /// True when both heads were actually obtained.
    pub fn is_conclusive(&self) -> bool {
        self.local_commit.is_some() && self.remote_commit.is_some()
    }
}

/// Durable record of the most recent completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub kind: SyncKind,
    pub time: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<Commit>,
}

/// Payload of the status query endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub local_commit: Option<Commit>,
    pub remote_commit: Option<Commit>,
    pub is_synced: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_sync_type: Option<SyncKind>,
    pub last_sync_success: Option<bool>,
}

impl StatusReport {
    pub fn new(snapshot: SyncSnapshot, last: Option<&SyncStatus>) -> Self {
        Self {
            local_commit: snapshot.local_commit,
            remote_commit: snapshot.remote_commit,
            is_synced: snapshot.is_synced,
            last_sync_time: last.map(|s| s.time),
            last_sync_type: last.map(|s| s.kind),
            last_sync_success: last.map(|s| s.success),
        }
    }
}

// ---------------------------------------------------------------------------
// Relay messages
// ---------------------------------------------------------------------------

/// A push notification relayed from the git host's webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub head_commit: Option<Commit>,
}

impl PushMessage {
    /// Branch name of the pushed ref (`refs/heads/main` → `main`).
    pub fn branch(&self) -> &str {
        self.git_ref
            .strip_prefix("refs/heads/")
            .unwrap_or(&self.git_ref)
    }

    pub fn targets(&self, branch: &str) -> bool {
        self.branch() == branch
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
