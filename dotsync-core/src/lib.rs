//! dotsync core library: domain types, agent configuration and the dotfile manifest.
//!
//! - [`types`]: commits, progress events, status records
//! - [`config`]: [`AgentConfig`] and the resolved [`RepoLayout`]
//! - [`manifest`]: the repository's `dotfile-config.yaml`
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod manifest;
pub mod types;

pub use config::{AgentConfig, BrokerConfig, RepoLayout, RepoUrl, StrategyKind, Timing};
pub use error::ConfigError;
pub use manifest::{DotfileManifest, FileMapping};
pub use types::{
    Commit, CommitId, PushMessage, StatusReport, SyncEvent, SyncKind, SyncSnapshot, SyncStatus,
};
