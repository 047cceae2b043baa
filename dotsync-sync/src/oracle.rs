//! Divergence detection: compares the local checkout's head with the remote
//! branch head.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use dotsync_core::{Commit, RepoLayout, SyncSnapshot};

use crate::error::SyncError;
use crate::git;

const USER_AGENT: &str = "dotsync-agent";

/// Source of the two commit heads a divergence check compares.
#[async_trait]
pub trait CommitSource: Send + Sync {
    async fn local_head(&self) -> Result<Commit, SyncError>;
    async fn remote_head(&self) -> Result<Commit, SyncError>;
}

/// True when the heads differ or either one is unknown.
///
/// Only ids are compared.
pub fn diverged(local: Option<&Commit>, remote: Option<&Commit>) -> bool {
    match (local, remote) {
        (Some(local), Some(remote)) => local.id != remote.id,
        _ => true,
    }
}

/// Query both heads concurrently. A failed lookup is logged and reported as
/// an unknown commit.
pub async fn snapshot(source: &dyn CommitSource) -> SyncSnapshot {
    let (local, remote) = tokio::join!(source.local_head(), source.remote_head());
    let local = local
        .map_err(|err| tracing::warn!(error = %err, "could not read local head"))
        .ok();
    let remote = remote
        .map_err(|err| tracing::warn!(error = %err, "could not read remote head"))
        .ok();
    SyncSnapshot::new(local, remote)
}

// ---------------------------------------------------------------------------
// GitOracle
// ---------------------------------------------------------------------------

/// Production [`CommitSource`]: `git log` on the checkout and the GitHub
/// commits API for the remote branch.
pub struct GitOracle {
    client: reqwest::Client,
    layout: RepoLayout,
    api_base_url: String,
    token: String,
    request_timeout: Duration,
    command_timeout: Duration,
}

impl GitOracle {
    pub fn new(
        client: reqwest::Client,
        layout: RepoLayout,
        api_base_url: impl Into<String>,
        token: impl Into<String>,
        request_timeout: Duration,
        command_timeout: Duration,
    ) -> Self {
        Self {
            client,
            layout,
            api_base_url: api_base_url.into(),
            token: token.into(),
            request_timeout,
            command_timeout,
        }
    }

    pub fn into_shared(self) -> Arc<dyn CommitSource> {
        Arc::new(self)
    }

    fn commits_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/commits",
            self.api_base_url.trim_end_matches('/'),
            self.layout.repo.owner,
            self.layout.repo.name
        )
    }
}

#[derive(Debug, Deserialize)]
struct ApiCommit {
    sha: String,
    #[serde(default)]
    commit: Option<ApiCommitDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiCommitDetail {
    #[serde(default)]
    committer: Option<ApiSignature>,
}

#[derive(Debug, Deserialize)]
struct ApiSignature {
    #[serde(default)]
    date: Option<String>,
}

impl From<ApiCommit> for Commit {
    fn from(api: ApiCommit) -> Self {
        let time = api
            .commit
            .and_then(|c| c.committer)
            .and_then(|s| s.date);
        Commit {
            id: api.sha.into(),
            time,
        }
    }
}

#[async_trait]
impl CommitSource for GitOracle {
    async fn local_head(&self) -> Result<Commit, SyncError> {
        git::local_head(&self.layout.repo_dir, self.command_timeout).await
    }

    async fn remote_head(&self) -> Result<Commit, SyncError> {
        let response = self
            .client
            .get(self.commits_url())
            .query(&[("sha", self.layout.branch.as_str()), ("per_page", "1")])
            .bearer_auth(&self.token)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::RemoteStatus {
                what: "remote commits",
                status: status.as_u16(),
            });
        }

        let commits: Vec<ApiCommit> = response.json().await?;
        commits
            .into_iter()
            .next()
            .map(Commit::from)
            .ok_or(SyncError::NoRemoteCommits)
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::sync::Mutex;

    /// Scriptable heads for pipeline and oracle tests. `None` fails the lookup.
    #[derive(Default)]
    pub struct FixedHeads {
        pub local: Mutex<Option<Commit>>,
        pub remote: Mutex<Option<Commit>>,
    }

    impl FixedHeads {
        pub fn new(local: Option<&str>, remote: Option<&str>) -> Self {
            Self {
                local: Mutex::new(local.map(Commit::new)),
                remote: Mutex::new(remote.map(Commit::new)),
            }
        }

        pub fn set_local(&self, id: &str) {
            *self.local.lock().unwrap() = Some(Commit::new(id));
        }
    }

    #[async_trait]
    impl CommitSource for FixedHeads {
        async fn local_head(&self) -> Result<Commit, SyncError> {
            self.local
                .lock()
                .unwrap()
                .clone()
                .ok_or(SyncError::MalformedLog(String::new()))
        }

        async fn remote_head(&self) -> Result<Commit, SyncError> {
            self.remote
                .lock()
                .unwrap()
                .clone()
                .ok_or(SyncError::NoRemoteCommits)
        }
    }
}
