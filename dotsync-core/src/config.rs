//! Agent configuration.
//!
//! Loaded from an optional YAML file (`~/.config/dotsync/agent.yaml`); every
//! field has a default so a missing file is not an error. Flags and
//! environment variables are applied on top by the CLI. Nothing here reads
//! or changes the process working directory: all paths are resolved into an
//! explicit [`RepoLayout`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};

pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_API_BASE_URL: &str = "https://api.github.com";
pub const DEFAULT_MANIFEST: &str = "dotfile-config.yaml";

// ---------------------------------------------------------------------------
// Config structs
// ---------------------------------------------------------------------------

/// How fetched dotfiles are materialized into the home directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Copy files listed in the repository's manifest.
    #[default]
    Copy,
    /// Symlink the whole repository with GNU stow.
    Stow,
}

/// Remote coordination broker. Notifications are disabled unless both are set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub url: String,
    pub machine_id: String,
}

/// Intervals and deadlines, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub debounce_secs: u64,
    pub poll_interval_secs: u64,
    pub subscription_timeout_secs: u64,
    pub retry_backoff_secs: u64,
    pub request_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            debounce_secs: 10,
            poll_interval_secs: 30,
            subscription_timeout_secs: 60,
            retry_backoff_secs: 5,
            request_timeout_secs: 10,
            command_timeout_secs: 300,
        }
    }
}

impl Timing {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn subscription_timeout(&self) -> Duration {
        Duration::from_secs(self.subscription_timeout_secs.max(1))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }
}

/// Full agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory the repository is cloned into. Defaults to `<config dir>/dotfiles`.
    pub dotfile_path: Option<PathBuf>,
    /// Clone URL, e.g. `https://github.com/owner/dotfiles.git`.
    pub repository: Option<String>,
    pub branch: String,
    pub api_base_url: String,
    #[serde(skip_serializing)]
    pub github_token: Option<String>,
    /// Push relay (SSE) carrying webhook deliveries.
    pub webhook_url: Option<String>,
    pub port: u16,
    /// Where the agent keeps its own state. Defaults to `<config dir>/dotfile-agent`.
    pub state_dir: Option<PathBuf>,
    /// Target of materialized files. Defaults to the user's home directory.
    pub home_dir: Option<PathBuf>,
    pub strategy: StrategyKind,
    pub manifest: String,
    pub broker: Option<BrokerConfig>,
    pub timing: Timing,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            dotfile_path: None,
            repository: None,
            branch: DEFAULT_BRANCH.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            github_token: None,
            webhook_url: None,
            port: DEFAULT_PORT,
            state_dir: None,
            home_dir: None,
            strategy: StrategyKind::default(),
            manifest: DEFAULT_MANIFEST.to_string(),
            broker: None,
            timing: Timing::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Repository URL
// ---------------------------------------------------------------------------

/// Owner and name extracted from a clone URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoUrl {
    pub clone_url: String,
    pub owner: String,
    pub name: String,
}

impl RepoUrl {
    /// Accepts `https://host/owner/repo.git` and `git@host:owner/repo.git`.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidRepoUrl(url.to_string());
        let trimmed = url.trim();

        let path = if let Some((_, rest)) = trimmed.split_once("://") {
            rest.split_once('/').map(|(_, path)| path).ok_or_else(invalid)?
        } else if let Some((_, path)) = trimmed.split_once(':') {
            path
        } else {
            return Err(invalid());
        };

        let path = path.trim_matches('/');
        let path = path.strip_suffix(".git").ok_or_else(invalid)?;
        let mut segments = path.rsplitn(2, '/');
        let name = segments.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let owner = segments
            .next()
            .map(|owner| owner.rsplit('/').next().unwrap_or(owner))
            .filter(|s| !s.is_empty())
            .ok_or_else(invalid)?;

        Ok(Self {
            clone_url: trimmed.to_string(),
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Every filesystem location a sync touches, resolved up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLayout {
    pub repo: RepoUrl,
    pub branch: String,
    pub dotfile_dir: PathBuf,
    /// `<dotfile_dir>/<repo name>`
    pub repo_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub home_dir: PathBuf,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl AgentConfig {
    /// `<config dir>/dotsync/agent.yaml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(config_dir()?.join("dotsync").join("agent.yaml"))
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load_at(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks the fields every running agent needs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.github_token.as_deref() {
            Some(token) if !token.trim().is_empty() => {}
            _ => return Err(ConfigError::MissingToken),
        }
        self.repo_url().map(|_| ())
    }

    pub fn repo_url(&self) -> Result<RepoUrl, ConfigError> {
        let url = self
            .repository
            .as_deref()
            .ok_or(ConfigError::MissingRepository)?;
        RepoUrl::parse(url)
    }

    pub fn dotfile_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.dotfile_path {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join("dotfiles")),
        }
    }

    pub fn state_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.state_dir {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join("dotfile-agent")),
        }
    }

    pub fn home_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.home_dir {
            Some(path) => Ok(path.clone()),
            None => dirs::home_dir().ok_or(ConfigError::HomeNotFound),
        }
    }

    /// Broker settings, only when both url and machine id are non-empty.
    pub fn broker(&self) -> Option<&BrokerConfig> {
        self.broker
            .as_ref()
            .filter(|b| !b.url.trim().is_empty() && !b.machine_id.trim().is_empty())
    }

    pub fn layout(&self) -> Result<RepoLayout, ConfigError> {
        let repo = self.repo_url()?;
        let dotfile_dir = self.dotfile_dir()?;
        let repo_dir = dotfile_dir.join(&repo.name);
        let manifest_path = repo_dir.join(&self.manifest);
        Ok(RepoLayout {
            repo,
            branch: self.branch.clone(),
            dotfile_dir,
            repo_dir,
            manifest_path,
            home_dir: self.home_dir()?,
        })
    }
}

fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir().ok_or(ConfigError::HomeNotFound)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
