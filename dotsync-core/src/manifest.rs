//! Dotfile manifest (`dotfile-config.yaml` at the repository root).
//!
//! ```yaml
//! dotfiles:
//!   - software: neovim
//!     install:
//!       linux: sudo apt install -y neovim
//!       macos: brew install neovim
//!     files:
//!       - path: nvim;          # trailing `;` marks a directory
//!         target: home/.config
//!   - software: git
//!     install: echo preinstalled
//!     files:
//!       - path: .gitconfig
//!         target: home
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DotfileManifest {
    #[serde(default)]
    pub dotfiles: Vec<DotfileEntry>,
}

/// One piece of software and the files that configure it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DotfileEntry {
    pub software: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<InstallCommand>,
    #[serde(default)]
    pub files: Vec<FileSpec>,
}

/// Either one command for every platform, or a map keyed by platform
/// (`linux`, `macos`/`darwin`, `windows`, ..., or `all`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstallCommand {
    Single(String),
    PerPlatform(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub path: String,
    pub target: String,
}

/// A resolved source → destination copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMapping {
    pub software: String,
    pub src: PathBuf,
    pub dest: PathBuf,
    pub is_dir: bool,
}

impl InstallCommand {
    pub fn for_platform(&self, platform: &str) -> Option<&str> {
        match self {
            InstallCommand::Single(cmd) => Some(cmd.as_str()),
            InstallCommand::PerPlatform(map) => platform_aliases(platform)
                .iter()
                .find_map(|key| map.get(*key))
                .or_else(|| map.get("all"))
                .map(String::as_str),
        }
    }
}

fn platform_aliases(platform: &str) -> Vec<&str> {
    match platform {
        "macos" | "darwin" => vec!["macos", "darwin"],
        other => vec![other],
    }
}

/// `std::env::consts::OS` of the running agent.
pub fn current_platform() -> &'static str {
    std::env::consts::OS
}

impl DotfileManifest {
    pub fn load_at(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolve every file spec against the checked-out repo and `home`.
    ///
    /// Sources that do not exist in the repository are skipped.
    pub fn file_mappings(&self, repo_dir: &Path, home: &Path) -> Vec<FileMapping> {
        let mut mappings = Vec::new();
        for entry in &self.dotfiles {
            for spec in &entry.files {
                let is_dir = spec.path.ends_with(';');
                let clean = spec.path.trim_end_matches(';');
                let src = repo_dir.join(clean);
                if !src.exists() {
                    continue;
                }
                let dest = resolve_target(&spec.target, home).join(clean);
                mappings.push(FileMapping {
                    software: entry.software.clone(),
                    src,
                    dest,
                    is_dir,
                });
            }
        }
        mappings
    }

    /// `(software, command)` pairs installable on `platform`, in manifest order.
    pub fn install_plan(&self, platform: &str) -> Vec<(String, String)> {
        self.dotfiles
            .iter()
            .filter_map(|entry| {
                let cmd = entry.install.as_ref()?.for_platform(platform)?;
                if cmd.trim().is_empty() {
                    return None;
                }
                Some((entry.software.clone(), cmd.to_string()))
            })
            .collect()
    }

    pub fn software(&self) -> Vec<&str> {
        self.dotfiles.iter().map(|e| e.software.as_str()).collect()
    }
}

/// `home`, `~` and paths below them resolve against `home`; anything else
/// is taken as written.
fn resolve_target(target: &str, home: &Path) -> PathBuf {
    let target = target.trim();
    for prefix in ["home", "~"] {
        if target == prefix {
            return home.to_path_buf();
        }
        if let Some(rest) = target.strip_prefix(prefix).and_then(|r| r.strip_prefix('/')) {
            return home.join(rest);
        }
    }
    PathBuf::from(target)
}
