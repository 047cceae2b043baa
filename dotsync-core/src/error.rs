//! Error types for dotsync-core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from loading agent configuration or a dotfile manifest.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O failure with the offending path.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error, with the file it came from.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    #[error("no GitHub token configured; set GITHUB_TOKEN")]
    MissingToken,

    #[error("no repository configured")]
    MissingRepository,

    #[error("not a git repository url: {0}")]
    InvalidRepoUrl(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}
