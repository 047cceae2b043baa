//! Copies manifest mappings into the home directory.
//!
//! Each destination file is hashed first; identical content is left alone.
//! Changed files are written to `<path>.dotsync.tmp` and renamed into place,
//! so a reader never sees a half-written dotfile.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use dotsync_core::FileMapping;

use crate::error::{io_err, SyncError};

/// Outcome of materializing a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    Written { path: PathBuf },
    /// Destination already had identical content.
    Unchanged { path: PathBuf },
}

impl WriteResult {
    pub fn path(&self) -> &Path {
        match self {
            WriteResult::Written { path } | WriteResult::Unchanged { path } => path,
        }
    }

    pub fn is_written(&self) -> bool {
        matches!(self, WriteResult::Written { .. })
    }
}

/// Materialize every mapping, recursing into directory mappings.
pub fn materialize_all(mappings: &[FileMapping]) -> Result<Vec<WriteResult>, SyncError> {
    let mut results = Vec::new();
    for mapping in mappings {
        tracing::debug!(
            software = %mapping.software,
            src = %mapping.src.display(),
            dest = %mapping.dest.display(),
            "materializing"
        );
        if mapping.is_dir || mapping.src.is_dir() {
            copy_dir(&mapping.src, &mapping.dest, &mut results)?;
        } else {
            results.push(copy_file(&mapping.src, &mapping.dest)?);
        }
    }

    let written = results.iter().filter(|r| r.is_written()).count();
    tracing::info!(written, unchanged = results.len() - written, "dotfiles materialized");
    Ok(results)
}

fn copy_dir(src: &Path, dest: &Path, results: &mut Vec<WriteResult>) -> Result<(), SyncError> {
    let mut entries = std::fs::read_dir(src)
        .map_err(|e| io_err(src, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| io_err(src, e))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| io_err(&path, e))?;
        if file_type.is_dir() {
            copy_dir(&path, &dest.join(&name), results)?;
        } else {
            results.push(copy_file(&path, &dest.join(&name))?);
        }
    }
    Ok(())
}

/// Copy one file unless the destination digest already matches.
pub fn copy_file(src: &Path, dest: &Path) -> Result<WriteResult, SyncError> {
    let content = std::fs::read(src).map_err(|e| io_err(src, e))?;
    let digest = sha256_hex(&content);

    if dest.is_file() {
        let existing = std::fs::read(dest).map_err(|e| io_err(dest, e))?;
        if sha256_hex(&existing) == digest {
            tracing::debug!("unchanged: {}", dest.display());
            return Ok(WriteResult::Unchanged {
                path: dest.to_path_buf(),
            });
        }
    }

    let tmp = PathBuf::from(format!("{}.dotsync.tmp", dest.display()));
    atomic_write(dest, &tmp, &content)?;

    tracing::debug!("wrote: {}", dest.display());
    Ok(WriteResult::Written {
        path: dest.to_path_buf(),
    })
}

fn atomic_write(path: &Path, tmp: &Path, content: &[u8]) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    std::fs::write(tmp, content).map_err(|e| io_err(tmp, e))?;
    if let Err(e) = std::fs::rename(tmp, path) {
        let _ = std::fs::remove_file(tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}
