//! Subprocess helpers for `git` and `stow`.
//!
//! Every command gets an explicit working directory and is killed when its
//! deadline passes. Nothing here touches the process-wide current directory.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use dotsync_core::{Commit, RepoLayout};

use crate::error::{io_err, SyncError};

/// Run `program args..` in `dir`, returning trimmed stdout on success.
pub async fn run_command(
    program: &str,
    args: &[&str],
    dir: &Path,
    deadline: Duration,
) -> Result<String, SyncError> {
    tracing::debug!(program, ?args, dir = %dir.display(), "spawning command");

    // A missing cwd also surfaces as NotFound from spawn.
    if !dir.is_dir() {
        return Err(io_err(
            dir,
            std::io::Error::new(std::io::ErrorKind::NotFound, "working directory does not exist"),
        ));
    }

    let child = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SyncError::CommandNotFound {
                    program: program.to_string(),
                }
            } else {
                io_err(dir, e)
            }
        })?;

    let output = match tokio::time::timeout(deadline, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| io_err(dir, e))?,
        Err(_) => {
            return Err(SyncError::Timeout {
                what: format!("{program} {}", args.join(" ")),
                after: deadline,
            })
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let combined = match (stdout.is_empty(), stderr.is_empty()) {
        (false, false) => format!("{stdout}\n{stderr}"),
        (false, true) => stdout,
        _ => stderr,
    };
    Err(SyncError::Command {
        program: program.to_string(),
        code: output.status.code().unwrap_or(-1),
        output: combined,
    })
}

/// How an existing checkout is brought up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullMode {
    Merge,
    Rebase,
}

/// Clone the repository if `repo_dir` is not a checkout yet, pull otherwise.
pub async fn clone_or_pull(
    layout: &RepoLayout,
    mode: PullMode,
    deadline: Duration,
) -> Result<(), SyncError> {
    if layout.repo_dir.join(".git").exists() {
        tracing::info!(repo = %layout.repo_dir.display(), branch = %layout.branch, "pulling repository");
        let mut args = vec!["pull"];
        if mode == PullMode::Rebase {
            args.push("--rebase");
        }
        args.extend(["origin", layout.branch.as_str()]);
        run_command("git", &args, &layout.repo_dir, deadline).await?;
        return Ok(());
    }

    tokio::fs::create_dir_all(&layout.dotfile_dir)
        .await
        .map_err(|e| io_err(&layout.dotfile_dir, e))?;

    tracing::info!(url = %layout.repo.clone_url, dest = %layout.repo_dir.display(), "cloning repository");
    let dest = layout.repo_dir.to_string_lossy().to_string();
    run_command(
        "git",
        &[
            "clone",
            "--branch",
            layout.branch.as_str(),
            layout.repo.clone_url.as_str(),
            dest.as_str(),
        ],
        &layout.dotfile_dir,
        deadline,
    )
    .await?;
    Ok(())
}

/// Head commit of the checkout in `repo_dir`.
pub async fn local_head(repo_dir: &Path, deadline: Duration) -> Result<Commit, SyncError> {
    let out = run_command("git", &["log", "-1", "--format=%H%n%cI"], repo_dir, deadline).await?;
    parse_head(&out)
}

fn parse_head(out: &str) -> Result<Commit, SyncError> {
    let mut lines = out.lines().map(str::trim).filter(|l| !l.is_empty());
    let id = lines
        .next()
        .filter(|id| id.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| SyncError::MalformedLog(out.to_string()))?;
    let commit = Commit::new(id);
    Ok(match lines.next() {
        Some(time) => commit.with_time(time),
        None => commit,
    })
}
