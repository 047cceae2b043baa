//! Sync strategies: the step lists the sequencer runs for each way of
//! materializing dotfiles.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use dotsync_core::{DotfileManifest, FileMapping, RepoLayout, StrategyKind};

use crate::error::SyncError;
use crate::git::{self, PullMode};
use crate::materialize;
use crate::steps::Step;

pub const STEP_CHECKOUT: &str = "Checkout repository";
pub const STEP_PARSE_MANIFEST: &str = "Parse dotfile manifest";
pub const STEP_COPY: &str = "Copy dotfiles to configured locations";
pub const STEP_PULL: &str = "Pull repository";
pub const STEP_STOW: &str = "Stow dotfiles";

/// Produces a fresh step list for every run.
pub trait StepPlan: Send + Sync {
    fn steps(&self) -> Vec<Step>;
}

/// Built-in strategies, chosen once from configuration.
#[derive(Debug, Clone)]
pub enum SyncStrategy {
    /// Clone or pull, read the manifest, copy every listed file.
    Copy(Arc<StrategyContext>),
    /// Clone or `pull --rebase`, then `stow` the whole checkout into home.
    Stow(Arc<StrategyContext>),
}

#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub layout: RepoLayout,
    pub command_timeout: Duration,
}

impl SyncStrategy {
    pub fn new(kind: StrategyKind, layout: RepoLayout, command_timeout: Duration) -> Self {
        let ctx = Arc::new(StrategyContext {
            layout,
            command_timeout,
        });
        match kind {
            StrategyKind::Copy => SyncStrategy::Copy(ctx),
            StrategyKind::Stow => SyncStrategy::Stow(ctx),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            SyncStrategy::Copy(_) => StrategyKind::Copy,
            SyncStrategy::Stow(_) => StrategyKind::Stow,
        }
    }

    pub fn layout(&self) -> &RepoLayout {
        match self {
            SyncStrategy::Copy(ctx) | SyncStrategy::Stow(ctx) => &ctx.layout,
        }
    }
}

impl StepPlan for SyncStrategy {
    fn steps(&self) -> Vec<Step> {
        match self {
            SyncStrategy::Copy(ctx) => copy_steps(ctx),
            SyncStrategy::Stow(ctx) => stow_steps(ctx),
        }
    }
}

fn copy_steps(ctx: &Arc<StrategyContext>) -> Vec<Step> {
    // Filled by the parse step, drained by the copy step.
    let parsed: Arc<Mutex<Option<Vec<FileMapping>>>> = Arc::new(Mutex::new(None));

    let checkout = {
        let ctx = Arc::clone(ctx);
        Step::new(STEP_CHECKOUT, move || async move {
            git::clone_or_pull(&ctx.layout, PullMode::Merge, ctx.command_timeout).await
        })
    };

    let parse = {
        let ctx = Arc::clone(ctx);
        let parsed = Arc::clone(&parsed);
        Step::new(STEP_PARSE_MANIFEST, move || async move {
            let mappings = resolve_mappings(&ctx.layout)?;
            *parsed.lock().await = Some(mappings);
            Ok(())
        })
    };

    let copy = Step::new(STEP_COPY, move || async move {
        let mappings = parsed.lock().await.take().unwrap_or_default();
        tokio::task::spawn_blocking(move || materialize::materialize_all(&mappings)).await??;
        Ok(())
    });

    vec![checkout, parse, copy]
}

/// Read the manifest and resolve it against the checkout and home directory.
pub fn resolve_mappings(layout: &RepoLayout) -> Result<Vec<FileMapping>, SyncError> {
    let manifest = DotfileManifest::load_at(&layout.manifest_path)?;
    let mappings = manifest.file_mappings(&layout.repo_dir, &layout.home_dir);
    if mappings.is_empty() {
        return Err(SyncError::NothingToSync);
    }
    tracing::debug!(count = mappings.len(), "resolved dotfile mappings");
    Ok(mappings)
}

fn stow_steps(ctx: &Arc<StrategyContext>) -> Vec<Step> {
    let pull = {
        let ctx = Arc::clone(ctx);
        Step::new(STEP_PULL, move || async move {
            git::clone_or_pull(&ctx.layout, PullMode::Rebase, ctx.command_timeout).await
        })
    };

    let ctx = Arc::clone(ctx);
    let stow = Step::new(STEP_STOW, move || async move {
        run_stow(&ctx.layout.repo_dir, &ctx.layout.home_dir, ctx.command_timeout).await
    });

    vec![pull, stow]
}

async fn run_stow(repo_dir: &Path, home: &Path, deadline: Duration) -> Result<(), SyncError> {
    let target = home.to_string_lossy().to_string();
    git::run_command("stow", &[".", "-t", target.as_str()], repo_dir, deadline).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotsync_core::RepoUrl;
    use tempfile::TempDir;

    fn layout(root: &Path) -> RepoLayout {
        let repo = RepoUrl::parse("https://github.com/octo/dotfiles.git").unwrap();
        let dotfile_dir = root.join("dotfiles");
        let repo_dir = dotfile_dir.join(&repo.name);
        RepoLayout {
            manifest_path: repo_dir.join("dotfile-config.yaml"),
            repo,
            branch: "main".into(),
            dotfile_dir,
            repo_dir,
            home_dir: root.join("home"),
        }
    }

    fn names(steps: &[Step]) -> Vec<&str> {
        steps.iter().map(Step::name).collect()
    }

    #[test]
    fn copy_strategy_has_three_named_steps() {
        let strategy = SyncStrategy::new(
            StrategyKind::Copy,
            layout(Path::new("/tmp/x")),
            Duration::from_secs(1),
        );
        assert_eq!(
            names(&strategy.steps()),
            vec![STEP_CHECKOUT, STEP_PARSE_MANIFEST, STEP_COPY]
        );
    }

    #[test]
    fn stow_strategy_pulls_then_stows() {
        let strategy = SyncStrategy::new(
            StrategyKind::Stow,
            layout(Path::new("/tmp/x")),
            Duration::from_secs(1),
        );
        assert_eq!(strategy.kind(), StrategyKind::Stow);
        assert_eq!(names(&strategy.steps()), vec![STEP_PULL, STEP_STOW]);
    }

    #[test]
    fn manifest_without_present_files_is_nothing_to_sync() {
        let tmp = TempDir::new().unwrap();
        let layout = layout(tmp.path());
        std::fs::create_dir_all(&layout.repo_dir).unwrap();
        std::fs::write(
            &layout.manifest_path,
            "dotfiles:\n  - software: git\n    files:\n      - path: .gitconfig\n        target: home\n",
        )
        .unwrap();

        assert!(matches!(
            resolve_mappings(&layout),
            Err(SyncError::NothingToSync)
        ));
    }

    #[test]
    fn mappings_resolve_against_layout_home() {
        let tmp = TempDir::new().unwrap();
        let layout = layout(tmp.path());
        std::fs::create_dir_all(&layout.repo_dir).unwrap();
        std::fs::write(layout.repo_dir.join(".gitconfig"), "[user]").unwrap();
        std::fs::write(
            &layout.manifest_path,
            "dotfiles:\n  - software: git\n    files:\n      - path: .gitconfig\n        target: home\n",
        )
        .unwrap();

        let mappings = resolve_mappings(&layout).unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].dest, tmp.path().join("home/.gitconfig"));
    }

    #[test]
    fn missing_manifest_is_a_config_error() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            resolve_mappings(&layout(tmp.path())),
            Err(SyncError::Config(_))
        ));
    }
}
