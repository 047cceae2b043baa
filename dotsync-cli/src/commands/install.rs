//! `dotsync install`: run the manifest's install commands for this platform.

use std::io::{self, BufRead, Write};
use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use dotsync_core::manifest::current_platform;
use dotsync_core::DotfileManifest;

use crate::config::ConfigArgs;

/// Arguments for `dotsync install`.
#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Do not ask for confirmation.
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Print the commands without running them.
    #[arg(long)]
    pub dry_run: bool,
}

impl InstallArgs {
    pub fn run(self, args: &ConfigArgs) -> Result<()> {
        let config = args.load()?;
        let layout = config.layout().context("invalid agent configuration")?;
        let manifest = DotfileManifest::load_at(&layout.manifest_path).with_context(|| {
            format!(
                "failed to read {}; run `dotsync sync` first",
                layout.manifest_path.display()
            )
        })?;

        let platform = current_platform();
        let plan = manifest.install_plan(platform);
        if plan.is_empty() {
            println!("Nothing to install on {platform}.");
            return Ok(());
        }

        let prefix = if self.dry_run { "[dry-run] " } else { "" };
        println!("{prefix}{} install commands for {platform}:", plan.len());
        for (software, command) in &plan {
            println!("  {} {}", format!("{software}:").bold(), command);
        }
        if self.dry_run {
            return Ok(());
        }

        if !self.yes && !confirm("Run these commands?")? {
            println!("Aborted.");
            return Ok(());
        }

        let mut failed = Vec::new();
        for (software, command) in &plan {
            println!("{} {software}", "→".cyan().bold());
            let status = shell(command)
                .current_dir(&layout.home_dir)
                .status()
                .with_context(|| format!("failed to start install command for '{software}'"))?;
            if status.success() {
                println!("{} {software}", "✓".green().bold());
            } else {
                println!("{} {software} ({status})", "✗".red().bold());
                failed.push(software.as_str());
            }
        }

        if !failed.is_empty() {
            bail!("install failed for: {}", failed.join(", "));
        }
        Ok(())
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    io::stdout().flush().context("failed to write prompt")?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read answer")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
