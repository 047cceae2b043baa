//! dotsync: keep a machine's dotfiles in step with a git repository.
//!
//! # Usage
//!
//! ```text
//! dotsync serve
//! dotsync sync [--agent <url>] [--local]
//! dotsync status [--agent <url>] [--json]
//! dotsync install [--yes] [--dry-run]
//! ```
//!
//! Every command reads the agent configuration (`--config` / `DOTSYNC_CONFIG`,
//! default `~/.config/dotsync/agent.yaml`) with flag and environment
//! overrides applied on top.

mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{install::InstallArgs, serve::ServeArgs, status::StatusArgs, sync::SyncArgs};
use config::ConfigArgs;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "dotsync",
    version,
    about = "Keep dotfiles in sync with a git repository",
    long_about = None,
)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync agent in the foreground.
    Serve(ServeArgs),

    /// Start a manual sync and follow its progress.
    Sync(SyncArgs),

    /// Show local vs remote head and the last sync.
    Status(StatusArgs),

    /// Run the manifest's install commands for this platform.
    Install(InstallArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => args.run(&cli.config),
        Commands::Sync(args) => args.run(&cli.config),
        Commands::Status(args) => args.run(&cli.config),
        Commands::Install(args) => args.run(&cli.config),
    }
}
