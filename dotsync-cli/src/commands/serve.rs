//! `dotsync serve`: run the agent in the foreground.

use anyhow::{Context, Result};
use clap::Args;

use dotsync_daemon::start_blocking;

use crate::config::ConfigArgs;

/// Arguments for `dotsync serve`.
#[derive(Args, Debug)]
pub struct ServeArgs {}

impl ServeArgs {
    pub fn run(self, config: &ConfigArgs) -> Result<()> {
        let config = config.load()?;
        start_blocking(config).context("agent exited with error")
    }
}
