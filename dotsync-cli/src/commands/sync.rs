//! `dotsync sync`: start a manual sync and print its progress.

use std::io::{BufRead, BufReader};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use dotsync_core::{SyncEvent, SyncKind};
use dotsync_daemon::Agent;
use dotsync_sync::ChannelConsumer;

use crate::config::ConfigArgs;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Arguments for `dotsync sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Agent to ask (defaults to the local agent on the configured port).
    #[arg(long)]
    pub agent: Option<String>,

    /// Run the sync in this process instead of asking the agent.
    #[arg(long, conflicts_with = "agent")]
    pub local: bool,
}

impl SyncArgs {
    pub fn run(self, args: &ConfigArgs) -> Result<()> {
        let config = args.load()?;
        let events = if self.local {
            run_in_process(config)?
        } else {
            let url = self.agent.unwrap_or_else(|| args.agent_url(&config));
            follow_agent(&url)?
        };
        finish(&events)
    }
}

fn follow_agent(url: &str) -> Result<Vec<SyncEvent>> {
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(CONNECT_TIMEOUT)
        .build();
    let response = agent
        .post(&format!("{}/sync", url.trim_end_matches('/')))
        .set("Accept", "text/event-stream")
        .call()
        .with_context(|| format!("could not reach agent at {url}; is `dotsync serve` running?"))?;

    let mut events = Vec::new();
    for line in BufReader::new(response.into_reader()).lines() {
        let line = line.context("agent stream interrupted")?;
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let event: SyncEvent =
            serde_json::from_str(data.trim_start()).context("malformed progress event")?;
        print_event(&event);
        let done = event.done;
        events.push(event);
        if done {
            break;
        }
    }
    Ok(events)
}

fn run_in_process(config: dotsync_core::AgentConfig) -> Result<Vec<SyncEvent>> {
    let agent = Agent::assemble(config).context("invalid agent configuration")?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    runtime.block_on(async move {
        let (consumer, mut rx) = ChannelConsumer::channel("cli", 1);
        let pipeline = agent.pipeline.clone();
        let run = tokio::spawn(async move { pipeline.run(SyncKind::Manual, vec![consumer]).await });

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            print_event(&event);
            events.push(event);
        }
        run.await.context("sync task panicked")??;
        agent.pipeline.flush_notifications().await;
        Ok::<_, anyhow::Error>(events)
    })
}

fn finish(events: &[SyncEvent]) -> Result<()> {
    let Some(last) = events.last() else {
        bail!("the sync ended without reporting any progress");
    };
    if !last.success {
        bail!(
            "sync failed at '{}': {}",
            last.step,
            last.error.as_deref().unwrap_or("unknown error")
        );
    }
    println!("{}", "dotfiles are up to date".green());
    Ok(())
}

fn print_event(event: &SyncEvent) {
    if event.success {
        println!("{} [{:>3}%] {}", "✓".green().bold(), event.progress, event.step);
    } else {
        println!(
            "{} [{:>3}%] {}: {}",
            "✗".red().bold(),
            event.progress,
            event.step,
            event.error.as_deref().unwrap_or("unknown error")
        );
    }
}
