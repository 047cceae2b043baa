//! `dotsync status`: local vs remote head and the last recorded sync.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Deserialize;
use tabled::{settings::Style, Table, Tabled};

use dotsync_core::{Commit, StatusReport};

use crate::config::ConfigArgs;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Arguments for `dotsync status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Agent to ask (defaults to the local agent on the configured port).
    #[arg(long)]
    pub agent: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Deserialize)]
struct StatusEnvelope {
    payload: StatusReport,
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "")]
    field: &'static str,
    #[tabled(rename = "")]
    value: String,
}

impl StatusArgs {
    pub fn run(self, args: &ConfigArgs) -> Result<()> {
        let config = args.load()?;
        let url = self.agent.unwrap_or_else(|| args.agent_url(&config));
        let report = fetch_status(&url)?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize status JSON")?
            );
            return Ok(());
        }
        print_table(&report);
        Ok(())
    }
}

fn fetch_status(url: &str) -> Result<StatusReport> {
    let envelope: StatusEnvelope = ureq::AgentBuilder::new()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .get(&format!("{}/sync", url.trim_end_matches('/')))
        .call()
        .with_context(|| format!("could not reach agent at {url}; is `dotsync serve` running?"))?
        .into_json()
        .context("agent returned an unexpected status payload")?;
    Ok(envelope.payload)
}

fn print_table(report: &StatusReport) {
    let rows = vec![
        StatusRow {
            field: "state",
            value: sync_indicator(report),
        },
        StatusRow {
            field: "local",
            value: describe_commit(report.local_commit.as_ref()),
        },
        StatusRow {
            field: "remote",
            value: describe_commit(report.remote_commit.as_ref()),
        },
        StatusRow {
            field: "last sync",
            value: describe_last_sync(report),
        },
    ];
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    if !report.is_synced {
        println!("Run 'dotsync sync' to update this machine.");
    }
}

fn sync_indicator(report: &StatusReport) -> String {
    match (report.is_synced, report.local_commit.is_some() && report.remote_commit.is_some()) {
        (true, _) => format!("{} IN SYNC", "■".green().bold()),
        (false, true) => format!("{} BEHIND", "■".yellow().bold()),
        (false, false) => format!("{} UNKNOWN", "■".bright_black().bold()),
    }
}

fn describe_commit(commit: Option<&Commit>) -> String {
    match commit {
        Some(commit) => {
            let short: String = commit.id.0.chars().take(10).collect();
            match &commit.time {
                Some(time) => format!("{short} ({time})"),
                None => short,
            }
        }
        None => "unknown".to_string(),
    }
}

fn describe_last_sync(report: &StatusReport) -> String {
    let Some(time) = report.last_sync_time else {
        return "never".to_string();
    };
    let kind = report
        .last_sync_type
        .map(|k| k.to_string())
        .unwrap_or_default();
    let result = match report.last_sync_success {
        Some(true) => "succeeded".green().to_string(),
        Some(false) => "failed".red().to_string(),
        None => String::new(),
    };
    format!("{kind} {result}, {}", format_age(time, Utc::now()))
}

fn format_age(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
