//! Periodic divergence poll: refreshes the live status and, as a fallback
//! for missed pushes, starts an automatic run.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};

use dotsync_core::{SyncKind, SyncSnapshot};
use dotsync_sync::SyncPipeline;

use crate::error::DaemonError;
use crate::events::EventLog;
use crate::trigger::TriggerSnapshot;

/// Fallback policy: run only when the heads are known to differ, nothing is
/// running, and no push arrived within the last `poll_interval` (that push's
/// run will bring the checkout up to date).
pub fn should_trigger(
    snapshot: &SyncSnapshot,
    running: bool,
    trigger: &TriggerSnapshot,
    now: Instant,
    poll_interval: Duration,
) -> bool {
    if !snapshot.is_conclusive() || snapshot.is_synced || running {
        return false;
    }
    match trigger.last_signal_received {
        Some(received) => now.saturating_duration_since(received) >= poll_interval,
        None => true,
    }
}

/// One poll tick. Returns whether an automatic run was started.
pub async fn poll_once(
    pipeline: &Arc<SyncPipeline>,
    events: &EventLog,
    trigger_rx: &watch::Receiver<TriggerSnapshot>,
    poll_interval: Duration,
) -> bool {
    let report = pipeline.status_report().await;
    let snapshot = SyncSnapshot::new(report.local_commit.clone(), report.remote_commit.clone());
    events.publish_status(report);
    pipeline.publish_status(&snapshot);

    let trigger = trigger_rx.borrow().clone();
    if !should_trigger(
        &snapshot,
        pipeline.is_running(),
        &trigger,
        Instant::now(),
        poll_interval,
    ) {
        return false;
    }

    tracing::info!("checkout is behind the remote, starting automatic sync");
    let pipeline = Arc::clone(pipeline);
    tokio::spawn(async move {
        match pipeline.run_if_diverged(SyncKind::Automatic, Vec::new()).await {
            Ok(Some(outcome)) if !outcome.success => {
                tracing::warn!(step = outcome.failed_step.as_deref().unwrap_or_default(), "automatic sync failed");
            }
            Ok(_) => {}
            Err(err) => tracing::error!(error = %err, "automatic sync could not run"),
        }
    });
    true
}

pub async fn poll_task(
    pipeline: Arc<SyncPipeline>,
    events: EventLog,
    trigger_rx: watch::Receiver<TriggerSnapshot>,
    poll_interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                poll_once(&pipeline, &events, &trigger_rx, poll_interval).await;
            }
        }
    }
    Ok(())
}
