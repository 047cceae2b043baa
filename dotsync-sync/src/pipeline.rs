//! Single-flight sync pipeline shared by the daemon's triggers and the CLI.
//!
//! At most one run executes at a time. A caller that arrives while a run is
//! in flight waits for the run lock; requests are never dropped. The lock is
//! a scoped guard, so it is released on every exit path including panics.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use dotsync_core::{StatusReport, SyncKind, SyncSnapshot, SyncStatus};

use crate::error::SyncError;
use crate::fanout::{Consumer, Fanout, LogConsumer, SinkConsumer};
use crate::notify::NotificationSink;
use crate::oracle::{self, CommitSource};
use crate::status_store::StatusStore;
use crate::steps::{run_steps, RunOutcome};
use crate::strategy::StepPlan;

pub struct SyncPipeline {
    lock: Mutex<()>,
    plan: Arc<dyn StepPlan>,
    oracle: Arc<dyn CommitSource>,
    store: Arc<dyn StatusStore>,
    fanout: Fanout,
}

impl SyncPipeline {
    /// Build a pipeline whose default consumers are the log and the
    /// notification sink.
    pub fn new(
        plan: Arc<dyn StepPlan>,
        oracle: Arc<dyn CommitSource>,
        sink: Arc<dyn NotificationSink>,
        store: Arc<dyn StatusStore>,
    ) -> Self {
        let defaults: Vec<Arc<dyn Consumer>> = vec![
            Arc::new(LogConsumer),
            Arc::new(SinkConsumer::new(sink)),
        ];
        Self {
            lock: Mutex::new(()),
            plan,
            oracle,
            store,
            fanout: Fanout::new(defaults),
        }
    }

    /// Add a consumer that observes every run.
    pub fn with_default_consumer(mut self, consumer: Arc<dyn Consumer>) -> Self {
        let mut defaults = self.fanout.defaults().to_vec();
        defaults.push(consumer);
        self.fanout = Fanout::new(defaults);
        self
    }

    /// Queue `snapshot` for the notification sink and other default
    /// detached consumers, ordered after everything already sent to them.
    pub fn publish_status(&self, snapshot: &SyncSnapshot) {
        self.fanout.publish_status(snapshot);
    }

    /// Wait until default detached consumers have handled everything queued
    /// so far.
    pub async fn flush_notifications(&self) {
        self.fanout.flush().await;
    }

    /// True while a run holds the lock.
    pub fn is_running(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Current local vs remote heads. Does not take the run lock.
    pub async fn snapshot(&self) -> SyncSnapshot {
        oracle::snapshot(self.oracle.as_ref()).await
    }

    /// Snapshot plus the last recorded run.
    pub async fn status_report(&self) -> StatusReport {
        let snapshot = self.snapshot().await;
        let last = self
            .store
            .load()
            .map_err(|err| tracing::warn!(error = %err, "could not read sync status"))
            .ok()
            .flatten();
        StatusReport::new(snapshot, last.as_ref())
    }

    /// Run the full step list, waiting for any in-flight run first.
    ///
    /// `consumers` observe this run only, in addition to the defaults.
    pub async fn run(
        &self,
        kind: SyncKind,
        consumers: Vec<Arc<dyn Consumer>>,
    ) -> Result<RunOutcome, SyncError> {
        let _guard = self.lock.lock().await;
        self.run_locked(kind, consumers, None).await
    }

    /// Like [`run`](Self::run), but once the lock is held the heads are
    /// compared again and the run is skipped when they are known to match.
    ///
    /// Returns `Ok(None)` for a skipped run.
    pub async fn run_if_diverged(
        &self,
        kind: SyncKind,
        consumers: Vec<Arc<dyn Consumer>>,
    ) -> Result<Option<RunOutcome>, SyncError> {
        let _guard = self.lock.lock().await;
        let before = self.snapshot().await;
        if before.is_conclusive() && before.is_synced {
            tracing::debug!(%kind, "already in sync, skipping run");
            return Ok(None);
        }
        self.run_locked(kind, consumers, Some(before)).await.map(Some)
    }

    async fn run_locked(
        &self,
        kind: SyncKind,
        consumers: Vec<Arc<dyn Consumer>>,
        before: Option<SyncSnapshot>,
    ) -> Result<RunOutcome, SyncError> {
        tracing::info!(%kind, "sync run started");

        let before = match before {
            Some(snapshot) => snapshot,
            None => self.snapshot().await,
        };
        self.fanout.publish_status(&before);

        let broadcast = self.fanout.open(consumers);
        let steps = self.plan.steps();
        let publish_to = &broadcast;
        let result = run_steps(steps, move |event| async move {
            publish_to.publish(&event).await;
        })
        .await;
        drop(broadcast.close());
        let outcome = result?;

        let after = self.snapshot().await;
        self.record(kind, &outcome, &after);
        self.fanout.publish_status(&after);

        if outcome.success {
            tracing::info!(%kind, events = outcome.events, "sync run finished");
        } else {
            tracing::warn!(
                %kind,
                step = outcome.failed_step.as_deref().unwrap_or_default(),
                error = outcome.error.as_deref().unwrap_or_default(),
                "sync run failed"
            );
        }
        Ok(outcome)
    }

    fn record(&self, kind: SyncKind, outcome: &RunOutcome, after: &SyncSnapshot) {
        let status = SyncStatus {
            kind,
            time: Utc::now(),
            success: outcome.success,
            commit: after.local_commit.clone(),
        };
        if let Err(err) = self.store.save(&status) {
            tracing::warn!(error = %err, "could not record sync status");
        }
    }
}
