//! The daemon's live event log: what `GET /sync?stream=..` clients see.
//!
//! Run events go through a `broadcast` channel, so a subscriber only sees
//! runs that start after it connected. Status reports go through a `watch`
//! channel holding the latest one.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, Stream};
use tokio::sync::{broadcast, watch};

use dotsync_core::{StatusReport, SyncEvent};
use dotsync_sync::{Consumer, Delivery, SyncError};

#[derive(Clone)]
pub struct EventLog {
    events: broadcast::Sender<SyncEvent>,
    status: Arc<watch::Sender<Option<StatusReport>>>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (status, _) = watch::channel(None);
        Self {
            events,
            status: Arc::new(status),
        }
    }

    /// Publish a run event. Having no live subscribers is fine.
    pub fn publish_event(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    pub fn publish_status(&self, report: StatusReport) {
        self.status.send_replace(Some(report));
    }

    pub fn latest_status(&self) -> Option<StatusReport> {
        self.status.borrow().clone()
    }

    pub fn subscribe_events(&self) -> impl Stream<Item = SyncEvent> + Send + 'static {
        event_stream(self.events.subscribe())
    }

    /// The latest report, if any, then every later one.
    pub fn subscribe_status(&self) -> impl Stream<Item = StatusReport> + Send + 'static {
        status_stream(self.status.subscribe())
    }
}

fn event_stream(rx: broadcast::Receiver<SyncEvent>) -> impl Stream<Item = SyncEvent> + Send + 'static {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "live event subscriber lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

fn status_stream(
    mut rx: watch::Receiver<Option<StatusReport>>,
) -> impl Stream<Item = StatusReport> + Send + 'static {
    rx.mark_changed();
    stream::unfold(rx, |mut rx| async move {
        loop {
            rx.changed().await.ok()?;
            let latest = rx.borrow_and_update().clone();
            if let Some(report) = latest {
                return Some((report, rx));
            }
        }
    })
}

/// Feeds every run's events into the [`EventLog`].
pub struct EventLogConsumer {
    log: EventLog,
}

impl EventLogConsumer {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl Consumer for EventLogConsumer {
    fn name(&self) -> &str {
        "event-log"
    }

    fn delivery(&self) -> Delivery {
        Delivery::Detached
    }

    async fn consume(&self, event: &SyncEvent) -> Result<(), SyncError> {
        self.log.publish_event(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotsync_core::{Commit, SyncSnapshot};
    use futures_util::StreamExt;
    use std::time::Duration;

    fn report(local: &str) -> StatusReport {
        StatusReport::new(
            SyncSnapshot::new(Some(Commit::new(local)), Some(Commit::new("r"))),
            None,
        )
    }

    #[tokio::test]
    async fn event_subscribers_only_see_later_events() {
        let log = EventLog::new(8);
        log.publish_event(SyncEvent::completed("before", 50, false));

        let mut events = Box::pin(log.subscribe_events());
        log.publish_event(SyncEvent::completed("after", 100, true));

        let first = events.next().await.expect("event");
        assert_eq!(first.step, "after");
    }

    #[tokio::test]
    async fn status_subscribers_get_latest_first() {
        let log = EventLog::new(8);
        log.publish_status(report("a"));
        log.publish_status(report("b"));

        let mut statuses = Box::pin(log.subscribe_status());
        let first = statuses.next().await.expect("status");
        assert_eq!(first.local_commit.unwrap().id.0, "b");

        log.publish_status(report("c"));
        let next = statuses.next().await.expect("status");
        assert_eq!(next.local_commit.unwrap().id.0, "c");
        assert_eq!(log.latest_status().unwrap().local_commit.unwrap().id.0, "c");
    }

    #[tokio::test]
    async fn status_stream_waits_for_the_first_report() {
        let log = EventLog::new(8);
        let mut statuses = Box::pin(log.subscribe_status());
        let pending = tokio::time::timeout(Duration::from_millis(50), statuses.next()).await;
        assert!(pending.is_err());

        log.publish_status(report("a"));
        assert!(statuses.next().await.is_some());
    }

    #[tokio::test]
    async fn consumer_forwards_events() {
        let log = EventLog::new(8);
        let mut events = Box::pin(log.subscribe_events());
        let consumer = EventLogConsumer::new(log.clone());
        assert_eq!(consumer.delivery(), Delivery::Detached);

        consumer
            .consume(&SyncEvent::completed("step", 100, true))
            .await
            .unwrap();
        assert!(events.next().await.unwrap().done);
    }
}
