//! Consumer fan-out: delivers every event of a run to a set of independent
//! observers.
//!
//! Two delivery modes exist:
//!
//! - [`Delivery::Gated`]: the producer awaits the consumer before the next
//!   step starts. Gated consumers of one event are awaited concurrently.
//! - [`Delivery::Detached`]: the consumer has an ordered queue drained by its
//!   own worker task. The producer never waits on it. A default detached
//!   consumer keeps one queue for the life of the [`Fanout`], so it sees runs
//!   one after another and status snapshots in the order they were taken.
//!
//! Consumer errors and panics are logged and swallowed here; they never reach
//! the pipeline.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::future::{join_all, FutureExt};
use tokio::sync::{mpsc, oneshot};

use dotsync_core::{SyncEvent, SyncSnapshot};

use crate::error::SyncError;
use crate::notify::NotificationSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Gated,
    Detached,
}

/// An observer of sync progress events.
#[async_trait]
pub trait Consumer: Send + Sync {
    fn name(&self) -> &str;

    fn delivery(&self) -> Delivery {
        Delivery::Gated
    }

    async fn consume(&self, event: &SyncEvent) -> Result<(), SyncError>;

    /// Heads taken before and after each run, and on every poll. Only
    /// default detached consumers are sent these.
    async fn consume_status(&self, _snapshot: &SyncSnapshot) -> Result<(), SyncError> {
        Ok(())
    }
}

enum Notice {
    Event(SyncEvent),
    Status(SyncSnapshot),
    Flush(oneshot::Sender<()>),
}

// ---------------------------------------------------------------------------
// Fanout
// ---------------------------------------------------------------------------

/// The default consumer set, fixed at construction.
#[derive(Clone, Default)]
pub struct Fanout {
    defaults: Vec<Arc<dyn Consumer>>,
    queues: Vec<Arc<LongLivedQueue>>,
}

impl Fanout {
    pub fn new(defaults: Vec<Arc<dyn Consumer>>) -> Self {
        let queues = defaults
            .iter()
            .filter(|c| c.delivery() == Delivery::Detached)
            .map(|c| Arc::new(LongLivedQueue::new(Arc::clone(c))))
            .collect();
        Self { defaults, queues }
    }

    pub fn defaults(&self) -> &[Arc<dyn Consumer>] {
        &self.defaults
    }

    /// Start a per-run broadcast over the defaults plus `extra`.
    ///
    /// Detached workers are spawned on first use, so this must be called
    /// inside a tokio runtime.
    pub fn open(&self, extra: Vec<Arc<dyn Consumer>>) -> Broadcast {
        let mut gated = Vec::new();
        let mut detached: Vec<DetachedQueue> =
            self.queues.iter().map(|queue| queue.sender()).collect();
        let defaults = self
            .defaults
            .iter()
            .filter(|c| c.delivery() == Delivery::Gated)
            .cloned();
        for consumer in defaults.chain(extra) {
            match consumer.delivery() {
                Delivery::Gated => gated.push(consumer),
                Delivery::Detached => detached.push(DetachedQueue::spawn(consumer)),
            }
        }
        Broadcast { gated, detached }
    }

    /// Queue `snapshot` behind everything already published to the default
    /// detached consumers.
    pub fn publish_status(&self, snapshot: &SyncSnapshot) {
        for queue in &self.queues {
            queue.sender().send(Notice::Status(snapshot.clone()));
        }
    }

    /// Resolves once the default detached consumers have handled everything
    /// queued so far.
    pub async fn flush(&self) {
        let queues: Vec<DetachedQueue> = self.queues.iter().map(|q| q.sender()).collect();
        flush_all(queues).await;
    }
}

/// Queue of a default detached consumer. The worker is started lazily so a
/// [`Fanout`] can be built outside a runtime; it exits once the fan-out is
/// dropped.
struct LongLivedQueue {
    name: String,
    tx: mpsc::UnboundedSender<Notice>,
    idle: Mutex<Option<(Arc<dyn Consumer>, mpsc::UnboundedReceiver<Notice>)>>,
}

impl LongLivedQueue {
    fn new(consumer: Arc<dyn Consumer>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: consumer.name().to_string(),
            tx,
            idle: Mutex::new(Some((consumer, rx))),
        }
    }

    fn sender(&self) -> DetachedQueue {
        let idle = match self.idle.lock() {
            Ok(mut idle) => idle.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some((consumer, rx)) = idle {
            tokio::spawn(drain(consumer, rx));
        }
        DetachedQueue {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

/// Sending half of a detached consumer's queue.
struct DetachedQueue {
    name: String,
    tx: mpsc::UnboundedSender<Notice>,
}

impl DetachedQueue {
    /// A queue and worker for one run only.
    fn spawn(consumer: Arc<dyn Consumer>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let name = consumer.name().to_string();
        tokio::spawn(drain(consumer, rx));
        Self { name, tx }
    }

    fn send(&self, notice: Notice) {
        if self.tx.send(notice).is_err() {
            tracing::warn!(consumer = %self.name, "detached consumer worker is gone");
        }
    }
}

async fn drain(consumer: Arc<dyn Consumer>, mut rx: mpsc::UnboundedReceiver<Notice>) {
    while let Some(notice) = rx.recv().await {
        match notice {
            Notice::Event(event) => deliver(consumer.as_ref(), &event).await,
            Notice::Status(snapshot) => {
                guarded(consumer.name(), "status", consumer.consume_status(&snapshot)).await
            }
            Notice::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn deliver(consumer: &dyn Consumer, event: &SyncEvent) {
    guarded(consumer.name(), &event.step, consumer.consume(event)).await
}

async fn guarded(
    consumer: &str,
    what: &str,
    delivery: impl Future<Output = Result<(), SyncError>>,
) {
    match AssertUnwindSafe(delivery).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(consumer, step = what, error = %err, "consumer failed");
        }
        Err(_) => {
            tracing::warn!(consumer, step = what, "consumer panicked");
        }
    }
}

async fn flush_all(queues: Vec<DetachedQueue>) {
    let mut pending = Vec::with_capacity(queues.len());
    for queue in &queues {
        let (done, flushed) = oneshot::channel();
        queue.send(Notice::Flush(done));
        pending.push((queue.name.clone(), flushed));
    }
    drop(queues);
    for (name, flushed) in pending {
        if flushed.await.is_err() {
            tracing::warn!(consumer = %name, "detached consumer worker stopped before flushing");
        }
    }
}

// ---------------------------------------------------------------------------
// Broadcast
// ---------------------------------------------------------------------------

/// Consumers of a single run.
pub struct Broadcast {
    gated: Vec<Arc<dyn Consumer>>,
    detached: Vec<DetachedQueue>,
}

impl Broadcast {
    /// Enqueue `event` for every detached consumer, then await every gated
    /// consumer.
    pub async fn publish(&self, event: &SyncEvent) {
        for queue in &self.detached {
            queue.send(Notice::Event(event.clone()));
        }
        join_all(self.gated.iter().map(|c| deliver(c.as_ref(), event))).await;
    }

    pub fn len(&self) -> usize {
        self.gated.len() + self.detached.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting events. The returned handle may be awaited until the
    /// detached consumers have handled this run, or dropped to let them
    /// finish alone. Per-run workers exit once drained.
    pub fn close(self) -> DetachedWorkers {
        DetachedWorkers {
            queues: self.detached,
        }
    }
}

#[must_use = "drop the handle to detach the workers"]
pub struct DetachedWorkers {
    queues: Vec<DetachedQueue>,
}

impl DetachedWorkers {
    pub async fn join(self) {
        flush_all(self.queues).await;
    }
}

// ---------------------------------------------------------------------------
// Built-in consumers
// ---------------------------------------------------------------------------

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogConsumer;

#[async_trait]
impl Consumer for LogConsumer {
    fn name(&self) -> &str {
        "log"
    }

    async fn consume(&self, event: &SyncEvent) -> Result<(), SyncError> {
        if event.success {
            tracing::info!(step = %event.step, progress = event.progress, done = event.done, "sync progress");
        } else {
            tracing::error!(
                step = %event.step,
                progress = event.progress,
                error = event.error.as_deref().unwrap_or_default(),
                "sync step failed"
            );
        }
        Ok(())
    }
}

/// Forwards events into a bounded channel. With capacity 1 the producer is
/// held until the reader has taken the previous event.
pub struct ChannelConsumer {
    name: String,
    tx: mpsc::Sender<SyncEvent>,
}

impl ChannelConsumer {
    pub fn new(name: impl Into<String>, tx: mpsc::Sender<SyncEvent>) -> Self {
        Self {
            name: name.into(),
            tx,
        }
    }

    pub fn channel(
        name: impl Into<String>,
        capacity: usize,
    ) -> (Arc<dyn Consumer>, mpsc::Receiver<SyncEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self::new(name, tx)), rx)
    }
}

#[async_trait]
impl Consumer for ChannelConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn consume(&self, event: &SyncEvent) -> Result<(), SyncError> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| SyncError::Delivery {
                consumer: self.name.clone(),
                reason: "receiver dropped".to_string(),
            })
    }
}

/// Relays events and status snapshots to the notification sink, in order,
/// without holding up the run.
pub struct SinkConsumer {
    sink: Arc<dyn NotificationSink>,
}

impl SinkConsumer {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Consumer for SinkConsumer {
    fn name(&self) -> &str {
        "notification-sink"
    }

    fn delivery(&self) -> Delivery {
        Delivery::Detached
    }

    async fn consume(&self, event: &SyncEvent) -> Result<(), SyncError> {
        self.sink.sync_event(event).await
    }

    async fn consume_status(&self, snapshot: &SyncSnapshot) -> Result<(), SyncError> {
        self.sink.sync_status(snapshot).await
    }
}
