//! Step sequencer: runs an ordered list of named reconciliation actions and
//! turns each outcome into a [`SyncEvent`].
//!
//! Steps run strictly one after another. Each step contributes `100 / n`
//! percent; the final successful event is pinned to 100. The first failure
//! ends the run with a terminal `success = false` event and nothing after it
//! executes. The sequencer has no locking of its own; that is the pipeline's
//! job.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::future::{BoxFuture, FutureExt};

use dotsync_core::SyncEvent;

use crate::error::SyncError;

pub type StepFuture = BoxFuture<'static, Result<(), SyncError>>;

/// A named, single-use reconciliation action.
pub struct Step {
    name: String,
    action: Box<dyn FnOnce() -> StepFuture + Send>,
}

impl Step {
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Box::new(move || action().boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step").field("name", &self.name).finish()
    }
}

/// Summary of one sequencer pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub success: bool,
    /// Number of events emitted.
    pub events: usize,
    pub failed_step: Option<String>,
    pub error: Option<String>,
}

/// Execute `steps` in order, awaiting `emit` for every event before the next
/// step starts.
///
/// Returns [`SyncError::EmptyPipeline`] without emitting anything when
/// `steps` is empty. A failed step is not an `Err`: it is reported through
/// the terminal event and the returned [`RunOutcome`].
pub async fn run_steps<E, Fut>(steps: Vec<Step>, mut emit: E) -> Result<RunOutcome, SyncError>
where
    E: FnMut(SyncEvent) -> Fut,
    Fut: Future<Output = ()>,
{
    if steps.is_empty() {
        return Err(SyncError::EmptyPipeline);
    }

    let total = steps.len();
    let share = progress_share(total);
    let mut progress: u8 = 0;
    let mut events = 0usize;

    for (index, Step { name, action }) in steps.into_iter().enumerate() {
        tracing::debug!(step = %name, index, total, "running sync step");

        let result = AssertUnwindSafe(async move { action().await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(SyncError::Panicked(panic_message(panic.as_ref()))));

        if let Err(err) = result {
            let message = err.to_string();
            tracing::debug!(step = %name, error = %message, "sync step failed");
            emit(SyncEvent::failed(name.clone(), progress, message.clone())).await;
            return Ok(RunOutcome {
                success: false,
                events: events + 1,
                failed_step: Some(name),
                error: Some(message),
            });
        }

        let last = index + 1 == total;
        progress = if last {
            100
        } else {
            progress.saturating_add(share).min(100)
        };
        emit(SyncEvent::completed(name, progress, last)).await;
        events += 1;
    }

    Ok(RunOutcome {
        success: true,
        events,
        failed_step: None,
        error: None,
    })
}

fn progress_share(total: usize) -> u8 {
    u8::try_from(100 / total).unwrap_or(100)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
