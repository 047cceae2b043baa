//! # dotsync-sync
//!
//! The sync engine: divergence detection, the step sequencer, the
//! single-flight [`SyncPipeline`] and the consumer fan-out that streams each
//! run's progress.
//!
//! Build a pipeline from a [`SyncStrategy`], a [`CommitSource`], a
//! [`NotificationSink`] and a [`StatusStore`], then call
//! [`SyncPipeline::run`] or [`SyncPipeline::run_if_diverged`].

pub mod error;
pub mod fanout;
pub mod git;
pub mod materialize;
pub mod notify;
pub mod oracle;
pub mod pipeline;
pub mod status_store;
pub mod steps;
pub mod strategy;

pub use error::SyncError;
pub use fanout::{Broadcast, ChannelConsumer, Consumer, Delivery, Fanout, LogConsumer, SinkConsumer};
pub use materialize::WriteResult;
pub use notify::{BrokerNotifier, NotificationSink, NullSink};
pub use oracle::{diverged, CommitSource, GitOracle};
pub use pipeline::SyncPipeline;
pub use status_store::{JsonStatusStore, MemoryStatusStore, StatusStore};
pub use steps::{run_steps, RunOutcome, Step};
pub use strategy::{StepPlan, SyncStrategy};
