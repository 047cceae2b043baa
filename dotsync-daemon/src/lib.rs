//! Agent runtime: HTTP surface + push relay subscription + divergence poll.

mod error;
pub mod events;
pub mod http;
pub mod paths;
pub mod poll;
pub mod relay;
mod runtime;
pub mod trigger;

pub use error::DaemonError;
pub use events::{EventLog, EventLogConsumer};
pub use http::{router, ApiResponse, AppState, HealthResponse};
pub use relay::{decode_push, relay_task, RelaySettings, SseDecoder};
pub use runtime::{init_tracing, run, start_blocking, unix_seconds_now, Agent};
pub use trigger::{Debouncer, TriggerDecision, TriggerPhase, TriggerSnapshot, TriggerState};
