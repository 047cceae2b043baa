use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Live stream of run events, selected with `GET /sync?stream=sync-trigger`.
pub const SYNC_TRIGGER_STREAM: &str = "sync-trigger";
/// Live stream of status reports, selected with `GET /sync?stream=sync-status`.
pub const SYNC_STATUS_STREAM: &str = "sync-status";

/// Capacity of the daemon's live event broadcast.
pub const EVENT_LOG_CAPACITY: usize = 256;

/// Events queued between a manual run and its HTTP response stream. Each
/// delivery also waits for its frame to be taken before the run goes on.
pub const MANUAL_STREAM_CAPACITY: usize = 1;

pub fn listen_addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
}

/// How long open response streams may hold up shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
