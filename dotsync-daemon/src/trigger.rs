//! Trigger state: debounces push signals and publishes what the
//! subscription loop knows to the rest of the daemon.
//!
//! The subscription loop owns [`TriggerState`] exclusively. Everyone else
//! reads immutable [`TriggerSnapshot`]s from a `watch` channel.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use dotsync_core::PushMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TriggerPhase {
    /// Not connected to the relay.
    Idle,
    /// Listening on the relay.
    Subscribed,
    /// The last matching signal was dropped as too close to the previous one.
    Debounced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSnapshot {
    pub phase: TriggerPhase,
    /// Timestamp of the last signal that started a run.
    pub last_signal: Option<DateTime<Utc>>,
    /// When that signal was received, on the runtime clock.
    pub last_signal_received: Option<Instant>,
}

impl Default for TriggerSnapshot {
    fn default() -> Self {
        Self {
            phase: TriggerPhase::Idle,
            last_signal: None,
            last_signal_received: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    /// Push to some other branch.
    IgnoredBranch,
    /// Within the debounce window of the previous signal.
    Debounced,
    /// Start a run.
    Fire,
}

// ---------------------------------------------------------------------------
// Debouncer
// ---------------------------------------------------------------------------

/// Branch filter plus timestamp debounce.
#[derive(Debug, Clone)]
pub struct Debouncer {
    branch: String,
    window: Duration,
    last_signal: Option<DateTime<Utc>>,
}

impl Debouncer {
    pub fn new(branch: impl Into<String>, window: Duration) -> Self {
        Self {
            branch: branch.into(),
            window,
            last_signal: None,
        }
    }

    pub fn last_signal(&self) -> Option<DateTime<Utc>> {
        self.last_signal
    }

    /// Classify `msg`. The signal time is the head commit's timestamp, or
    /// `received_at` when the message has none.
    pub fn observe(&mut self, msg: &PushMessage, received_at: DateTime<Utc>) -> TriggerDecision {
        if !msg.targets(&self.branch) {
            return TriggerDecision::IgnoredBranch;
        }

        let signal = msg
            .head_commit
            .as_ref()
            .and_then(|c| c.timestamp())
            .unwrap_or(received_at);

        if let Some(last) = self.last_signal {
            let gap = if signal >= last { signal - last } else { last - signal };
            if gap.to_std().map(|gap| gap <= self.window).unwrap_or(true) {
                return TriggerDecision::Debounced;
            }
        }

        self.last_signal = Some(signal);
        TriggerDecision::Fire
    }
}

// ---------------------------------------------------------------------------
// TriggerState
// ---------------------------------------------------------------------------

/// Single-writer trigger state; every change is published as a snapshot.
pub struct TriggerState {
    debouncer: Debouncer,
    snapshot: TriggerSnapshot,
    tx: watch::Sender<TriggerSnapshot>,
}

impl TriggerState {
    pub fn new(branch: impl Into<String>, window: Duration) -> (Self, watch::Receiver<TriggerSnapshot>) {
        let (tx, rx) = watch::channel(TriggerSnapshot::default());
        let state = Self {
            debouncer: Debouncer::new(branch, window),
            snapshot: TriggerSnapshot::default(),
            tx,
        };
        (state, rx)
    }

    pub fn snapshot(&self) -> &TriggerSnapshot {
        &self.snapshot
    }

    pub fn set_phase(&mut self, phase: TriggerPhase) {
        if self.snapshot.phase != phase {
            tracing::debug!(?phase, "trigger phase changed");
            self.snapshot.phase = phase;
            self.publish();
        }
    }

    pub fn observe(
        &mut self,
        msg: &PushMessage,
        received_at: DateTime<Utc>,
        received: Instant,
    ) -> TriggerDecision {
        let decision = self.debouncer.observe(msg, received_at);
        match decision {
            TriggerDecision::IgnoredBranch => {
                tracing::debug!(git_ref = %msg.git_ref, "ignoring push to another branch");
            }
            TriggerDecision::Debounced => {
                tracing::debug!(git_ref = %msg.git_ref, "push debounced");
                self.snapshot.phase = TriggerPhase::Debounced;
                self.publish();
            }
            TriggerDecision::Fire => {
                self.snapshot = TriggerSnapshot {
                    phase: TriggerPhase::Subscribed,
                    last_signal: self.debouncer.last_signal(),
                    last_signal_received: Some(received),
                };
                self.publish();
            }
        }
        decision
    }

    fn publish(&self) {
        self.tx.send_replace(self.snapshot.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use dotsync_core::Commit;

    fn push(git_ref: &str, time: Option<&str>) -> PushMessage {
        PushMessage {
            git_ref: git_ref.to_string(),
            head_commit: time.map(|t| Commit::new("abc").with_time(t)),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn other_branches_are_ignored() {
        let mut debouncer = Debouncer::new("main", Duration::from_secs(10));
        assert_eq!(
            debouncer.observe(&push("refs/heads/dev", None), at(0)),
            TriggerDecision::IgnoredBranch
        );
        assert_eq!(debouncer.last_signal(), None);
    }

    #[test]
    fn two_signals_within_the_window_fire_once() {
        let mut debouncer = Debouncer::new("main", Duration::from_secs(10));
        let msg = push("refs/heads/main", None);
        assert_eq!(debouncer.observe(&msg, at(0)), TriggerDecision::Fire);
        assert_eq!(debouncer.observe(&msg, at(4)), TriggerDecision::Debounced);
        assert_eq!(debouncer.last_signal(), Some(at(0)));
    }

    #[test]
    fn signals_further_apart_than_the_window_fire_twice() {
        let mut debouncer = Debouncer::new("main", Duration::from_secs(10));
        let msg = push("refs/heads/main", None);
        assert_eq!(debouncer.observe(&msg, at(0)), TriggerDecision::Fire);
        assert_eq!(debouncer.observe(&msg, at(11)), TriggerDecision::Fire);
        assert_eq!(debouncer.last_signal(), Some(at(11)));
    }

    #[test]
    fn head_commit_time_wins_over_receipt_time() {
        let mut debouncer = Debouncer::new("main", Duration::from_secs(10));
        let first = push("refs/heads/main", Some("2024-05-01T10:00:00Z"));
        let second = push("refs/heads/main", Some("2024-05-01T10:00:05Z"));
        // Received far apart, committed close together.
        assert_eq!(debouncer.observe(&first, at(0)), TriggerDecision::Fire);
        assert_eq!(debouncer.observe(&second, at(600)), TriggerDecision::Debounced);
    }

    #[test]
    fn unparsable_commit_time_falls_back_to_receipt() {
        let mut debouncer = Debouncer::new("main", Duration::from_secs(10));
        let msg = push("refs/heads/main", Some("not a time"));
        assert_eq!(debouncer.observe(&msg, at(0)), TriggerDecision::Fire);
        assert_eq!(debouncer.observe(&msg, at(30)), TriggerDecision::Fire);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn state_publishes_snapshots() {
        let (mut state, rx) = TriggerState::new("main", Duration::from_secs(10));
        assert_eq!(rx.borrow().phase, TriggerPhase::Idle);

        state.set_phase(TriggerPhase::Subscribed);
        assert_eq!(rx.borrow().phase, TriggerPhase::Subscribed);

        let received = Instant::now();
        let msg = push("refs/heads/main", None);
        assert_eq!(state.observe(&msg, at(0), received), TriggerDecision::Fire);
        {
            let snap = rx.borrow();
            assert_eq!(snap.last_signal, Some(at(0)));
            assert_eq!(snap.last_signal_received, Some(received));
        }

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(
            state.observe(&msg, at(2), Instant::now()),
            TriggerDecision::Debounced
        );
        let snap = rx.borrow().clone();
        assert_eq!(snap.phase, TriggerPhase::Debounced);
        assert_eq!(snap.last_signal_received, Some(received));
    }
}
