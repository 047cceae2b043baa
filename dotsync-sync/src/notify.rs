//! Notification sink: forwards progress events and status snapshots to the
//! remote coordination broker.
//!
//! Delivery is best effort. The pipeline reaches the sink through a detached
//! consumer queue that logs a returned error and moves on; a broker outage
//! never fails or delays a sync.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use dotsync_core::{BrokerConfig, Commit, SyncEvent, SyncSnapshot};

use crate::error::SyncError;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn sync_event(&self, event: &SyncEvent) -> Result<(), SyncError>;
    async fn sync_status(&self, snapshot: &SyncSnapshot) -> Result<(), SyncError>;
    /// Announce this machine on startup.
    async fn register(&self, local: Option<&Commit>) -> Result<(), SyncError>;
}

// ---------------------------------------------------------------------------
// NullSink
// ---------------------------------------------------------------------------

/// Used when no broker is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl NotificationSink for NullSink {
    async fn sync_event(&self, _event: &SyncEvent) -> Result<(), SyncError> {
        Ok(())
    }

    async fn sync_status(&self, _snapshot: &SyncSnapshot) -> Result<(), SyncError> {
        Ok(())
    }

    async fn register(&self, _local: Option<&Commit>) -> Result<(), SyncError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BrokerNotifier
// ---------------------------------------------------------------------------

/// Status body understood by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerStatus {
    pub local_commit: String,
    pub remote_commit: String,
    pub is_sync: bool,
}

impl From<&SyncSnapshot> for BrokerStatus {
    fn from(snapshot: &SyncSnapshot) -> Self {
        let id = |c: &Option<Commit>| c.as_ref().map(|c| c.id.0.clone()).unwrap_or_default();
        Self {
            local_commit: id(&snapshot.local_commit),
            remote_commit: id(&snapshot.remote_commit),
            is_sync: snapshot.is_synced,
        }
    }
}

#[derive(Debug, Serialize)]
struct MachineRegistration<'a> {
    #[serde(rename = "_id")]
    id: &'a str,
    sync_details: BrokerStatus,
}

pub struct BrokerNotifier {
    client: reqwest::Client,
    base_url: String,
    machine_id: String,
    timeout: Duration,
}

impl BrokerNotifier {
    pub fn new(client: reqwest::Client, broker: &BrokerConfig, timeout: Duration) -> Self {
        Self {
            client,
            base_url: broker.url.trim_end_matches('/').to_string(),
            machine_id: broker.machine_id.clone(),
            timeout,
        }
    }

    fn machine_url(&self, leaf: &str) -> String {
        format!("{}/machines/{}/{}", self.base_url, self.machine_id, leaf)
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        url: String,
        body: &T,
        what: &'static str,
    ) -> Result<reqwest::StatusCode, SyncError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .timeout(self.timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::RemoteStatus {
                what,
                status: status.as_u16(),
            });
        }
        Ok(status)
    }
}

#[async_trait]
impl NotificationSink for BrokerNotifier {
    async fn sync_event(&self, event: &SyncEvent) -> Result<(), SyncError> {
        self.post(self.machine_url("sync-event"), event, "broker sync-event")
            .await
            .map(|_| ())
    }

    async fn sync_status(&self, snapshot: &SyncSnapshot) -> Result<(), SyncError> {
        let body = BrokerStatus::from(snapshot);
        self.post(self.machine_url("sync-status"), &body, "broker sync-status")
            .await
            .map(|_| ())
    }

    async fn register(&self, local: Option<&Commit>) -> Result<(), SyncError> {
        let body = MachineRegistration {
            id: &self.machine_id,
            sync_details: BrokerStatus {
                local_commit: local.map(|c| c.id.0.clone()).unwrap_or_default(),
                remote_commit: String::new(),
                is_sync: false,
            },
        };
        let url = format!("{}/machines", self.base_url);
        let status = self.post(url, &body, "broker registration").await?;
        if status != reqwest::StatusCode::NO_CONTENT {
            return Err(SyncError::RemoteStatus {
                what: "broker registration",
                status: status.as_u16(),
            });
        }
        tracing::info!(machine = %self.machine_id, "registered with broker");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::sync::Mutex;

    /// Records everything it is sent.
    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<SyncEvent>>,
        pub statuses: Mutex<Vec<SyncSnapshot>>,
        /// Applied before recording each status, like a slow broker.
        pub status_delay: Option<Duration>,
    }

    impl RecordingSink {
        pub fn with_status_delay(delay: Duration) -> Self {
            Self {
                status_delay: Some(delay),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn sync_event(&self, event: &SyncEvent) -> Result<(), SyncError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }

        async fn sync_status(&self, snapshot: &SyncSnapshot) -> Result<(), SyncError> {
            if let Some(delay) = self.status_delay {
                tokio::time::sleep(delay).await;
            }
            self.statuses.lock().unwrap().push(snapshot.clone());
            Ok(())
        }

        async fn register(&self, _local: Option<&Commit>) -> Result<(), SyncError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_status_uses_empty_ids_for_unknown_commits() {
        let snapshot = SyncSnapshot::new(None, Some(Commit::new("b")));
        let body = serde_json::to_value(BrokerStatus::from(&snapshot)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"local_commit": "", "remote_commit": "b", "is_sync": false})
        );
    }

    #[test]
    fn registration_body_matches_broker_schema() {
        let body = MachineRegistration {
            id: "laptop",
            sync_details: BrokerStatus {
                local_commit: "a".into(),
                remote_commit: String::new(),
                is_sync: false,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["_id"], "laptop");
        assert_eq!(json["sync_details"]["local_commit"], "a");
    }

    #[test]
    fn machine_urls_ignore_trailing_slash() {
        let notifier = BrokerNotifier::new(
            reqwest::Client::new(),
            &BrokerConfig {
                url: "http://broker.local/".into(),
                machine_id: "laptop".into(),
            },
            Duration::from_secs(1),
        );
        assert_eq!(
            notifier.machine_url("sync-event"),
            "http://broker.local/machines/laptop/sync-event"
        );
    }

    #[tokio::test]
    async fn null_sink_accepts_everything() {
        let sink = NullSink;
        sink.sync_event(&SyncEvent::completed("x", 100, true))
            .await
            .unwrap();
        sink.sync_status(&SyncSnapshot::new(None, None)).await.unwrap();
        sink.register(None).await.unwrap();
    }
}
