#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use dotsync_core::Commit;
use dotsync_daemon::{EventLog, EventLogConsumer};
use dotsync_sync::{CommitSource, MemoryStatusStore, NullSink, Step, StepPlan, SyncError, SyncPipeline};

/// Heads that tests set by hand. `None` reads as a failed lookup.
pub struct Heads {
    local: Mutex<Option<Commit>>,
    remote: Mutex<Option<Commit>>,
}

impl Heads {
    pub fn new(local: Option<&str>, remote: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            local: Mutex::new(local.map(Commit::new)),
            remote: Mutex::new(remote.map(Commit::new)),
        })
    }

    pub fn set_local(&self, id: &str) {
        *self.local.lock().unwrap() = Some(Commit::new(id));
    }
}

#[async_trait]
impl CommitSource for Heads {
    async fn local_head(&self) -> Result<Commit, SyncError> {
        self.local
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| SyncError::MalformedLog("no checkout".into()))
    }

    async fn remote_head(&self) -> Result<Commit, SyncError> {
        self.remote
            .lock()
            .unwrap()
            .clone()
            .ok_or(SyncError::NoRemoteCommits)
    }
}

/// Instant steps; the one named `fail` returns an error. A successful run
/// moves the local head to the remote one.
pub struct QuickPlan {
    pub names: Vec<&'static str>,
    pub fail: Option<&'static str>,
    pub heads: Arc<Heads>,
}

impl StepPlan for QuickPlan {
    fn steps(&self) -> Vec<Step> {
        let last = self.names.len().saturating_sub(1);
        self.names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let fails = self.fail == Some(*name);
                let heads = Arc::clone(&self.heads);
                Step::new(*name, move || async move {
                    if fails {
                        return Err(SyncError::NothingToSync);
                    }
                    if i == last {
                        let remote = heads.remote.lock().unwrap().clone();
                        if let Some(remote) = remote {
                            heads.set_local(&remote.id.0);
                        }
                    }
                    Ok(())
                })
            })
            .collect()
    }
}

pub fn pipeline(
    heads: Arc<Heads>,
    names: Vec<&'static str>,
    fail: Option<&'static str>,
    events: &EventLog,
) -> Arc<SyncPipeline> {
    let plan = QuickPlan {
        names,
        fail,
        heads: Arc::clone(&heads),
    };
    let pipeline = SyncPipeline::new(
        Arc::new(plan),
        heads,
        Arc::new(NullSink),
        Arc::new(MemoryStatusStore::default()),
    )
    .with_default_consumer(Arc::new(EventLogConsumer::new(events.clone())));
    Arc::new(pipeline)
}

/// JSON payloads of every `data:` line in an SSE body.
pub fn sse_payloads(body: &str) -> Vec<serde_json::Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim_start()).expect("json frame"))
        .collect()
}
