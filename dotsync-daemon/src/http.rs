//! The agent's HTTP surface.
//!
//! - `POST /sync` starts a manual run and streams its events as SSE
//! - `GET /sync` returns the current status report
//! - `GET /sync?stream=sync-trigger|sync-status` subscribes to a live stream
//! - `GET /health` reports liveness

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;

use dotsync_core::{StatusReport, SyncEvent, SyncKind};
use dotsync_sync::{Consumer, SyncError, SyncPipeline};

use crate::events::EventLog;
use crate::paths::{MANUAL_STREAM_CAPACITY, SYNC_STATUS_STREAM, SYNC_TRIGGER_STREAM};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
    pub events: EventLog,
    pub started_at_unix: u64,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>, events: EventLog, started_at_unix: u64) -> Self {
        Self {
            pipeline,
            events,
            started_at_unix,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<T>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub running: bool,
    pub started_at_unix: u64,
    pub sync_in_progress: bool,
}

#[derive(Debug, Deserialize)]
pub struct SyncQuery {
    pub stream: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sync", get(sync_status).post(start_sync))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        running: true,
        started_at_unix: state.started_at_unix,
        sync_in_progress: state.pipeline.is_running(),
    })
}

async fn start_sync(State(state): State<AppState>) -> Response {
    let (consumer, frames) = response_stream();
    let pipeline = Arc::clone(&state.pipeline);
    tokio::spawn(async move {
        if let Err(err) = pipeline.run(SyncKind::Manual, vec![consumer]).await {
            tracing::error!(error = %err, "manual sync could not run");
        }
    });
    Sse::new(frames).into_response()
}

async fn sync_status(State(state): State<AppState>, Query(query): Query<SyncQuery>) -> Response {
    match query.stream.as_deref() {
        None => {
            let report = state.pipeline.status_report().await;
            Json(ApiResponse {
                msg: "Successful".to_string(),
                payload: Some(report),
            })
            .into_response()
        }
        Some(SYNC_TRIGGER_STREAM) => {
            let frames = state.events.subscribe_events().map(|event| to_frame(&event));
            Sse::new(frames)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
        Some(SYNC_STATUS_STREAM) => {
            let frames = state.events.subscribe_status().map(|report| to_frame(&report));
            Sse::new(frames)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
        Some(other) => (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::<StatusReport> {
                msg: format!("unknown stream '{other}'"),
                payload: None,
            }),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Manual run stream
// ---------------------------------------------------------------------------

type Written = oneshot::Sender<()>;

/// Gated consumer for one manual run. Each delivery waits until the response
/// stream has handed the frame to the server and been polled again.
struct ResponseStreamConsumer {
    tx: mpsc::Sender<(SyncEvent, Written)>,
}

#[async_trait]
impl Consumer for ResponseStreamConsumer {
    fn name(&self) -> &str {
        "http-stream"
    }

    async fn consume(&self, event: &SyncEvent) -> Result<(), SyncError> {
        let closed = || SyncError::Delivery {
            consumer: "http-stream".to_string(),
            reason: "response stream closed".to_string(),
        };
        let (written, frame_sent) = oneshot::channel();
        self.tx
            .send((event.clone(), written))
            .await
            .map_err(|_| closed())?;
        frame_sent.await.map_err(|_| closed())
    }
}

struct FrameState {
    rx: mpsc::Receiver<(SyncEvent, Written)>,
    in_flight: Option<Written>,
    finished: bool,
}

/// Consumer plus the frames of its run, ending after the `done` event or
/// when the run stops producing.
fn response_stream() -> (
    Arc<dyn Consumer>,
    impl Stream<Item = Result<Event, axum::Error>> + Send + 'static,
) {
    let (tx, rx) = mpsc::channel(MANUAL_STREAM_CAPACITY);
    let state = FrameState {
        rx,
        in_flight: None,
        finished: false,
    };
    let frames = stream::unfold(state, |mut state| async move {
        // Polled again: the previous frame has been taken.
        if let Some(written) = state.in_flight.take() {
            let _ = written.send(());
        }
        if state.finished {
            return None;
        }
        let (event, written) = state.rx.recv().await?;
        state.finished = event.done;
        state.in_flight = Some(written);
        Some((to_frame(&event), state))
    });
    (Arc::new(ResponseStreamConsumer { tx }), frames)
}

fn to_frame<T: Serialize>(value: &T) -> Result<Event, axum::Error> {
    Event::default().json_data(value)
}
