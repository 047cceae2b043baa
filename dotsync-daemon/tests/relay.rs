//! Relay subscription against a local SSE server.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::{TimeZone, Utc};
use futures_util::stream;
use tokio::sync::broadcast;

use dotsync_daemon::relay::{subscribe_once, MAX_EVENT_BYTES};
use dotsync_daemon::{relay_task, DaemonError, RelaySettings, TriggerPhase, TriggerState};

const FRAMES: &str = concat!(
    ": connected\n\n",
    "data: {\"ref\":\"refs/heads/main\",\"head_commit\":{\"id\":\"a1\",\"timestamp\":\"2024-05-01T10:00:00Z\"}}\n\n",
    // four seconds later: debounced
    "data: {\"ref\":\"refs/heads/main\",\"head_commit\":{\"id\":\"a2\",\"timestamp\":\"2024-05-01T10:00:04Z\"}}\n\n",
    "data: {}\n\n",
    "data: {\"ref\":\"refs/heads/dev\",\"head_commit\":{\"id\":\"d1\",\"timestamp\":\"2024-05-01T10:05:00Z\"}}\n\n",
    "event: push\r\n",
    "data: {\"x-github-event\":\"push\",\"body\":{\"ref\":\"refs/heads/main\",\"head_commit\":{\"id\":\"a3\",\"timestamp\":\"2024-05-01T10:01:00Z\"}}}\r\n\r\n",
);

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}/events")
}

fn counting(connections: Arc<AtomicUsize>, router: Router<Arc<AtomicUsize>>) -> Router {
    router.with_state(connections)
}

#[tokio::test]
async fn pushes_are_filtered_and_debounced() {
    let url = serve(Router::new().route(
        "/events",
        get(|| async { ([(header::CONTENT_TYPE, "text/event-stream")], FRAMES) }),
    ))
    .await;

    let (mut state, rx) = TriggerState::new("main", Duration::from_secs(10));
    let fired = Arc::new(std::sync::Mutex::new(Vec::new()));
    let on_fire = {
        let fired = fired.clone();
        move |msg: &dotsync_core::PushMessage| {
            let id = msg.head_commit.as_ref().map(|c| c.id.0.clone()).unwrap_or_default();
            fired.lock().unwrap().push(id);
        }
    };

    subscribe_once(&reqwest::Client::new(), &url, &mut state, &on_fire)
        .await
        .unwrap();

    assert_eq!(*fired.lock().unwrap(), vec!["a1".to_string(), "a3".to_string()]);
    let snapshot = rx.borrow().clone();
    assert_eq!(
        snapshot.last_signal,
        Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 1, 0).unwrap())
    );
    assert!(snapshot.last_signal_received.is_some());
}

#[tokio::test]
async fn non_success_status_is_an_error() {
    let url = serve(Router::new().route(
        "/events",
        get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
    ))
    .await;

    let (mut state, rx) = TriggerState::new("main", Duration::from_secs(10));
    let err = subscribe_once(&reqwest::Client::new(), &url, &mut state, &|_: &dotsync_core::PushMessage| {})
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::RelayStatus(503)));
    assert_eq!(rx.borrow().phase, TriggerPhase::Idle);
}

#[tokio::test]
async fn endless_line_drops_the_subscription() {
    let url = serve(Router::new().route(
        "/events",
        get(|| async {
            let body = format!("data: {}", "x".repeat(MAX_EVENT_BYTES + 1));
            ([(header::CONTENT_TYPE, "text/event-stream")], body)
        }),
    ))
    .await;

    let (mut state, _rx) = TriggerState::new("main", Duration::from_secs(10));
    let err = subscribe_once(&reqwest::Client::new(), &url, &mut state, &|_: &dotsync_core::PushMessage| {})
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::RelayEventTooLarge { .. }));
}

async fn hang(State(connections): State<Arc<AtomicUsize>>) -> impl IntoResponse {
    connections.fetch_add(1, Ordering::SeqCst);
    Sse::new(stream::pending::<Result<Event, Infallible>>())
}

async fn refuse(State(connections): State<Arc<AtomicUsize>>) -> StatusCode {
    connections.fetch_add(1, Ordering::SeqCst);
    StatusCode::BAD_GATEWAY
}

async fn run_relay_for(url: String, settings_for: impl FnOnce(String) -> RelaySettings, wait: Duration) -> TriggerPhase {
    let (state, rx) = TriggerState::new("main", Duration::from_secs(10));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let task = tokio::spawn(relay_task(
        reqwest::Client::new(),
        settings_for(url),
        state,
        |_: &dotsync_core::PushMessage| {},
        shutdown_tx.subscribe(),
    ));

    tokio::time::sleep(wait).await;
    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("relay stops on shutdown")
        .unwrap()
        .unwrap();
    let phase = rx.borrow().phase;
    phase
}

#[tokio::test]
async fn subscriptions_are_renewed_after_the_timeout() {
    let connections = Arc::new(AtomicUsize::new(0));
    let url = serve(counting(
        connections.clone(),
        Router::new().route("/events", get(hang)),
    ))
    .await;

    let phase = run_relay_for(
        url,
        |url| RelaySettings {
            url,
            subscription_timeout: Duration::from_millis(150),
            retry_backoff: Duration::from_secs(60),
        },
        Duration::from_millis(700),
    )
    .await;

    assert!(connections.load(Ordering::SeqCst) >= 3);
    assert_eq!(phase, TriggerPhase::Idle);
}

#[tokio::test]
async fn failed_subscriptions_back_off_and_retry() {
    let connections = Arc::new(AtomicUsize::new(0));
    let url = serve(counting(
        connections.clone(),
        Router::new().route("/events", get(refuse)),
    ))
    .await;

    run_relay_for(
        url,
        |url| RelaySettings {
            url,
            subscription_timeout: Duration::from_secs(60),
            retry_backoff: Duration::from_millis(100),
        },
        Duration::from_millis(550),
    )
    .await;

    let seen = connections.load(Ordering::SeqCst);
    assert!((2..=7).contains(&seen), "unexpected connection count {seen}");
}
