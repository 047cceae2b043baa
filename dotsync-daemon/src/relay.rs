//! Push-relay subscription.
//!
//! The relay is a Server-Sent-Events endpoint carrying the git host's push
//! webhooks. Each subscription attempt lives at most `subscription_timeout`
//! and is then torn down and re-established; errors wait `retry_backoff`
//! first. None of this is ever fatal.

use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use dotsync_core::PushMessage;

use crate::error::DaemonError;
use crate::trigger::{TriggerDecision, TriggerPhase, TriggerState};

// ---------------------------------------------------------------------------
// SSE decoding
// ---------------------------------------------------------------------------

/// Upper bound on one buffered line, and on the data of one event. A push
/// envelope carries the whole webhook body on a single line.
pub const MAX_EVENT_BYTES: usize = 4 * 1024 * 1024;

/// Incremental `text/event-stream` decoder. Feed it raw chunks; it returns
/// the `data` payload of every event completed by that chunk.
#[derive(Debug)]
pub struct SseDecoder {
    pending: Vec<u8>,
    data: Vec<String>,
    data_len: usize,
    limit: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_EVENT_BYTES)
    }
}

impl SseDecoder {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            data: Vec::new(),
            data_len: 0,
            limit,
        }
    }

    /// Decode `chunk`. Past the size limit the decoder is reset and an error
    /// returned; the caller should drop the connection.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, DaemonError> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                    self.data_len = 0;
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            if field == "data" {
                self.data_len += value.len();
                self.data.push(value.to_string());
            }
        }

        if self.pending.len() > self.limit || self.data_len > self.limit {
            self.reset();
            return Err(DaemonError::RelayEventTooLarge { limit: self.limit });
        }
        Ok(events)
    }

    fn reset(&mut self) {
        self.pending = Vec::new();
        self.data.clear();
        self.data_len = 0;
    }
}

/// Relay payloads are either the webhook body itself or an envelope that
/// carries it under `body` next to headers and query.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RelayPayload {
    Envelope { body: PushMessage },
    Bare(PushMessage),
}

/// Extract a push from one event's data, or `None` for keepalives and
/// anything else that is not a push.
pub fn decode_push(data: &str) -> Option<PushMessage> {
    match serde_json::from_str::<RelayPayload>(data) {
        Ok(RelayPayload::Envelope { body }) | Ok(RelayPayload::Bare(body)) => Some(body),
        Err(err) => {
            tracing::debug!(error = %err, "ignoring non-push relay message");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub url: String,
    pub subscription_timeout: Duration,
    pub retry_backoff: Duration,
}

/// Keep a relay subscription alive until shutdown. `on_fire` is called for
/// every push that survives branch filtering and debounce; it must not
/// block.
pub async fn relay_task<F>(
    client: reqwest::Client,
    settings: RelaySettings,
    mut state: TriggerState,
    on_fire: F,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError>
where
    F: Fn(&PushMessage) + Send + Sync,
{
    tracing::info!(url = %settings.url, "listening on push relay");

    loop {
        let attempt = tokio::time::timeout(
            settings.subscription_timeout,
            subscribe_once(&client, &settings.url, &mut state, &on_fire),
        );

        let failed = tokio::select! {
            _ = shutdown_rx.recv() => break,
            result = attempt => match result {
                Err(_) => {
                    tracing::debug!("renewing relay subscription");
                    false
                }
                Ok(Ok(())) => {
                    tracing::debug!("relay closed the stream, reconnecting");
                    false
                }
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "relay subscription failed");
                    true
                }
            },
        };
        state.set_phase(TriggerPhase::Idle);

        if failed {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(settings.retry_backoff) => {}
            }
        }
    }

    state.set_phase(TriggerPhase::Idle);
    Ok(())
}

/// One subscription attempt: connect, then handle events until the relay
/// closes the stream.
pub async fn subscribe_once<F>(
    client: &reqwest::Client,
    url: &str,
    state: &mut TriggerState,
    on_fire: &F,
) -> Result<(), DaemonError>
where
    F: Fn(&PushMessage) + Send + Sync,
{
    let response = client
        .get(url)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(DaemonError::RelayStatus(response.status().as_u16()));
    }
    state.set_phase(TriggerPhase::Subscribed);

    let mut decoder = SseDecoder::default();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        for data in decoder.push(&chunk)? {
            let Some(msg) = decode_push(&data) else {
                continue;
            };
            if state.observe(&msg, Utc::now(), Instant::now()) == TriggerDecision::Fire {
                tracing::info!(git_ref = %msg.git_ref, "push received, starting automatic sync");
                on_fire(&msg);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_events_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\":").unwrap().is_empty());
        assert!(decoder.push(b"1}\n").unwrap().is_empty());
        assert_eq!(decoder.push(b"\n").unwrap(), vec![r#"{"a":1}"#.to_string()]);
    }

    #[test]
    fn handles_crlf_comments_and_multiline_data() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(
            b": keepalive\r\nevent: push\r\ndata: line one\r\ndata:line two\r\nid: 7\r\n\r\ndata: {}\n\n",
        )
        .unwrap();
        assert_eq!(events, vec!["line one\nline two".to_string(), "{}".to_string()]);
    }

    #[test]
    fn blank_lines_without_data_emit_nothing() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"\n\n: ping\n\n").unwrap().is_empty());
    }

    #[test]
    fn unterminated_line_past_the_limit_resets_the_decoder() {
        let mut decoder = SseDecoder::with_limit(16);
        assert!(decoder.push(b"data: 0123456789").unwrap().is_empty());
        let err = decoder.push(b"abcdef").unwrap_err();
        assert!(matches!(err, DaemonError::RelayEventTooLarge { limit: 16 }));

        assert_eq!(decoder.push(b"data: ok\n\n").unwrap(), vec!["ok".to_string()]);
    }

    #[test]
    fn oversized_event_data_is_rejected() {
        let mut decoder = SseDecoder::with_limit(16);
        assert!(decoder.push(b"data: 0123456789\n").unwrap().is_empty());
        assert!(decoder.push(b"data: 0123456789\n").is_err());
        assert!(decoder.push(b"\n").unwrap().is_empty());
    }

    #[test]
    fn decodes_bare_push() {
        let msg = decode_push(r#"{"ref":"refs/heads/main","head_commit":{"id":"abc","timestamp":"2024-05-01T10:00:00Z"}}"#)
            .expect("push");
        assert_eq!(msg.branch(), "main");
        assert_eq!(msg.head_commit.unwrap().id.0, "abc");
    }

    #[test]
    fn decodes_relay_envelope() {
        let msg = decode_push(
            r#"{"x-github-event":"push","body":{"ref":"refs/heads/main","head_commit":null},"query":{},"timestamp":1}"#,
        )
        .expect("push");
        assert!(msg.targets("main"));
        assert!(msg.head_commit.is_none());
    }

    #[test]
    fn keepalives_and_garbage_are_not_pushes() {
        assert!(decode_push("{}").is_none());
        assert!(decode_push("ready").is_none());
        assert!(decode_push(r#"{"body":{}}"#).is_none());
    }
}
