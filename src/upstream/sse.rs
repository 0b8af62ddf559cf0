//! Persistent-stream transport over Server-Sent Events.
//!
//! Connection flow:
//! 1. `GET <endpoint>` with `Accept: text/event-stream`
//! 2. The first `endpoint` event names the URL requests are POSTed to
//!    (relative to the stream URL, or absolute)
//! 3. Envelopes carrying an `id` are POSTed to that URL
//! 4. Responses arrive on the stream as `message` events:
//!    `{"id": n, "result": ...}` or `{"id": n, "error": {"message": ...}}`

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client as HttpClient, Url};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::errors::{BridgeError, ConnectionKind};

use super::transport::{truncate_body, InboundSink, Transport, CONNECT_TIMEOUT};
use super::types::{InboundMessage, WireRequest};

// ─── SSE decoding ────────────────────────────────────────────────────────────

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field, if present.
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`.
    pub data: String,
}

/// Incremental SSE decoder.
///
/// Bytes are buffered until a blank line closes an event, so multi-byte
/// characters and events split across chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed a chunk and return every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = find_event_end(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let text = String::from_utf8_lossy(&raw[..end]);
            if let Some(event) = parse_event(&text) {
                events.push(event);
            }
        }
        events
    }
}

fn find_event_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Parse one event block. Comment-only blocks (keep-alives) yield `None`.
fn parse_event(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

// ─── SseTransport ────────────────────────────────────────────────────────────

/// Persistent transport: one long-lived event stream per session.
pub struct SseTransport {
    http: HttpClient,
    endpoint: String,
    credential: String,
    multiplex: bool,
    message_url: Mutex<Option<String>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    pub fn new(endpoint: &str, credential: &str, multiplex: bool) -> Result<Self, BridgeError> {
        // No total timeout: the stream stays open for the session's lifetime.
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| {
                BridgeError::connection(
                    ConnectionKind::Unreachable,
                    format!("failed to build HTTP client for {endpoint}: {e}"),
                )
            })?;

        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            credential: credential.to_string(),
            multiplex,
            message_url: Mutex::new(None),
            reader: Mutex::new(None),
        })
    }

    fn message_url(&self) -> Option<String> {
        self.message_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_reader(&self, handle: Option<JoinHandle<()>>) {
        let mut reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = std::mem::replace(&mut *reader, handle) {
            old.abort();
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn multiplexed(&self) -> bool {
        self.multiplex
    }

    fn explicit_correlation(&self) -> bool {
        true
    }

    async fn connect(&self, inbound: InboundSink) -> Result<(), BridgeError> {
        let base = Url::parse(&self.endpoint).map_err(|e| {
            BridgeError::connection(
                ConnectionKind::Unreachable,
                format!("invalid endpoint URL '{}': {e}", self.endpoint),
            )
        })?;

        let response = self
            .http
            .get(base.clone())
            .bearer_auth(&self.credential)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| {
                BridgeError::connection(
                    ConnectionKind::Unreachable,
                    format!("failed to connect to {}: {e}", self.endpoint),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::connection(
                ConnectionKind::Unreachable,
                format!("HTTP {}: {}", status.as_u16(), truncate_body(&body)),
            ));
        }

        let (url_tx, url_rx) = oneshot::channel();
        let handle = tokio::spawn(read_events(response, base, url_tx, inbound));
        self.replace_reader(Some(handle));

        let url = url_rx.await.map_err(|_| {
            BridgeError::connection(
                ConnectionKind::Handshake,
                "event stream ended before announcing the message endpoint",
            )
        })?;
        tracing::debug!(endpoint = %self.endpoint, message_url = %url, "event stream connected");

        *self
            .message_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(url);
        Ok(())
    }

    async fn send(&self, id: u64, request: &WireRequest) -> Result<(), BridgeError> {
        let url = self.message_url().ok_or_else(|| {
            BridgeError::connection(ConnectionKind::Closed, "event stream is not connected")
        })?;

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.credential)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                BridgeError::connection(
                    ConnectionKind::Unreachable,
                    format!("failed to post message {id} to {url}: {e}"),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Upstream {
                tool: request.tool_name().to_string(),
                message: format!("HTTP {}: {}", status.as_u16(), truncate_body(&body)),
            });
        }
        Ok(())
    }

    fn disconnect(&self) {
        self.replace_reader(None);
        self.message_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Pump the event stream into the inbound sink until it ends.
async fn read_events(
    response: reqwest::Response,
    base: Url,
    url_tx: oneshot::Sender<String>,
    inbound: InboundSink,
) {
    let mut url_tx = Some(url_tx);
    let mut decoder = SseDecoder::default();
    let mut bytes = response.bytes_stream();

    while let Some(chunk) = bytes.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "upstream event stream read error");
                break;
            }
        };

        for event in decoder.push(&chunk) {
            match event.event.as_deref() {
                Some("endpoint") => match base.join(event.data.trim()) {
                    Ok(url) => {
                        if let Some(tx) = url_tx.take() {
                            let _ = tx.send(url.to_string());
                        }
                    }
                    Err(e) => tracing::error!(
                        data = %event.data,
                        error = %e,
                        "upstream announced an invalid message endpoint"
                    ),
                },
                Some("message") | None => {
                    match serde_json::from_str::<InboundMessage>(&event.data) {
                        Ok(msg) => {
                            if inbound.send(msg.into()).is_err() {
                                return;
                            }
                        }
                        Err(e) => tracing::error!(
                            data = %truncate_body(&event.data),
                            error = %e,
                            "unparseable upstream message"
                        ),
                    }
                }
                Some(other) => tracing::trace!(event = other, "ignoring upstream event"),
            }
        }
    }

    tracing::debug!("upstream event stream ended");
}

// ─── Tests ───────────────────────────────────────────────────────────────────
