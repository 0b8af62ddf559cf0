//! Upstream transports.
//!
//! A [`Transport`] moves [`WireRequest`]s to the upstream and pushes every
//! response it sees into an [`InboundSink`] as an [`InboundFrame`]. It never
//! resolves calls itself; routing is the correlator's job.
//!
//! Two implementations are selected by configuration:
//! - [`HttpTransport`]: one HTTP POST per request, response in the body.
//! - [`super::sse::SseTransport`]: a persistent event stream with POSTed
//!   requests and correlated responses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::errors::{BridgeError, ConnectionKind};

use super::types::{InboundFrame, Outcome, WireRequest};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest upstream error body kept in messages.
const MAX_ERROR_BODY: usize = 2000;

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Where a transport delivers inbound frames.
pub type InboundSink = mpsc::UnboundedSender<InboundFrame>;

/// A connection-level channel to the upstream execution endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The configured endpoint, for logging and error messages.
    fn endpoint(&self) -> &str;

    /// Whether independent calls may be in flight at the same time.
    fn multiplexed(&self) -> bool;

    /// Whether the envelope must carry its correlation id.
    fn explicit_correlation(&self) -> bool;

    /// Establish the connection. Inbound frames flow into `inbound` until
    /// the connection ends, at which point the sink is dropped.
    async fn connect(&self, inbound: InboundSink) -> Result<(), BridgeError>;

    /// Send one envelope correlated under `id`.
    async fn send(&self, id: u64, request: &WireRequest) -> Result<(), BridgeError>;

    /// Give up on the exchange correlated under `id`. Called once the call
    /// has settled without a response; work still running for it may stop.
    fn abandon(&self, _id: u64) {}

    /// Tear the connection down. Safe to call when not connected.
    fn disconnect(&self);
}

// ─── HttpTransport ───────────────────────────────────────────────────────────

/// In-flight POSTs by correlation id.
type InFlightTable = HashMap<u64, AbortHandle>;
type InFlight = Arc<Mutex<InFlightTable>>;

/// One-shot transport: every envelope is an independent HTTP POST whose
/// response body is the result.
pub struct HttpTransport {
    http: HttpClient,
    endpoint: String,
    credential: String,
    inbound: Mutex<Option<InboundSink>>,
    in_flight: InFlight,
}

impl HttpTransport {
    pub fn new(endpoint: &str, credential: &str) -> Result<Self, BridgeError> {
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
            inbound: Mutex::new(None),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// POSTs started and not yet answered or aborted.
    pub fn in_flight(&self) -> usize {
        lock_in_flight(&self.in_flight).len()
    }

    fn sink(&self) -> Option<InboundSink> {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn multiplexed(&self) -> bool {
        true
    }

    fn explicit_correlation(&self) -> bool {
        false
    }

    async fn connect(&self, inbound: InboundSink) -> Result<(), BridgeError> {
        *self.inbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(inbound);
        Ok(())
    }

    async fn send(&self, id: u64, request: &WireRequest) -> Result<(), BridgeError> {
        let sink = self.sink().ok_or_else(|| {
            BridgeError::connection(ConnectionKind::Closed, "HTTP transport is not connected")
        })?;
        let body = serde_json::to_vec(request)?;

        let post = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.credential)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        let tool = request.tool_name().to_string();

        // The exchange runs detached so the correlator's timeout bounds the
        // wait. The table lock is held across the spawn so the task cannot
        // unregister itself before it is registered.
        let in_flight = Arc::clone(&self.in_flight);
        let mut table = lock_in_flight(&self.in_flight);
        let task = tokio::spawn(async move {
            let outcome = exchange(post).await;
            lock_in_flight(&in_flight).remove(&id);
            if let Outcome::Failure(reason) = &outcome {
                tracing::debug!(id, tool = %tool, reason = %reason, "upstream call failed");
            }
            let _ = sink.send(InboundFrame { id, outcome });
        });
        table.insert(id, task.abort_handle());

        Ok(())
    }

    fn abandon(&self, id: u64) {
        if let Some(task) = lock_in_flight(&self.in_flight).remove(&id) {
            task.abort();
            tracing::debug!(id, "aborted abandoned upstream request");
        }
    }

    fn disconnect(&self) {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let aborted: Vec<AbortHandle> = lock_in_flight(&self.in_flight)
            .drain()
            .map(|(_, task)| task)
            .collect();
        if !aborted.is_empty() {
            tracing::debug!(count = aborted.len(), "aborting in-flight upstream requests");
        }
        for task in aborted {
            task.abort();
        }
    }
}

fn lock_in_flight(in_flight: &Mutex<InFlightTable>) -> MutexGuard<'_, InFlightTable> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run one POST and classify the response.
async fn exchange(post: reqwest::RequestBuilder) -> Outcome {
    let response = match post.send().await {
        Ok(r) => r,
        Err(e) => return Outcome::Failure(format!("request failed: {e}")),
    };

    let status = response.status();
    let text = match response.text().await {
        Ok(t) => t,
        Err(e) => return Outcome::Failure(format!("failed to read response body: {e}")),
    };

    if !status.is_success() {
        return Outcome::Failure(format!(
            "HTTP {}: {}",
            status.as_u16(),
            truncate_body(&text)
        ));
    }

    match serde_json::from_str(&text) {
        Ok(value) => Outcome::from_result(value),
        Err(e) => Outcome::Malformed(format!("response is not JSON: {e}")),
    }
}

/// Truncate an upstream body on a char boundary for error messages.
pub(crate) fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= MAX_ERROR_BODY {
        return trimmed.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &trimmed[..end])
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::session::{SessionOptions, SessionState, UpstreamSession};
    use crate::upstream::stub::{HttpStub, StubReply, StubRequest};
    use crate::upstream::translator::translate;
    use crate::upstream::types::ToolCall;
    use serde_json::json;

    fn handshake_or(request: &StubRequest, reply: StubReply) -> StubReply {
        if request.envelope_type() == "initialize" {
            StubReply::json(200, json!({"capabilities": {"tools": {}}}))
        } else {
            reply
        }
    }

    fn session_against(stub: &HttpStub) -> (Arc<HttpTransport>, Arc<UpstreamSession>) {
        let transport = Arc::new(HttpTransport::new(&stub.url, "secret-token").unwrap());
        let session = Arc::new(UpstreamSession::new(
            transport.clone(),
            SessionOptions::default(),
        ));
        (transport, session)
    }

    fn search_request() -> WireRequest {
        translate(&ToolCall::new("search_engine", json!({"query": "rust"}))).unwrap()
    }

    async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
        for _ in 0..100 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[test]
    fn test_http_transport_flags() {
        let transport = HttpTransport::new("https://upstream.test/mcp", "token").unwrap();
        assert!(transport.multiplexed());
        assert!(!transport.explicit_correlation());
        assert_eq!(transport.endpoint(), "https://upstream.test/mcp");
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let transport = HttpTransport::new("https://upstream.test/mcp", "token").unwrap();
        let err = transport
            .send(1, &WireRequest::initialize())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Connection {
                kind: ConnectionKind::Closed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_disconnect_drops_sink() {
        let transport = HttpTransport::new("https://upstream.test/mcp", "token").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.connect(tx).await.unwrap();
        transport.disconnect();
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body("  short  "), "short");
        let long = "é".repeat(MAX_ERROR_BODY);
        let out = truncate_body(&long);
        assert!(out.ends_with("...(truncated)"));
        assert!(out.len() <= MAX_ERROR_BODY + "...(truncated)".len());
    }

    #[tokio::test]
    async fn test_http_round_trip_carries_credential_and_envelope() {
        let stub = HttpStub::start(|req| {
            assert_eq!(req.method, "POST");
            assert_eq!(req.header("authorization"), Some("Bearer secret-token"));
            let body = req.json();
            assert!(body.get("id").is_none());
            let reply = StubReply::json(200, json!({"organic": [], "echo": body["body"]["arguments"]}));
            handshake_or(req, reply)
        })
        .await;
        let (_, session) = session_against(&stub);

        let payload = session
            .call(search_request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(payload, json!({"organic": [], "echo": {"query": "rust"}}));
    }

    #[tokio::test]
    async fn test_http_non_success_is_upstream_error_with_truncated_body() {
        let stub = HttpStub::start(|req| handshake_or(req, StubReply::text(502, &"x".repeat(3000)))).await;
        let (_, session) = session_against(&stub);

        let err = session
            .call(search_request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        let (tool, message) = match err {
            BridgeError::Upstream { tool, message } => (tool, message),
            other => panic!("expected upstream error, got {other:?}"),
        };
        assert_eq!(tool, "search_engine");
        assert!(message.starts_with("HTTP 502: xxx"), "{message}");
        assert!(message.ends_with("...(truncated)"));
        assert!(message.len() < 2100);
    }

    #[tokio::test]
    async fn test_http_non_json_body_is_protocol_error() {
        let stub = HttpStub::start(|req| handshake_or(req, StubReply::text(200, "<html>maintenance</html>"))).await;
        let (_, session) = session_against(&stub);

        let err = session
            .call(search_request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.tag(), "protocol_error");
    }

    #[tokio::test]
    async fn test_http_is_error_payload_is_upstream_failure() {
        let stub = HttpStub::start(|req| {
            let reply = StubReply::json(
                200,
                json!({"isError": true, "content": [{"type": "text", "text": "quota exceeded"}]}),
            );
            handshake_or(req, reply)
        })
        .await;
        let (_, session) = session_against(&stub);

        let err = session
            .call(search_request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BridgeError::Upstream {
                tool: "search_engine".into(),
                message: "quota exceeded".into(),
            }
        );
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_timed_out_request_is_aborted() {
        let stub = HttpStub::start(|req| handshake_or(req, StubReply::Hang)).await;
        let (transport, session) = session_against(&stub);

        let call = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.call(search_request(), Duration::from_millis(300)).await })
        };
        wait_for("request to reach the upstream", || stub.hanging() == 1).await;

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.tag(), "timeout_error");
        assert_eq!(transport.in_flight(), 0);
        wait_for("upstream connection to close", || stub.hanging() == 0).await;
    }

    #[tokio::test]
    async fn test_close_aborts_in_flight_requests() {
        let stub = HttpStub::start(|req| handshake_or(req, StubReply::Hang)).await;
        let (transport, session) = session_against(&stub);

        let call = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.call(search_request(), Duration::from_secs(30)).await })
        };
        wait_for("request to reach the upstream", || stub.hanging() == 1).await;

        session.close().await;
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.tag(), "connection_error");
        assert_eq!(transport.in_flight(), 0);
        wait_for("upstream connection to close", || stub.hanging() == 0).await;
    }
}
