//! Scripted in-memory transport for tests.
//!
//! The handshake is answered automatically unless silenced. Tool calls are
//! answered by a responder closure, optionally after a delay, so tests can
//! force out-of-order completion, silence, and dropped connections.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::errors::{BridgeError, ConnectionKind};

use super::transport::{InboundSink, Transport};
use super::types::{InboundFrame, Outcome, WireBody, WireRequest};

/// How the fake answers one call.
pub enum Reply {
    Payload(Value),
    Failure(String),
    After(Duration, Box<Reply>),
    Silent,
}

impl Reply {
    pub fn after_ms(ms: u64, reply: Reply) -> Self {
        Reply::After(Duration::from_millis(ms), Box::new(reply))
    }
}

type Responder = Box<dyn Fn(&str, &Map<String, Value>) -> Reply + Send + Sync>;

pub struct FakeTransport {
    responder: Responder,
    multiplexed: bool,
    silent_handshake: bool,
    connect_delay: Option<Duration>,
    failing_connects: AtomicU32,
    pub connects: AtomicUsize,
    pub sends: AtomicUsize,
    pub sent: Mutex<Vec<WireRequest>>,
    inbound: Mutex<Option<InboundSink>>,
}

impl FakeTransport {
    pub fn new(
        responder: impl Fn(&str, &Map<String, Value>) -> Reply + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            multiplexed: true,
            silent_handshake: false,
            connect_delay: None,
            failing_connects: AtomicU32::new(0),
            connects: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            inbound: Mutex::new(None),
        }
    }

    /// Answers every call with the same payload.
    pub fn constant(payload: Value) -> Self {
        Self::new(move |_, _| Reply::Payload(payload.clone()))
    }

    pub fn serialized(mut self) -> Self {
        self.multiplexed = false;
        self
    }

    pub fn with_silent_handshake(mut self) -> Self {
        self.silent_handshake = true;
        self
    }

    /// Every connect takes `delay` before succeeding or failing.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn with_failing_connects(self, n: u32) -> Self {
        self.failing_connects.store(n, Ordering::SeqCst);
        self
    }

    /// Number of `callTool` envelopes sent (handshakes excluded).
    pub fn tool_calls(&self) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|r| matches!(r.body, WireBody::CallTool { .. }))
            .count()
    }

    /// Push an arbitrary frame as if the upstream had sent it.
    pub fn inject(&self, frame: InboundFrame) {
        if let Some(sink) = self.inbound.lock().unwrap().as_ref() {
            let _ = sink.send(frame);
        }
    }

    /// Simulate the upstream closing the connection.
    pub fn drop_connection(&self) {
        self.inbound.lock().unwrap().take();
    }

    fn schedule(sink: InboundSink, id: u64, reply: Reply) {
        match reply {
            Reply::Payload(v) => {
                let _ = sink.send(InboundFrame {
                    id,
                    outcome: Outcome::Payload(v),
                });
            }
            Reply::Failure(m) => {
                let _ = sink.send(InboundFrame {
                    id,
                    outcome: Outcome::Failure(m),
                });
            }
            Reply::After(delay, inner) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    Self::schedule(sink, id, *inner);
                });
            }
            Reply::Silent => {}
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn endpoint(&self) -> &str {
        "fake://upstream"
    }

    fn multiplexed(&self) -> bool {
        self.multiplexed
    }

    fn explicit_correlation(&self) -> bool {
        true
    }

    async fn connect(&self, inbound: InboundSink) -> Result<(), BridgeError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        let remaining = self.failing_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(BridgeError::connection(
                ConnectionKind::Unreachable,
                "connection refused",
            ));
        }
        *self.inbound.lock().unwrap() = Some(inbound);
        Ok(())
    }

    async fn send(&self, id: u64, request: &WireRequest) -> Result<(), BridgeError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(request.clone());

        let sink = self.inbound.lock().unwrap().clone().ok_or_else(|| {
            BridgeError::connection(ConnectionKind::Closed, "fake transport not connected")
        })?;

        let reply = match &request.body {
            WireBody::Initialize { .. } if self.silent_handshake => Reply::Silent,
            WireBody::Initialize { .. } => Reply::Payload(json!({"capabilities": {"tools": {}}})),
            WireBody::CallTool { name, arguments } => (self.responder)(name, arguments),
        };
        Self::schedule(sink, id, reply);
        Ok(())
    }

    fn disconnect(&self) {
        self.inbound.lock().unwrap().take();
    }
}
