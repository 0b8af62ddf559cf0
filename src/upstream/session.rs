//! Upstream session lifecycle.
//!
//! Owns one logical connection to the upstream endpoint:
//! - `open`: connect, spawn the inbound pump, run the `initialize` exchange
//! - `ensure_ready`: open on demand, with exactly one re-open on failure
//! - `call`: forward an envelope and wait for its correlated response
//! - `close`: cancel outstanding calls and drop the connection
//!
//! The session is shared (`Arc`) by every in-flight call. Calls are only sent
//! while the state is `Ready`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::errors::{BridgeError, ConnectionKind};

use super::correlator::Correlator;
use super::transport::Transport;
use super::types::{InboundFrame, RawPayload, WireRequest};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default bound on the connect + `initialize` handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Types ───────────────────────────────────────────────────────────────────

/// Lifecycle state of an [`UpstreamSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unopened,
    Handshaking,
    Ready,
    Closed,
    Failed,
}

/// Connection lifetime policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// One connection held for the session's lifetime.
    Persistent,
    /// A fresh connection opened and closed around every call.
    PerCall,
}

/// Session tuning.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub mode: SessionMode,
    pub handshake_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            mode: SessionMode::Persistent,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn closed_error() -> BridgeError {
    BridgeError::connection(ConnectionKind::Closed, "session has been closed")
}

/// Outcome of the most recent open attempt.
#[derive(Default)]
struct OpenRecord {
    /// Bumped by every attempt, successful or not.
    generation: u64,
    error: Option<BridgeError>,
}

// ─── UpstreamSession ─────────────────────────────────────────────────────────

/// One live logical connection to the upstream execution endpoint.
pub struct UpstreamSession {
    id: Uuid,
    transport: Arc<dyn Transport>,
    correlator: Arc<Correlator>,
    options: SessionOptions,
    state: Arc<Mutex<SessionState>>,
    /// Serializes open/close so concurrent callers never double-handshake.
    open_lock: tokio::sync::Mutex<()>,
    /// Held for a whole exchange when the transport cannot multiplex.
    send_gate: tokio::sync::Mutex<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
    last_open: Mutex<OpenRecord>,
}

impl UpstreamSession {
    pub fn new(transport: Arc<dyn Transport>, options: SessionOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            transport,
            correlator: Arc::new(Correlator::new()),
            options,
            state: Arc::new(Mutex::new(SessionState::Unopened)),
            open_lock: tokio::sync::Mutex::new(()),
            send_gate: tokio::sync::Mutex::new(()),
            pump: Mutex::new(None),
            last_open: Mutex::new(OpenRecord::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    pub fn mode(&self) -> SessionMode {
        self.options.mode
    }

    /// Calls currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.correlator.pending_count()
    }

    fn set_state(&self, next: SessionState) {
        *lock(&self.state) = next;
    }

    fn open_generation(&self) -> u64 {
        lock(&self.last_open).generation
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Open the session and run the handshake.
    ///
    /// Idempotent: a `Ready` session is returned unchanged. A `Closed`
    /// session is never re-opened.
    pub async fn open(&self) -> Result<(), BridgeError> {
        let seen = self.open_generation();
        self.open_after(seen).await.map_err(|(e, _)| e)
    }

    /// Open, unless an attempt newer than generation `seen` already failed
    /// while this caller waited for the lock. That attempt's error is then
    /// shared instead of reconnecting, so queued callers never stampede a
    /// dead upstream.
    ///
    /// Errors carry the generation of the attempt that produced them.
    async fn open_after(&self, seen: u64) -> Result<(), (BridgeError, u64)> {
        let _guard = self.open_lock.lock().await;

        match self.state() {
            SessionState::Ready => return Ok(()),
            SessionState::Closed => return Err((closed_error(), self.open_generation())),
            _ => {}
        }
        if let Some(shared) = self.failure_since(seen) {
            return Err(shared);
        }

        self.set_state(SessionState::Handshaking);
        tracing::info!(
            session = %self.id,
            endpoint = %self.endpoint(),
            "opening upstream session"
        );

        let started = Instant::now();
        let timeout = self.options.handshake_timeout;
        let result = match tokio::time::timeout(timeout, self.handshake()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(handshake_error(e)),
            Err(_) => Err(BridgeError::connection(
                ConnectionKind::Timeout,
                format!(
                    "handshake with {} did not complete within {}ms",
                    self.endpoint(),
                    timeout.as_millis()
                ),
            )),
        };

        let generation = {
            let mut record = lock(&self.last_open);
            record.generation += 1;
            record.error = result.as_ref().err().cloned();
            record.generation
        };

        match result {
            Ok(()) => {
                self.set_state(SessionState::Ready);
                tracing::info!(
                    session = %self.id,
                    generation,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "upstream session ready"
                );
                Ok(())
            }
            Err(e) => {
                self.teardown(SessionState::Failed, "handshake failed");
                tracing::warn!(session = %self.id, generation, error = %e, "upstream session failed to open");
                Err((e, generation))
            }
        }
    }

    /// The failure of an open attempt made after generation `seen`, if any.
    fn failure_since(&self, seen: u64) -> Option<(BridgeError, u64)> {
        let record = lock(&self.last_open);
        if record.generation == seen {
            return None;
        }
        let error = record.error.clone()?;
        tracing::debug!(session = %self.id, generation = record.generation, "sharing concurrent open failure");
        Some((error, record.generation))
    }

    /// Make sure the session is `Ready`, opening it if needed.
    ///
    /// A failed open gets exactly one more attempt before the error is
    /// returned; a session already `Failed` gets exactly one re-open.
    /// Concurrent callers share attempts rather than each making their own.
    pub async fn ensure_ready(&self) -> Result<(), BridgeError> {
        let seen = self.open_generation();
        match self.state() {
            SessionState::Ready => Ok(()),
            SessionState::Closed => Err(closed_error()),
            SessionState::Failed => {
                tracing::info!(session = %self.id, "re-opening failed upstream session");
                self.open_after(seen).await.map_err(|(e, _)| e)
            }
            SessionState::Unopened | SessionState::Handshaking => match self.open_after(seen).await {
                Ok(()) => Ok(()),
                Err((e, failed_at)) if e.is_reopenable() => {
                    tracing::warn!(session = %self.id, error = %e, "open failed, retrying once");
                    self.open_after(failed_at).await.map_err(|(e, _)| e)
                }
                Err((e, _)) => Err(e),
            },
        }
    }

    /// Close the session. Outstanding calls are cancelled immediately.
    pub async fn close(&self) {
        let _guard = self.open_lock.lock().await;
        if self.state() == SessionState::Closed {
            return;
        }
        self.teardown(SessionState::Closed, "session closed");
        tracing::info!(session = %self.id, "upstream session closed");
    }

    async fn handshake(&self) -> Result<(), BridgeError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.transport.connect(tx).await?;
        self.spawn_pump(rx);

        let capabilities = self
            .exchange(WireRequest::initialize(), self.options.handshake_timeout)
            .await?;
        tracing::debug!(session = %self.id, capabilities = %capabilities, "handshake complete");
        Ok(())
    }

    /// Route inbound frames to the correlator until the connection ends.
    fn spawn_pump(&self, mut rx: mpsc::UnboundedReceiver<InboundFrame>) {
        let correlator = Arc::clone(&self.correlator);
        let state = Arc::clone(&self.state);
        let session = self.id;

        let handle = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = correlator.deliver(frame) {
                    tracing::error!(session = %session, error = %e, "rejected inbound frame");
                }
            }

            let dropped = {
                let mut state = lock(&state);
                if *state == SessionState::Ready {
                    *state = SessionState::Failed;
                    true
                } else {
                    false
                }
            };
            if dropped {
                let cancelled = correlator.cancel_all("upstream connection closed");
                tracing::warn!(session = %session, cancelled, "upstream connection dropped");
            }
        });

        if let Some(old) = lock(&self.pump).replace(handle) {
            old.abort();
        }
    }

    fn teardown(&self, next: SessionState, reason: &str) {
        self.set_state(next);
        self.release_connection(reason);
    }

    fn release_connection(&self, reason: &str) {
        self.correlator.cancel_all(reason);
        self.transport.disconnect();
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }

    /// Return a per-call session to `Unopened`, unless it was closed.
    fn finish_per_call(&self) {
        let reset = {
            let mut state = lock(&self.state);
            if *state == SessionState::Closed {
                false
            } else {
                *state = SessionState::Unopened;
                true
            }
        };
        if reset {
            self.release_connection("per-call connection finished");
        }
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    /// Forward one envelope and wait up to `timeout` for its response.
    ///
    /// Never retries once the envelope has been sent.
    pub async fn call(
        &self,
        request: WireRequest,
        timeout: Duration,
    ) -> Result<RawPayload, BridgeError> {
        match self.options.mode {
            SessionMode::Persistent => {
                self.ensure_ready().await?;
                let _gate = if self.transport.multiplexed() {
                    None
                } else {
                    Some(self.send_gate.lock().await)
                };
                self.exchange_when_ready(request, timeout).await
            }
            SessionMode::PerCall => {
                let _gate = self.send_gate.lock().await;
                self.ensure_ready().await?;
                // Runs on completion and when the caller drops this future.
                let _finish = PerCallFinish { session: self };
                self.exchange_when_ready(request, timeout).await
            }
        }
    }

    async fn exchange_when_ready(
        &self,
        request: WireRequest,
        timeout: Duration,
    ) -> Result<RawPayload, BridgeError> {
        let state = self.state();
        if state != SessionState::Ready {
            return Err(BridgeError::connection(
                ConnectionKind::Closed,
                format!("session is {state:?}, not ready"),
            ));
        }
        self.exchange(request, timeout).await
    }

    async fn exchange(
        &self,
        request: WireRequest,
        timeout: Duration,
    ) -> Result<RawPayload, BridgeError> {
        let pending = self.correlator.submit(request.tool_name());
        let id = pending.id();
        let request = if self.transport.explicit_correlation() {
            request.with_id(id)
        } else {
            request
        };

        tracing::debug!(session = %self.id, id, tool = %request.tool_name(), "forwarding call");
        self.transport.send(id, &request).await?;
        // Anything still running upstream for `id` is abandoned once the wait
        // ends, whether it resolved, timed out or was dropped.
        let _abandon = Abandon {
            transport: self.transport.as_ref(),
            id,
        };
        self.correlator.wait(pending, timeout).await
    }
}

struct PerCallFinish<'a> {
    session: &'a UpstreamSession,
}

impl Drop for PerCallFinish<'_> {
    fn drop(&mut self) {
        self.session.finish_per_call();
    }
}

struct Abandon<'a> {
    transport: &'a dyn Transport,
    id: u64,
}

impl Drop for Abandon<'_> {
    fn drop(&mut self) {
        self.transport.abandon(self.id);
    }
}

/// Map handshake failures onto `Connection` errors.
fn handshake_error(e: BridgeError) -> BridgeError {
    match e {
        BridgeError::Connection { .. } => e,
        BridgeError::Timeout { timeout_ms, .. } => BridgeError::connection(
            ConnectionKind::Timeout,
            format!("initialize got no response within {timeout_ms}ms"),
        ),
        other => BridgeError::connection(ConnectionKind::Handshake, other.to_string()),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
