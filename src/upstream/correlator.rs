//! Call correlation: outbound requests ↔ inbound responses.
//!
//! Each submitted call gets a correlation id from a monotonic counter and a
//! one-shot result slot. Inbound frames are routed by id. A single mutex
//! guards insert, remove and resolve, so an entry is resolved at most once.
//!
//! Ids of settled calls are remembered (bounded) so that a late frame for a
//! cancelled or timed-out call is discarded quietly, while a second frame for
//! an already-delivered call is reported as a protocol error.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::errors::{BridgeError, ConnectionKind};

use super::types::{InboundFrame, Outcome, RawPayload};

// ─── Constants ───────────────────────────────────────────────────────────────

/// How many settled ids are remembered for late-frame classification.
const SETTLED_HISTORY: usize = 1024;

// ─── Table ───────────────────────────────────────────────────────────────────

type Resolution = Result<RawPayload, BridgeError>;

/// How a call left the pending table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Delivered,
    TimedOut,
    Cancelled,
}

/// What happened to an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the waiting caller.
    Routed,
    /// Dropped because its call had already timed out or been cancelled.
    Discarded(Settlement),
}

struct PendingEntry {
    tool: String,
    submitted_at: Instant,
    slot: oneshot::Sender<Resolution>,
}

#[derive(Default)]
struct Table {
    pending: HashMap<u64, PendingEntry>,
    settled: HashMap<u64, Settlement>,
    settled_order: VecDeque<u64>,
}

impl Table {
    fn settle(&mut self, id: u64, how: Settlement) {
        self.settled.insert(id, how);
        self.settled_order.push_back(id);
        while self.settled_order.len() > SETTLED_HISTORY {
            if let Some(old) = self.settled_order.pop_front() {
                self.settled.remove(&old);
            }
        }
    }
}

fn lock(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Correlator ──────────────────────────────────────────────────────────────

/// Routes inbound frames to the call that is waiting for them.
pub struct Correlator {
    next_id: AtomicU64,
    table: Arc<Mutex<Table>>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            table: Arc::new(Mutex::new(Table::default())),
        }
    }

    /// Register a new in-flight call for `tool`.
    pub fn submit(&self, tool: &str) -> PendingCall {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (slot, rx) = oneshot::channel();
        let submitted_at = Instant::now();

        lock(&self.table).pending.insert(
            id,
            PendingEntry {
                tool: tool.to_string(),
                submitted_at,
                slot,
            },
        );

        PendingCall {
            id,
            tool: tool.to_string(),
            submitted_at,
            rx,
            table: Arc::clone(&self.table),
            finished: false,
        }
    }

    /// Route an inbound frame to its waiter.
    ///
    /// Unknown ids and second responses for a delivered id are protocol
    /// errors. Frames for timed-out or cancelled calls are discarded.
    pub fn deliver(&self, frame: InboundFrame) -> Result<Delivery, BridgeError> {
        let mut table = lock(&self.table);

        if let Some(entry) = table.pending.remove(&frame.id) {
            let resolution = match frame.outcome {
                Outcome::Payload(payload) => Ok(payload),
                Outcome::Failure(message) => Err(BridgeError::Upstream {
                    tool: entry.tool.clone(),
                    message,
                }),
                Outcome::Malformed(reason) => Err(BridgeError::Protocol { reason }),
            };
            // Filled under the lock: a waiter whose timer fires now finds
            // either its entry still pending or the slot already full.
            let delivered = entry.slot.send(resolution).is_ok();
            table.settle(frame.id, Settlement::Delivered);
            drop(table);

            let elapsed_ms = entry.submitted_at.elapsed().as_millis() as u64;
            if delivered {
                tracing::debug!(id = frame.id, tool = %entry.tool, elapsed_ms, "response routed");
            } else {
                tracing::debug!(id = frame.id, tool = %entry.tool, "waiter gone before delivery");
            }
            return Ok(Delivery::Routed);
        }

        match table.settled.get(&frame.id).copied() {
            Some(Settlement::Delivered) => Err(BridgeError::Protocol {
                reason: format!("duplicate response for correlation id {}", frame.id),
            }),
            Some(how) => {
                tracing::debug!(id = frame.id, settlement = ?how, "discarding late response");
                Ok(Delivery::Discarded(how))
            }
            None => Err(BridgeError::Protocol {
                reason: format!("response for unknown correlation id {}", frame.id),
            }),
        }
    }

    /// Wait for a call to resolve, bounded by `timeout`.
    ///
    /// Exactly one of payload, upstream error, protocol error or timeout is
    /// returned. On timeout the call is settled and later frames are dropped.
    pub async fn wait(
        &self,
        mut pending: PendingCall,
        timeout: Duration,
    ) -> Result<RawPayload, BridgeError> {
        let timeout_ms = timeout.as_millis() as u64;

        match tokio::time::timeout(timeout, &mut pending.rx).await {
            Ok(Ok(resolution)) => {
                pending.finished = true;
                resolution
            }
            Ok(Err(_)) => {
                pending.finished = true;
                Err(BridgeError::connection(
                    ConnectionKind::Closed,
                    "call abandoned without a response",
                ))
            }
            Err(_) => {
                pending.finished = true;
                let mut table = lock(&self.table);
                if table.pending.remove(&pending.id).is_some() {
                    table.settle(pending.id, Settlement::TimedOut);
                    drop(table);
                    tracing::warn!(
                        id = pending.id,
                        tool = %pending.tool,
                        timeout_ms,
                        "tool call timed out"
                    );
                    return Err(BridgeError::Timeout {
                        tool: pending.tool.clone(),
                        timeout_ms,
                    });
                }
                drop(table);

                // Resolved in the same instant the timer fired.
                pending.rx.try_recv().unwrap_or(Err(BridgeError::Timeout {
                    tool: pending.tool.clone(),
                    timeout_ms,
                }))
            }
        }
    }

    /// Resolve every outstanding call with a `Closed` connection error.
    ///
    /// Returns how many calls were cancelled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let mut table = lock(&self.table);
        let drained: Vec<(u64, PendingEntry)> = table.pending.drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            let _ = entry
                .slot
                .send(Err(BridgeError::connection(ConnectionKind::Closed, reason)));
            table.settle(id, Settlement::Cancelled);
        }
        drop(table);

        if count > 0 {
            tracing::info!(count, reason, "cancelled outstanding calls");
        }
        count
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.table).pending.len()
    }
}

// ─── PendingCall ─────────────────────────────────────────────────────────────

/// Handle to one in-flight call.
///
/// Dropping it before resolution cancels the call.
pub struct PendingCall {
    id: u64,
    tool: String,
    submitted_at: Instant,
    rx: oneshot::Receiver<Resolution>,
    table: Arc<Mutex<Table>>,
    finished: bool,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut table = lock(&self.table);
        if table.pending.remove(&self.id).is_some() {
            table.settle(self.id, Settlement::Cancelled);
            tracing::debug!(id = self.id, tool = %self.tool, "pending call cancelled");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
