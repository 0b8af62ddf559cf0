//! Upstream bridge: session, correlation, translation and transports.
//!
//! This module handles:
//! - Opening and keeping a session with the upstream execution endpoint
//! - Translating local tool calls into wire envelopes
//! - Correlating asynchronous responses back to their callers
//! - Persistent (SSE) and one-shot (HTTP POST) transports
//!
//! The dispatch table (`crate::dispatch`) is the only consumer.

pub mod correlator;
pub mod session;
pub mod sse;
pub mod translator;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod fake;
#[cfg(test)]
pub(crate) mod stub;

// Re-exports for convenience
pub use correlator::{Correlator, PendingCall};
pub use session::{SessionMode, SessionOptions, SessionState, UpstreamSession};
pub use sse::SseTransport;
pub use translator::translate;
pub use transport::{HttpTransport, Transport};
pub use types::{RawPayload, ToolCall, WireRequest};
