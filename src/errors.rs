//! Bridge error types.
//!
//! Every failure a caller can observe carries one stable tag (see
//! [`BridgeError::tag`]) plus a human-readable message. Upstream-specific
//! exception types never leak past this enum.

use serde::Serialize;
use thiserror::Error;

/// Why a session could not be opened or kept alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    /// The handshake did not finish within the bounded wait.
    Timeout,
    /// The endpoint could not be reached (DNS, TCP, non-2xx on connect).
    Unreachable,
    /// The endpoint answered but the capability exchange failed.
    Handshake,
    /// The session was closed or the connection dropped.
    Closed,
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Unreachable => "unreachable",
            Self::Handshake => "handshake",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Local dispatch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchKind {
    UnknownTool,
}

/// Errors that can occur while bridging a tool call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    /// Malformed local request. Never reaches the network.
    #[error("invalid request: {reason}")]
    Validation { reason: String },

    /// Session open/handshake failure or a dropped connection.
    #[error("upstream connection error ({kind}): {reason}")]
    Connection { kind: ConnectionKind, reason: String },

    /// Unmatched or duplicate correlation id, or an unparseable wire envelope.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    /// The upstream explicitly reported a tool-level failure.
    #[error("upstream tool '{tool}' failed: {message}")]
    Upstream { tool: String, message: String },

    /// No response within the bound.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// The tool name is not registered.
    #[error("unknown tool: '{name}'")]
    Dispatch { kind: DispatchKind, name: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    Config { reason: String },
}

impl BridgeError {
    /// Stable, machine-readable tag for this error class.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::Connection { .. } => "connection_error",
            Self::Protocol { .. } => "protocol_error",
            Self::Upstream { .. } => "upstream_error",
            Self::Timeout { .. } => "timeout_error",
            Self::Dispatch { .. } => "dispatch_error",
            Self::Config { .. } => "config_error",
        }
    }

    /// Whether a failed session open may be attempted once more.
    pub fn is_reopenable(&self) -> bool {
        matches!(self, Self::Connection { kind, .. } if *kind != ConnectionKind::Closed)
    }

    /// Shorthand for a `Connection` error.
    pub fn connection(kind: ConnectionKind, reason: impl Into<String>) -> Self {
        Self::Connection {
            kind,
            reason: reason.into(),
        }
    }

    /// Shorthand for a `Validation` error.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// The `{tag, message}` body shown to callers.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            tag: self.tag(),
            message: self.to_string(),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Protocol {
            reason: format!("malformed JSON: {e}"),
        }
    }
}

/// Serializable error marker returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub tag: &'static str,
    pub message: String,
}
