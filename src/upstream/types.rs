//! Shared types for the upstream bridge.
//!
//! Outbound wire envelopes, inbound response frames, and the local tool call.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An upstream payload as received. Its shape is upstream-defined.
pub type RawPayload = Value;

// ─── Local call ──────────────────────────────────────────────────────────────

/// One tool invocation: a name plus a JSON argument object.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

// ─── Outbound envelope ───────────────────────────────────────────────────────

/// Envelope discriminator written as `"type": "message"`.
const MESSAGE_KIND: &str = "message";

/// Outbound wire envelope.
///
/// ```json
/// {"type": "message", "id": 7, "body": {"type": "callTool", "name": "...", "arguments": {...}}}
/// ```
///
/// `id` is only present when the transport needs explicit correlation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireRequest {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub body: WireBody,
}

/// The request carried by a [`WireRequest`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WireBody {
    /// Capability exchange sent once per connection.
    Initialize {
        #[serde(rename = "clientInfo")]
        client_info: ClientInfo,
    },
    /// A forwarded tool invocation.
    CallTool {
        name: String,
        arguments: Map<String, Value>,
    },
}

/// Identifies the bridge during the handshake.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl WireRequest {
    pub fn call_tool(name: &str, arguments: Map<String, Value>) -> Self {
        Self {
            kind: MESSAGE_KIND,
            id: None,
            body: WireBody::CallTool {
                name: name.to_string(),
                arguments,
            },
        }
    }

    pub fn initialize() -> Self {
        Self {
            kind: MESSAGE_KIND,
            id: None,
            body: WireBody::Initialize {
                client_info: ClientInfo {
                    name: env!("CARGO_PKG_NAME").to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
            },
        }
    }

    /// Attach a correlation id.
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// The upstream tool this envelope invokes (`"initialize"` for the handshake).
    pub fn tool_name(&self) -> &str {
        match &self.body {
            WireBody::Initialize { .. } => "initialize",
            WireBody::CallTool { name, .. } => name,
        }
    }

    /// Tool arguments, if this is a `callTool` envelope.
    pub fn arguments(&self) -> Option<&Map<String, Value>> {
        match &self.body {
            WireBody::CallTool { arguments, .. } => Some(arguments),
            WireBody::Initialize { .. } => None,
        }
    }
}

// ─── Inbound frames ──────────────────────────────────────────────────────────

/// A correlated response as sent by a streaming upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<InboundError>,
}

/// Error object inside an [`InboundMessage`].
#[derive(Debug, Clone, Deserialize)]
pub struct InboundError {
    #[serde(default)]
    pub code: Option<i64>,
    pub message: String,
}

/// How one upstream exchange ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// A usable payload.
    Payload(RawPayload),
    /// The upstream reported a tool-level failure.
    Failure(String),
    /// The response could not be decoded.
    Malformed(String),
}

impl Outcome {
    /// Classify a successful response body.
    ///
    /// Tool results flagged with `"isError": true` are failures even though
    /// they arrived on the success path; their text content is the message.
    pub fn from_result(value: RawPayload) -> Self {
        let flagged = value
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !flagged {
            return Outcome::Payload(value);
        }

        let fragments = crate::normalize::text_fragments(&value);
        if fragments.is_empty() {
            Outcome::Failure("upstream reported an error without detail".into())
        } else {
            Outcome::Failure(fragments.join("\n"))
        }
    }
}

/// A response routed back to the correlator.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub id: u64,
    pub outcome: Outcome,
}

impl From<InboundMessage> for InboundFrame {
    fn from(msg: InboundMessage) -> Self {
        let outcome = match (msg.error, msg.result) {
            (Some(err), _) => match err.code {
                Some(code) => Outcome::Failure(format!("[{code}] {}", err.message)),
                None => Outcome::Failure(err.message),
            },
            (None, Some(result)) => Outcome::from_result(result),
            (None, None) => Outcome::Malformed("response missing both result and error".into()),
        };
        Self {
            id: msg.id,
            outcome,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_tool_envelope_shape() {
        let mut args = Map::new();
        args.insert("query".into(), json!("capital of France"));
        let req = WireRequest::call_tool("search_engine", args);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "message",
                "body": {
                    "type": "callTool",
                    "name": "search_engine",
                    "arguments": {"query": "capital of France"}
                }
            })
        );
    }

    #[test]
    fn test_id_only_serialized_when_attached() {
        let req = WireRequest::call_tool("ping", Map::new()).with_id(9);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"id\":9"));
        assert_eq!(req.tool_name(), "ping");
    }

    #[test]
    fn test_initialize_envelope() {
        let req = WireRequest::initialize();
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["body"]["type"], "initialize");
        assert_eq!(value["body"]["clientInfo"]["name"], "brightbridge");
        assert_eq!(req.tool_name(), "initialize");
        assert!(req.arguments().is_none());
    }

    #[test]
    fn test_inbound_result_frame() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"id": 3, "result": {"content": []}}"#).unwrap();
        let frame = InboundFrame::from(msg);
        assert_eq!(frame.id, 3);
        assert_eq!(frame.outcome, Outcome::Payload(json!({"content": []})));
    }

    #[test]
    fn test_inbound_error_frame() {
        let msg: InboundMessage = serde_json::from_str(
            r#"{"id": 4, "error": {"code": -32601, "message": "no such tool"}}"#,
        )
        .unwrap();
        let frame = InboundFrame::from(msg);
        assert_eq!(frame.outcome, Outcome::Failure("[-32601] no such tool".into()));
    }

    #[test]
    fn test_inbound_missing_both() {
        let msg: InboundMessage = serde_json::from_str(r#"{"id": 5}"#).unwrap();
        assert!(matches!(
            InboundFrame::from(msg).outcome,
            Outcome::Malformed(_)
        ));
    }

    #[test]
    fn test_is_error_payload_becomes_failure() {
        let outcome = Outcome::from_result(json!({
            "isError": true,
            "content": [{"type": "text", "text": "zone not found"}]
        }));
        assert_eq!(outcome, Outcome::Failure("zone not found".into()));
    }
}
