//! Request translation: local [`ToolCall`] → upstream [`WireRequest`].
//!
//! Pure and synchronous. Malformed calls are rejected here, before any
//! network activity.

use serde_json::Value;

use crate::errors::BridgeError;

use super::types::{ToolCall, WireRequest};

/// Build the upstream envelope for a tool call.
///
/// Fails with `Validation` when the name is blank, when `arguments` is not a
/// JSON object, or when the object has an empty key.
pub fn translate(call: &ToolCall) -> Result<WireRequest, BridgeError> {
    let name = call.name.trim();
    if name.is_empty() {
        return Err(BridgeError::validation("tool name must not be empty"));
    }

    let arguments = call.arguments.as_object().ok_or_else(|| {
        BridgeError::validation(format!(
            "arguments for '{name}' must be a JSON object, got {}",
            json_type_name(&call.arguments)
        ))
    })?;

    if arguments.keys().any(|k| k.trim().is_empty()) {
        return Err(BridgeError::validation(format!(
            "arguments for '{name}' contain an empty key"
        )));
    }

    Ok(WireRequest::call_tool(name, arguments.clone()))
}

/// Human-readable JSON type name for error messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
