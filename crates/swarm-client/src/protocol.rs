//! JSON-RPC 2.0 message types for the tool-call protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use swarm_core::tools::{ToolCallOutcome, ToolContent, ToolDescriptor};

use crate::ClientError;

/// Protocol revision announced during the handshake.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Notification method announcing a changed tool list.
pub const TOOLS_CHANGED_METHOD: &str = "notifications/tools/list_changed";

// ─────────────────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Request id; responses echo it.
    pub id: u64,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Build a request.
    #[must_use]
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Build a notification.
    #[must_use]
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// The id of the request this answers.
    pub id: Option<u64>,
    /// Success payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Unwrap into the result value, mapping protocol errors.
    pub fn into_result(self) -> Result<Value, ClientError> {
        if let Some(err) = self.error {
            Err(ClientError::Worker(format!("{} ({})", err.message, err.code)))
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

/// JSON-RPC error object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any inbound line: a response or a server-initiated notification.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum InboundMessage {
    /// A response to one of our requests.
    Response(JsonRpcResponse),
    /// A server-initiated notification.
    Notification(JsonRpcNotification),
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake params
// ─────────────────────────────────────────────────────────────────────────────

/// Build the `initialize` request params.
#[must_use]
pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "swarm",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// Build the `tools/call` request params.
#[must_use]
pub fn tool_call_params(tool: &str, args: Value) -> Value {
    serde_json::json!({"name": tool, "arguments": args})
}

// ─────────────────────────────────────────────────────────────────────────────
// Result parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Parse a `tools/list` result into descriptors.
pub fn parse_tools_list(result: Value) -> Result<Vec<ToolDescriptor>, ClientError> {
    let tools = result
        .get("tools")
        .cloned()
        .unwrap_or(Value::Array(Vec::new()));
    serde_json::from_value(tools)
        .map_err(|e| ClientError::Protocol(format!("malformed tools list: {e}")))
}

/// Parse a `tools/call` result into an outcome, preserving unknown
/// content kinds.
pub fn parse_tool_outcome(result: Value) -> Result<ToolCallOutcome, ClientError> {
    #[derive(Deserialize)]
    struct Wire {
        #[serde(default)]
        content: Vec<ToolContent>,
        #[serde(rename = "isError", default)]
        is_error: bool,
    }

    let wire: Wire = serde_json::from_value(result)
        .map_err(|e| ClientError::Protocol(format!("malformed tool result: {e}")))?;
    Ok(ToolCallOutcome {
        content: wire.content,
        is_error: wire.is_error,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let req = JsonRpcRequest::new(7, "tools/list", None);
        let s = serde_json::to_string(&req).unwrap();
        assert!(s.contains("\"jsonrpc\":\"2.0\""));
        assert!(s.contains("\"id\":7"));
        assert!(!s.contains("params"));
    }

    #[test]
    fn response_into_result_ok() {
        let resp: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#).unwrap();
        assert_eq!(resp.into_result().unwrap(), json!({"tools": []}));
    }

    #[test]
    fn response_into_result_error() {
        let resp: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"no such method"}}"#,
        )
        .unwrap();
        let err = resp.into_result().unwrap_err();
        assert!(matches!(err, ClientError::Worker(m) if m.contains("no such method")));
    }

    #[test]
    fn inbound_distinguishes_notification() {
        let msg: InboundMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            InboundMessage::Notification(n) if n.method == TOOLS_CHANGED_METHOD
        ));

        let msg: InboundMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":{}}"#).unwrap();
        assert!(matches!(msg, InboundMessage::Response(r) if r.id == Some(3)));
    }

    #[test]
    fn parse_tools_list_defaults_missing_fields() {
        let tools = parse_tools_list(json!({"tools": [{"name": "navigate"}]})).unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "navigate");
        assert_eq!(tools[0].input_schema, json!({"type": "object"}));
    }

    #[test]
    fn parse_tools_list_tolerates_absent_key() {
        assert!(parse_tools_list(json!({})).unwrap().is_empty());
    }

    #[test]
    fn parse_tool_outcome_with_unknown_kind() {
        let out = parse_tool_outcome(json!({
            "content": [
                {"type": "text", "text": "ok"},
                {"type": "resource_link", "uri": "file:///x"}
            ],
            "isError": false
        }))
        .unwrap();
        assert_eq!(out.content.len(), 2);
        assert!(!out.is_error);
        // Unknown kind survives re-serialization untouched.
        let back = serde_json::to_value(&out.content[1]).unwrap();
        assert_eq!(back["type"], "resource_link");
    }

    #[test]
    fn parse_tool_outcome_error_flag() {
        let out = parse_tool_outcome(json!({
            "content": [{"type": "text", "text": "boom"}],
            "isError": true
        }))
        .unwrap();
        assert!(out.is_error);
    }

    #[test]
    fn initialize_params_shape() {
        let params = initialize_params();
        assert_eq!(params["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(params["clientInfo"]["name"], "swarm");
    }
}
