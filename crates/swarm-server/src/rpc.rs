//! Server-side JSON-RPC plumbing shared by the HTTP and stdio
//! surfaces.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::hub_tools::{descriptors, HubTools};

/// Protocol revision announced to clients.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// One inbound JSON-RPC message. `id: None` marks a notification.
#[derive(Clone, Debug, Deserialize)]
pub struct RpcIn {
    /// Always `"2.0"`.
    #[allow(dead_code)]
    pub jsonrpc: String,
    /// Request id; absent for notifications. Echoed verbatim.
    #[serde(default)]
    pub id: Option<Value>,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

impl RpcIn {
    /// Whether this message expects no response.
    #[must_use]
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Build a success response echoing `id`.
#[must_use]
pub fn rpc_result(id: Option<&Value>, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.cloned().unwrap_or(Value::Null),
        "result": result,
    })
}

/// Build an error response echoing `id`.
#[must_use]
pub fn rpc_error(id: Option<&Value>, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.cloned().unwrap_or(Value::Null),
        "error": {"code": code, "message": message},
    })
}

/// Handle one request against the meta-tool server.
///
/// Returns `None` for notifications (no response travels back).
pub async fn handle_rpc(tools: &HubTools, session: Option<&str>, req: &RpcIn) -> Option<Value> {
    if req.is_notification() {
        return None;
    }
    let id = req.id.as_ref();

    let response = match req.method.as_str() {
        "initialize" => rpc_result(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {
                    "name": "swarm",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "ping" => rpc_result(id, json!({})),
        "tools/list" => rpc_result(id, json!({"tools": descriptors()})),
        "tools/call" => {
            #[derive(Deserialize)]
            struct Params {
                name: String,
                #[serde(default)]
                arguments: Value,
            }
            match serde_json::from_value::<Params>(req.params.clone()) {
                Ok(params) => {
                    let outcome = tools.dispatch(session, &params.name, params.arguments).await;
                    rpc_result(
                        id,
                        serde_json::to_value(&outcome)
                            .unwrap_or_else(|_| json!({"content": [], "isError": true})),
                    )
                }
                Err(e) => rpc_error(id, -32602, &format!("invalid params: {e}")),
            }
        }
        other => rpc_error(id, -32601, &format!("method '{other}' not found")),
    };
    Some(response)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_has_no_id() {
        let req: RpcIn = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        )
        .unwrap();
        assert!(req.is_notification());
    }

    #[test]
    fn string_ids_echo_verbatim() {
        let id = json!("req-abc");
        let resp = rpc_result(Some(&id), json!({}));
        assert_eq!(resp["id"], "req-abc");
    }

    #[test]
    fn error_shape() {
        let resp = rpc_error(Some(&json!(4)), -32601, "nope");
        assert_eq!(resp["error"]["code"], -32601);
        assert_eq!(resp["error"]["message"], "nope");
        assert_eq!(resp["id"], 4);
    }
}
