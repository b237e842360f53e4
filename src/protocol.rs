//! JSON-RPC 2.0 message types and MCP protocol structures.
//!
//! Outbound messages are one JSON object per `\n`-terminated line. Inbound
//! lines go through a single parse-and-classify step (`classify`) that
//! produces a tagged `Inbound` value; the connection dispatcher matches it
//! exhaustively.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Protocol version declared in the initialize handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client name/version advertised in `clientInfo`.
pub const CLIENT_NAME: &str = env!("CARGO_PKG_NAME");
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

// ─── Outbound ────────────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: String, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// Build a JSON-RPC notification (no `id`, no response expected).
pub fn notification(method: &str, params: Option<Value>) -> Value {
    match params {
        Some(params) => json!({"jsonrpc": "2.0", "method": method, "params": params}),
        None => json!({"jsonrpc": "2.0", "method": method}),
    }
}

/// Params for the `initialize` request.
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "clientInfo": { "name": CLIENT_NAME, "version": CLIENT_VERSION },
    })
}

// ─── Inbound ─────────────────────────────────────────────────────────────────

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// A classified inbound line.
#[derive(Debug)]
pub enum Inbound {
    /// Carries an `id`; correlated against the pending-request table.
    Response {
        id: String,
        result: Option<Value>,
        error: Option<RpcError>,
    },
    /// Carries a `method` and no `id`; out-of-band server signal.
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// Failed JSON parsing or an unrecognized shape. Logged, never fatal.
    Malformed {
        reason: String,
    },
}

/// Parse and classify one complete line.
///
/// `method` and no `id`: notification. Any `id` (string or number):
/// response. Everything else is malformed; the stream continues regardless.
pub fn classify(line: &str) -> Inbound {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            return Inbound::Malformed {
                reason: format!("invalid json: {e}"),
            }
        }
    };

    let id = match value.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };

    match (id, value.get("method").and_then(Value::as_str)) {
        (None, Some(method)) => Inbound::Notification {
            method: method.to_string(),
            params: value.get("params").cloned(),
        },
        (Some(id), _) => {
            let error = value
                .get("error")
                .cloned()
                .and_then(|e| serde_json::from_value::<RpcError>(e).ok());
            Inbound::Response {
                id,
                result: value.get("result").cloned(),
                error,
            }
        }
        (None, None) => Inbound::Malformed {
            reason: "object has neither id nor method".to_string(),
        },
    }
}

// ─── MCP payloads ────────────────────────────────────────────────────────────

/// A tool discovered via `tools/list`.
///
/// `input_schema` is opaque to the engine: passed through, never validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

/// Server identity from the `initialize` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub protocol_version: String,
}

/// Extract `ServerInfo` from an `initialize` result payload.
pub fn parse_server_info(result: &Value) -> ServerInfo {
    ServerInfo {
        name: result
            .pointer("/serverInfo/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        version: result
            .pointer("/serverInfo/version")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        protocol_version: result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

/// Extract and normalize the `tools` array from a `tools/list` result.
pub fn parse_tools(result: &Value) -> Vec<ToolDescriptor> {
    result
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| {
                    Some(ToolDescriptor {
                        name: t.get("name")?.as_str()?.to_string(),
                        description: t
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        input_schema: t.get("inputSchema").cloned().unwrap_or(json!({})),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
