//! JSON-RPC 2.0 wire types and MCP protocol constants.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_LIST_TOOLS: &str = "tools/list";
pub const METHOD_CALL_TOOL: &str = "tools/call";
pub const METHOD_PING: &str = "ping";

pub type RequestId = u64;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Request ids are unique per process.
pub fn next_request_id() -> RequestId {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: next_request_id(),
            method: method.into(),
            params: Some(params),
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response).
pub fn notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn result(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(Value::from(id)),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            id: Some(Value::from(id)),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }

    pub fn error_code(&self) -> Option<i64> {
        self.error.as_ref().map(|e| e.code)
    }

    /// Numeric request id, accepting numbers and numeric strings.
    pub fn request_id(&self) -> Option<RequestId> {
        match self.id.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Server capability set from the initialize handshake. Presence of a
/// key identifies the feature group.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    pub tools: bool,
    pub prompts: bool,
    pub resources: bool,
    pub logging: bool,
}

impl ServerCapabilities {
    pub fn from_initialize_result(result: &Value) -> Self {
        let capabilities = result.get("capabilities").and_then(Value::as_object);
        let has = |key: &str| capabilities.map(|c| c.contains_key(key)).unwrap_or(false);
        Self {
            tools: has("tools"),
            prompts: has("prompts"),
            resources: has("resources"),
            logging: has("logging"),
        }
    }
}

/// Tool definition from `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn from_wire(value: &Value) -> Option<Self> {
        Some(Self {
            name: value.get("name")?.as_str()?.to_string(),
            description: value
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            input_schema: value.get("inputSchema").cloned().unwrap_or_else(|| json!({})),
        })
    }
}

/// Params for the initialize request.
pub fn initialize_params(client_name: &str, client_version: &str) -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {
            "roots": {"listChanged": true},
            "sampling": {},
        },
        "clientInfo": {
            "name": client_name,
            "version": client_version,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique() {
        let a = JsonRpcRequest::new(METHOD_PING, json!({}));
        let b = JsonRpcRequest::new(METHOD_PING, json!({}));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn request_serializes_strict_2_0() {
        let request = JsonRpcRequest::new("tools/call", json!({"name": "t", "arguments": {}}));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "tools/call");
        assert!(value["id"].is_u64());
    }

    #[test]
    fn response_id_accepts_numeric_strings() {
        let response: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"17","result":{}}"#).unwrap();
        assert_eq!(response.request_id(), Some(17));
    }

    #[test]
    fn capabilities_from_key_presence() {
        let result = json!({"capabilities": {"tools": {}, "logging": {}}});
        let caps = ServerCapabilities::from_initialize_result(&result);
        assert!(caps.tools);
        assert!(caps.logging);
        assert!(!caps.prompts);
    }

    #[test]
    fn tool_definition_from_wire() {
        let tool = ToolDefinition::from_wire(&json!({
            "name": "read_file",
            "description": "Read a file",
            "inputSchema": {"type": "object"},
        }))
        .unwrap();
        assert_eq!(tool.name, "read_file");
        assert_eq!(tool.input_schema["type"], "object");
    }
}
