//! High-level MCP client.
//!
//! Owns the set of active server connections keyed by server id. Only
//! connect and disconnect take the coordination mutex; per-call sends
//! run against a cloned connection handle.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::mcp::protocol::{
    initialize_params, notification, JsonRpcRequest, ServerCapabilities, ToolDefinition,
    METHOD_CALL_TOOL, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_LIST_TOOLS, METHOD_PING,
};
use crate::mcp::transport::{HttpTransport, StdioTransport, Transport, WebSocketTransport};
use crate::registry::{ServerInfo, TransportKind};

/// Everything needed to open a connection to a server.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub transport: TransportKind,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub url: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl ConnectionConfig {
    pub fn from_server(server: &ServerInfo, timeout: Duration) -> Self {
        Self {
            transport: server.transport,
            command: server.command.clone(),
            args: server.args.clone(),
            url: server.url.clone(),
            headers: server.headers.clone(),
            timeout,
        }
    }
}

/// Build the transport for a connection config.
pub fn create_transport(config: &ConnectionConfig) -> Result<Box<dyn Transport>, GatewayError> {
    match config.transport {
        TransportKind::Stdio => {
            let command = config.command.clone().ok_or_else(|| {
                GatewayError::Config("command required for stdio transport".to_string())
            })?;
            Ok(Box::new(StdioTransport::new(
                command,
                config.args.clone(),
                config.timeout,
            )))
        }
        TransportKind::Http => {
            let url = config.url.clone().ok_or_else(|| {
                GatewayError::Config("url required for http transport".to_string())
            })?;
            Ok(Box::new(HttpTransport::new(
                url,
                config.headers.clone(),
                config.timeout,
            )))
        }
        TransportKind::Websocket => {
            let url = config.url.clone().ok_or_else(|| {
                GatewayError::Config("url required for websocket transport".to_string())
            })?;
            Ok(Box::new(WebSocketTransport::new(
                url,
                config.headers.clone(),
                config.timeout,
            )))
        }
    }
}

/// An initialized connection to one server.
pub struct ServerConnection {
    pub server_id: String,
    transport: Box<dyn Transport>,
    pub capabilities: ServerCapabilities,
    pub tools: Vec<ToolDefinition>,
    pub initialized: bool,
}

/// Result of a tool call.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolCallResult {
    pub success: bool,
    pub content: Value,
    pub error: Option<String>,
    pub error_code: Option<i64>,
    pub server_id: Option<String>,
    pub tool_name: Option<String>,
}

impl ToolCallResult {
    fn failure(code: i64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: Value::Null,
            error: Some(error.into()),
            error_code: Some(code),
            server_id: None,
            tool_name: None,
        }
    }
}

/// MCP client managing a set of server connections.
pub struct McpClient {
    connections: Mutex<HashMap<String, Arc<ServerConnection>>>,
    client_name: String,
    client_version: String,
}

impl Default for McpClient {
    fn default() -> Self {
        Self::new("mcp-gateway", env!("CARGO_PKG_VERSION"))
    }
}

impl McpClient {
    pub fn new(client_name: impl Into<String>, client_version: impl Into<String>) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            client_name: client_name.into(),
            client_version: client_version.into(),
        }
    }

    /// Connect to a server described by `config` and run the handshake.
    pub async fn connect_server(
        &self,
        server_id: &str,
        config: &ConnectionConfig,
    ) -> Result<(), GatewayError> {
        let transport = create_transport(config)?;
        self.connect_with_transport(server_id, transport).await
    }

    /// Connect through an already-built transport.
    ///
    /// This is the injection seam for custom transports: the handshake
    /// (initialize, initialized notification, tools/list) is identical
    /// for every transport kind. The whole sequence must succeed or the
    /// connection is torn down.
    pub async fn connect_with_transport(
        &self,
        server_id: &str,
        transport: Box<dyn Transport>,
    ) -> Result<(), GatewayError> {
        let mut connections = self.connections.lock().await;

        if let Some(existing) = connections.remove(server_id) {
            existing.transport.disconnect().await;
        }

        transport.connect().await?;

        let connection = match self.initialize(server_id, transport).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(server_id, %e, "handshake failed");
                return Err(e);
            }
        };

        info!(server_id, tools = connection.tools.len(), "connected MCP server");
        connections.insert(server_id.to_string(), Arc::new(connection));
        Ok(())
    }

    async fn initialize(
        &self,
        server_id: &str,
        transport: Box<dyn Transport>,
    ) -> Result<ServerConnection, GatewayError> {
        let init = JsonRpcRequest::new(
            METHOD_INITIALIZE,
            initialize_params(&self.client_name, &self.client_version),
        );
        let response = match transport.send_request(init).await {
            Ok(response) => response,
            Err(e) => {
                transport.disconnect().await;
                return Err(e);
            }
        };
        if let Some(message) = response.error_message() {
            let message = message.to_string();
            transport.disconnect().await;
            return Err(GatewayError::Transport(format!("initialize failed: {message}")));
        }

        let result = response.result.unwrap_or_default();
        let capabilities = ServerCapabilities::from_initialize_result(&result);

        if let Err(e) = transport
            .send_notification(notification(METHOD_INITIALIZED, json!({})))
            .await
        {
            transport.disconnect().await;
            return Err(e);
        }

        let mut tools = Vec::new();
        if capabilities.tools {
            let list = JsonRpcRequest::new(METHOD_LIST_TOOLS, json!({}));
            let response = match transport.send_request(list).await {
                Ok(response) => response,
                Err(e) => {
                    transport.disconnect().await;
                    return Err(e);
                }
            };
            if let Some(message) = response.error_message() {
                let message = message.to_string();
                transport.disconnect().await;
                return Err(GatewayError::Transport(format!("tools/list failed: {message}")));
            }

            tools = response
                .result
                .as_ref()
                .and_then(|r| r.get("tools"))
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(ToolDefinition::from_wire).collect())
                .unwrap_or_default();
        }

        Ok(ServerConnection {
            server_id: server_id.to_string(),
            transport,
            capabilities,
            tools,
            initialized: true,
        })
    }

    pub async fn disconnect_server(&self, server_id: &str) {
        let connection = self.connections.lock().await.remove(server_id);
        if let Some(connection) = connection {
            connection.transport.disconnect().await;
            info!(server_id, "disconnected MCP server");
        }
    }

    pub async fn disconnect_all(&self) {
        let connections: Vec<_> = self.connections.lock().await.drain().collect();
        for (_, connection) in connections {
            connection.transport.disconnect().await;
        }
    }

    pub async fn list_connections(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn is_connected(&self, server_id: &str) -> bool {
        self.connections
            .lock()
            .await
            .get(server_id)
            .map(|c| c.transport.is_connected())
            .unwrap_or(false)
    }

    /// Tool catalog cached during the handshake.
    pub async fn server_tools(&self, server_id: &str) -> Vec<ToolDefinition> {
        self.connections
            .lock()
            .await
            .get(server_id)
            .map(|c| c.tools.clone())
            .unwrap_or_default()
    }

    /// Invoke a tool on a connected server.
    ///
    /// Transport failures come back as structured results, never errors:
    /// disconnected is -32000, uninitialized -32001, timeout -32002,
    /// internal -32603.
    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Map<String, Value>,
    ) -> ToolCallResult {
        let connection = {
            self.connections.lock().await.get(server_id).cloned()
        };

        let Some(connection) = connection else {
            return ToolCallResult::failure(-32000, format!("Server not connected: {server_id}"));
        };
        if !connection.initialized {
            return ToolCallResult::failure(-32001, format!("Server not initialized: {server_id}"));
        }

        let request = JsonRpcRequest::new(
            METHOD_CALL_TOOL,
            json!({"name": tool_name, "arguments": arguments}),
        );

        let response = match connection.transport.send_request(request).await {
            Ok(response) => response,
            Err(e @ GatewayError::Timeout { .. }) => {
                return ToolCallResult::failure(-32002, e.to_string());
            }
            Err(e) => {
                return ToolCallResult::failure(-32603, e.to_string());
            }
        };

        if let Some(error) = &response.error {
            return ToolCallResult::failure(error.code, error.message.clone());
        }

        let result = response.result.unwrap_or_default();
        let content = lift_text_content(result.get("content").cloned().unwrap_or(json!([])));

        ToolCallResult {
            success: true,
            content,
            error: None,
            error_code: None,
            server_id: Some(server_id.to_string()),
            tool_name: Some(tool_name.to_string()),
        }
    }

    /// True iff the server answers a ping without error.
    pub async fn ping_server(&self, server_id: &str) -> bool {
        let connection = {
            self.connections.lock().await.get(server_id).cloned()
        };
        let Some(connection) = connection else {
            return false;
        };

        let request = JsonRpcRequest::new(METHOD_PING, json!({}));
        match connection.transport.send_request(request).await {
            Ok(response) => !response.is_error(),
            Err(_) => false,
        }
    }
}

/// Lift `[{type:"text", text}]` to the bare text; other shapes pass
/// through verbatim.
fn lift_text_content(content: Value) -> Value {
    if let Some(items) = content.as_array() {
        if let Some(first) = items.first() {
            if first.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(text) = first.get("text") {
                    return text.clone();
                }
            }
        }
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::test_support::ScriptedTransport;

    #[tokio::test]
    async fn handshake_caches_tool_catalog() {
        let client = McpClient::default();
        let transport = ScriptedTransport::new().with_tool(
            "read_file",
            "Read a file",
            json!({"type": "object", "properties": {"path": {"type": "string"}}}),
        );

        client
            .connect_with_transport("files", Box::new(transport))
            .await
            .unwrap();

        let tools = client.server_tools("files").await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "read_file");
        assert_eq!(client.list_connections().await, vec!["files"]);
    }

    #[tokio::test]
    async fn call_on_unknown_server_is_code_32000() {
        let client = McpClient::default();
        let result = client.call_tool("ghost", "read_file", Map::new()).await;

        assert!(!result.success);
        assert_eq!(result.error_code, Some(-32000));
    }

    #[tokio::test]
    async fn call_lifts_text_content() {
        let client = McpClient::default();
        let transport = ScriptedTransport::new()
            .with_tool("greet", "Greets", json!({"type": "object"}))
            .with_call_result(
                "greet",
                json!({"content": [{"type": "text", "text": "hello there"}]}),
            );

        client
            .connect_with_transport("greeter", Box::new(transport))
            .await
            .unwrap();

        let result = client.call_tool("greeter", "greet", Map::new()).await;
        assert!(result.success);
        assert_eq!(result.content, json!("hello there"));
    }

    #[tokio::test]
    async fn call_passes_non_text_content_verbatim() {
        let client = McpClient::default();
        let blocks = json!({"content": [{"type": "image", "data": "aGk="}]});
        let transport = ScriptedTransport::new()
            .with_tool("shot", "Screenshot", json!({"type": "object"}))
            .with_call_result("shot", blocks);

        client
            .connect_with_transport("browser", Box::new(transport))
            .await
            .unwrap();

        let result = client.call_tool("browser", "shot", Map::new()).await;
        assert!(result.success);
        assert_eq!(result.content[0]["type"], "image");
    }

    #[tokio::test]
    async fn remote_errors_are_structured() {
        let client = McpClient::default();
        let transport = ScriptedTransport::new()
            .with_tool("boom", "Fails", json!({"type": "object"}))
            .with_call_error("boom", -32050, "tool exploded");

        client
            .connect_with_transport("bad", Box::new(transport))
            .await
            .unwrap();

        let result = client.call_tool("bad", "boom", Map::new()).await;
        assert!(!result.success);
        assert_eq!(result.error_code, Some(-32050));
        assert_eq!(result.error.as_deref(), Some("tool exploded"));
    }

    #[tokio::test]
    async fn failed_connect_leaves_no_connection() {
        let client = McpClient::default();
        let transport = ScriptedTransport::failing_connect();

        let result = client
            .connect_with_transport("down", Box::new(transport))
            .await;
        assert!(result.is_err());
        assert!(client.list_connections().await.is_empty());
    }

    #[tokio::test]
    async fn ping_is_true_on_non_error_response() {
        let client = McpClient::default();
        let transport = ScriptedTransport::new();
        client
            .connect_with_transport("s", Box::new(transport))
            .await
            .unwrap();

        assert!(client.ping_server("s").await);
        assert!(!client.ping_server("missing").await);
    }
}
