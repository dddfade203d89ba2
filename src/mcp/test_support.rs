//! Scripted in-process transport.
//!
//! Speaks the same handshake as a live server without any I/O. Used by
//! the test suite and by hosts that want to embed a fake server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::mcp::protocol::{
    JsonRpcRequest, JsonRpcResponse, METHOD_CALL_TOOL, METHOD_INITIALIZE, METHOD_LIST_TOOLS,
    METHOD_PING,
};
use crate::mcp::transport::Transport;

/// Deterministic in-process transport.
pub struct ScriptedTransport {
    connected: AtomicBool,
    fail_connect: bool,
    tools: Vec<Value>,
    call_results: HashMap<String, Value>,
    call_errors: HashMap<String, (i64, String)>,
    calls: Arc<Mutex<Vec<Value>>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            fail_connect: false,
            tools: Vec::new(),
            call_results: HashMap::new(),
            call_errors: HashMap::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Transport whose connect always fails.
    pub fn failing_connect() -> Self {
        Self {
            fail_connect: true,
            ..Self::new()
        }
    }

    /// Advertise a tool in the `tools/list` catalog.
    pub fn with_tool(mut self, name: &str, description: &str, input_schema: Value) -> Self {
        self.tools.push(json!({
            "name": name,
            "description": description,
            "inputSchema": input_schema,
        }));
        self
    }

    /// Fixed `tools/call` result for a tool.
    pub fn with_call_result(mut self, tool_name: &str, result: Value) -> Self {
        self.call_results.insert(tool_name.to_string(), result);
        self
    }

    /// Fixed `tools/call` error for a tool.
    pub fn with_call_error(mut self, tool_name: &str, code: i64, message: &str) -> Self {
        self.call_errors
            .insert(tool_name.to_string(), (code, message.to_string()));
        self
    }

    /// Handle to the recorded `tools/call` params.
    pub fn call_log(&self) -> Arc<Mutex<Vec<Value>>> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self) -> Result<(), GatewayError> {
        if self.fail_connect {
            return Err(GatewayError::Transport("scripted connect failure".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }

        let response = match request.method.as_str() {
            METHOD_INITIALIZE => JsonRpcResponse::result(
                request.id,
                json!({
                    "protocolVersion": super::protocol::MCP_PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "scripted", "version": "0.0.0"},
                }),
            ),
            METHOD_LIST_TOOLS => {
                JsonRpcResponse::result(request.id, json!({"tools": self.tools}))
            }
            METHOD_CALL_TOOL => {
                let params = request.params.clone().unwrap_or_default();
                if let Ok(mut calls) = self.calls.lock() {
                    calls.push(params.clone());
                }

                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if let Some((code, message)) = self.call_errors.get(name) {
                    JsonRpcResponse::error(request.id, *code, message.clone())
                } else {
                    let result = self.call_results.get(name).cloned().unwrap_or_else(|| {
                        json!({"content": [{"type": "text", "text": "ok"}]})
                    });
                    JsonRpcResponse::result(request.id, result)
                }
            }
            METHOD_PING => JsonRpcResponse::result(request.id, json!({})),
            other => JsonRpcResponse::error(request.id, -32601, format!("no such method: {other}")),
        };

        Ok(response)
    }

    async fn send_notification(&self, _payload: Value) -> Result<(), GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        Ok(())
    }
}
