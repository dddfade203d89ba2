//! MCP client stack: JSON-RPC protocol types, the transport layer, and
//! the session-managing client.

pub mod client;
pub mod protocol;
pub mod test_support;
pub mod transport;

pub use client::{ConnectionConfig, McpClient, ServerConnection, ToolCallResult};
pub use protocol::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, ServerCapabilities, ToolDefinition,
    MCP_PROTOCOL_VERSION,
};
pub use transport::{HttpTransport, StdioTransport, Transport, WebSocketTransport};
