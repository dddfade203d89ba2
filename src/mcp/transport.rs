//! Transport layer.
//!
//! Pure transport, no business logic: every transport exposes
//! connect/disconnect/is_connected/send_request over strict JSON-RPC 2.0.
//! The stdio and WebSocket transports each own one background reader that
//! correlates incoming frames to outstanding requests by id; writes are
//! serialized under a mutex, and a waiter is never held while its sender
//! awaits a response.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse, RequestId};

/// Uniform transport contract.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), GatewayError>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;
    /// Send a request and wait for the response with the matching id.
    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, GatewayError>;
    /// Send a notification; no response is expected.
    async fn send_notification(&self, payload: serde_json::Value) -> Result<(), GatewayError>;
}

pub(crate) type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>>;

async fn register_waiter(pending: &PendingMap, id: RequestId) -> oneshot::Receiver<JsonRpcResponse> {
    let (tx, rx) = oneshot::channel();
    pending.lock().await.insert(id, tx);
    rx
}

async fn remove_waiter(pending: &PendingMap, id: RequestId) {
    pending.lock().await.remove(&id);
}

/// Complete the waiter for a parsed incoming frame, if any.
async fn dispatch_frame(pending: &PendingMap, text: &str) {
    if text.trim().is_empty() {
        return;
    }

    let response: JsonRpcResponse = match serde_json::from_str(text) {
        Ok(response) => response,
        Err(e) => {
            warn!(%e, "dropping malformed frame");
            return;
        }
    };

    let Some(id) = response.request_id() else {
        // Notification or response without a usable id.
        debug!("frame without request id");
        return;
    };

    let sender = { pending.lock().await.remove(&id) };
    if let Some(tx) = sender {
        let _ = tx.send(response);
    }
}

/// Fail every outstanding waiter by dropping its sender.
async fn fail_outstanding(pending: &PendingMap) {
    pending.lock().await.clear();
}

/// Wait for the response, removing the waiter on timeout or closure.
async fn await_response(
    rx: oneshot::Receiver<JsonRpcResponse>,
    id: RequestId,
    timeout: Duration,
    pending: &PendingMap,
) -> Result<JsonRpcResponse, GatewayError> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(_)) => Err(GatewayError::ConnectionClosed),
        Err(_) => {
            remove_waiter(pending, id).await;
            Err(GatewayError::Timeout { id, timeout })
        }
    }
}

/// Reader loop over newline-delimited JSON frames.
pub(crate) async fn read_frames<R: AsyncRead + Unpin>(
    reader: R,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        dispatch_frame(&pending, &line).await;
    }

    connected.store(false, Ordering::SeqCst);
    fail_outstanding(&pending).await;
    debug!("reader finished");
}

// ==================== stdio ====================

struct StdioState {
    child: Child,
    stdin: ChildStdin,
    reader: JoinHandle<()>,
}

/// Subprocess transport speaking newline-delimited JSON-RPC over
/// stdin/stdout.
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    timeout: Duration,
    state: Mutex<Option<StdioState>>,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
}

impl StdioTransport {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
            state: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::Transport(format!("spawn {}: {e}", self.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::Transport("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Transport("child stdout unavailable".to_string()))?;

        self.connected.store(true, Ordering::SeqCst);
        let reader = tokio::spawn(read_frames(
            stdout,
            Arc::clone(&self.pending),
            Arc::clone(&self.connected),
        ));

        *state = Some(StdioState { child, stdin, reader });
        info!(command = %self.command, "started MCP server process");
        Ok(())
    }

    async fn disconnect(&self) {
        let Some(mut state) = self.state.lock().await.take() else {
            return;
        };
        self.connected.store(false, Ordering::SeqCst);
        state.reader.abort();

        // Terminate, wait bounded, then force-kill.
        let _ = state.child.start_kill();
        if tokio::time::timeout(Duration::from_secs(5), state.child.wait())
            .await
            .is_err()
        {
            let _ = state.child.kill().await;
        }

        fail_outstanding(&self.pending).await;
        info!(command = %self.command, "stopped MCP server process");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, GatewayError> {
        let id = request.id;
        let line = serde_json::to_string(&request)?;
        let rx = register_waiter(&self.pending, id).await;

        {
            // Writes are serialized under the state mutex; the waiter map
            // is not held across the response wait.
            let mut state = self.state.lock().await;
            let Some(state) = state.as_mut() else {
                remove_waiter(&self.pending, id).await;
                return Err(GatewayError::NotConnected);
            };
            if let Err(e) = write_line(&mut state.stdin, &line).await {
                remove_waiter(&self.pending, id).await;
                return Err(e);
            }
        }

        await_response(rx, id, self.timeout, &self.pending).await
    }

    async fn send_notification(&self, payload: serde_json::Value) -> Result<(), GatewayError> {
        let line = serde_json::to_string(&payload)?;
        let mut state = self.state.lock().await;
        let state = state.as_mut().ok_or(GatewayError::NotConnected)?;
        write_line(&mut state.stdin, &line).await
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> Result<(), GatewayError> {
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| GatewayError::Transport(format!("write: {e}")))?;
    stdin
        .write_all(b"\n")
        .await
        .map_err(|e| GatewayError::Transport(format!("write: {e}")))?;
    stdin
        .flush()
        .await
        .map_err(|e| GatewayError::Transport(format!("flush: {e}")))?;
    Ok(())
}

// ==================== HTTP ====================

/// Stateless HTTP transport: one POST per JSON-RPC request.
pub struct HttpTransport {
    url: String,
    headers: BTreeMap<String, String>,
    timeout: Duration,
    client: Mutex<Option<reqwest::Client>>,
    connected: Arc<AtomicBool>,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, headers: BTreeMap<String, String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            headers,
            timeout,
            client: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn header_map(&self) -> reqwest::header::HeaderMap {
        let mut map = reqwest::header::HeaderMap::new();
        for (key, value) in &self.headers {
            match (
                reqwest::header::HeaderName::from_bytes(key.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.insert(name, value);
                }
                _ => warn!(header = %key, "skipping invalid header"),
            }
        }
        map
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self) -> Result<(), GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .default_headers(self.header_map())
            .build()
            .map_err(|e| GatewayError::Transport(format!("http client: {e}")))?;

        *self.client.lock().await = Some(client);
        self.connected.store(true, Ordering::SeqCst);
        info!(url = %self.url, "connected HTTP MCP server");
        Ok(())
    }

    async fn disconnect(&self) {
        *self.client.lock().await = None;
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, GatewayError> {
        let client = {
            self.client
                .lock()
                .await
                .clone()
                .ok_or(GatewayError::NotConnected)?
        };

        let response = match client.post(&self.url).json(&request).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(GatewayError::Timeout {
                    id: request.id,
                    timeout: self.timeout,
                })
            }
            Err(e) => {
                return Ok(JsonRpcResponse::error(request.id, -32603, e.to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            // Non-2xx maps to a JSON-RPC error carrying the status code.
            return Ok(JsonRpcResponse::error(
                request.id,
                status.as_u16() as i64,
                format!("HTTP {status}"),
            ));
        }

        response
            .json::<JsonRpcResponse>()
            .await
            .map_err(|e| GatewayError::Transport(format!("decode response: {e}")))
    }

    async fn send_notification(&self, payload: serde_json::Value) -> Result<(), GatewayError> {
        let client = {
            self.client
                .lock()
                .await
                .clone()
                .ok_or(GatewayError::NotConnected)?
        };
        let _ = client.post(&self.url).json(&payload).send().await;
        Ok(())
    }
}

// ==================== WebSocket ====================

type WsSink = futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Persistent WebSocket transport with one background reader.
pub struct WebSocketTransport {
    url: String,
    headers: BTreeMap<String, String>,
    timeout: Duration,
    writer: Mutex<Option<WsSink>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, headers: BTreeMap<String, String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            headers,
            timeout,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<(), GatewayError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| GatewayError::Transport(format!("websocket url: {e}")))?;
        for (key, value) in &self.headers {
            match (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    request.headers_mut().insert(name, value);
                }
                _ => warn!(header = %key, "skipping invalid header"),
            }
        }

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| GatewayError::Transport(format!("websocket connect: {e}")))?;
        let (sink, mut source) = stream.split();

        self.connected.store(true, Ordering::SeqCst);
        let pending = Arc::clone(&self.pending);
        let connected = Arc::clone(&self.connected);
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => dispatch_frame(&pending, &text).await,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            connected.store(false, Ordering::SeqCst);
            fail_outstanding(&pending).await;
        });

        *self.writer.lock().await = Some(sink);
        *self.reader.lock().await = Some(reader);
        info!(url = %self.url, "connected WebSocket MCP server");
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        fail_outstanding(&self.pending).await;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, GatewayError> {
        let id = request.id;
        let text = serde_json::to_string(&request)?;
        let rx = register_waiter(&self.pending, id).await;

        {
            let mut writer = self.writer.lock().await;
            let Some(sink) = writer.as_mut() else {
                remove_waiter(&self.pending, id).await;
                return Err(GatewayError::NotConnected);
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                remove_waiter(&self.pending, id).await;
                return Err(GatewayError::Transport(format!("websocket send: {e}")));
            }
        }

        await_response(rx, id, self.timeout, &self.pending).await
    }

    async fn send_notification(&self, payload: serde_json::Value) -> Result<(), GatewayError> {
        let text = serde_json::to_string(&payload)?;
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(GatewayError::NotConnected)?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| GatewayError::Transport(format!("websocket send: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_pending() -> PendingMap {
        Arc::new(Mutex::new(HashMap::new()))
    }

    #[tokio::test]
    async fn responses_correlate_by_id_even_out_of_order() {
        let pending = new_pending();
        let connected = Arc::new(AtomicBool::new(true));
        let (mut client_side, server_side) = tokio::io::duplex(4096);
        tokio::spawn(read_frames(
            server_side,
            Arc::clone(&pending),
            Arc::clone(&connected),
        ));

        let rx1 = register_waiter(&pending, 1).await;
        let rx2 = register_waiter(&pending, 2).await;

        // Respond in reverse order.
        let frames = concat!(
            r#"{"jsonrpc":"2.0","id":2,"result":{"value":"second"}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":1,"result":{"value":"first"}}"#,
            "\n",
        );
        client_side.write_all(frames.as_bytes()).await.unwrap();

        let response2 = rx2.await.unwrap();
        let response1 = rx1.await.unwrap();
        assert_eq!(response1.result.unwrap()["value"], "first");
        assert_eq!(response2.result.unwrap()["value"], "second");
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_without_affecting_waiters() {
        let pending = new_pending();
        let connected = Arc::new(AtomicBool::new(true));
        let (mut client_side, server_side) = tokio::io::duplex(4096);
        tokio::spawn(read_frames(
            server_side,
            Arc::clone(&pending),
            Arc::clone(&connected),
        ));

        let rx = register_waiter(&pending, 7).await;
        let frames = concat!(
            "this is not json\n",
            r#"{"jsonrpc":"2.0","id":7,"result":"ok"}"#,
            "\n",
        );
        client_side.write_all(frames.as_bytes()).await.unwrap();

        let response = rx.await.unwrap();
        assert_eq!(response.result.unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn connection_close_fails_outstanding_waiters() {
        let pending = new_pending();
        let connected = Arc::new(AtomicBool::new(true));
        let (client_side, server_side) = tokio::io::duplex(4096);
        let reader = tokio::spawn(read_frames(
            server_side,
            Arc::clone(&pending),
            Arc::clone(&connected),
        ));

        let rx = register_waiter(&pending, 3).await;
        drop(client_side);
        reader.await.unwrap();

        assert!(rx.await.is_err());
        assert!(!connected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn timeout_removes_the_waiter() {
        let pending = new_pending();
        let rx = register_waiter(&pending, 9).await;

        let result = await_response(rx, 9, Duration::from_millis(20), &pending).await;
        assert!(matches!(result, Err(GatewayError::Timeout { id: 9, .. })));
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn error_responses_reach_the_waiter() {
        let pending = new_pending();
        let rx = register_waiter(&pending, 5).await;
        dispatch_frame(
            &pending,
            r#"{"jsonrpc":"2.0","id":5,"error":{"code":-32601,"message":"no such method"}}"#,
        )
        .await;

        let response = rx.await.unwrap();
        assert!(response.is_error());
        assert_eq!(response.error_code(), Some(-32601));
    }

    #[tokio::test]
    async fn disconnected_stdio_send_is_a_structured_error() {
        let transport =
            StdioTransport::new("true", Vec::new(), Duration::from_secs(1));
        let result = transport
            .send_request(JsonRpcRequest::new("ping", json!({})))
            .await;
        assert!(matches!(result, Err(GatewayError::NotConnected)));
    }
}
