//! ToolServer - one connection to one child tool server
//!
//! Owns the full connection lifecycle and request correlation:
//!
//! - State machine: `Disconnected → Connecting → Ready → Draining → Closed`.
//!   Calls are only accepted in `Ready`.
//! - A single **reader task** decodes newline-delimited JSON frames and
//!   dispatches them: responses resolve the pending-request table by id,
//!   child-originated requests go through the sampling relay, notifications
//!   are logged.
//! - A **stderr task** line-buffers the child's stderr and surfaces it to the
//!   gateway log tagged with the server id. Stderr is never interpreted.
//! - Concurrent `call`s each write exactly one JSON line to the link; the
//!   pending entry is registered before the write primitive is released, so
//!   a response can never arrive for an unregistered id.
//! - Timeout or caller cancellation removes the pending entry; a late
//!   response for that id is logged and dropped.
//! - On stream close the reader drains the pending table, completing every
//!   awaiter with `ConnectionClosed`. Reconnection is caller-driven.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PmlError, Result};
use crate::mux::transport::{spawn_stdio, HttpStreamLink, StdioLink};
use crate::mux::types::{SamplingHandler, ServerConfig, ToolCallResult, ToolDescriptor, TransportConfig};
use crate::rpc::{Frame, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::util::{CALL_TIMEOUT, INIT_TIMEOUT, REMOTE_INIT_TIMEOUT};

/// Channel buffer for frames flowing from the transport to the reader task.
const FRAME_CHANNEL_CAPACITY: usize = 256;

/// MCP protocol version the gateway speaks to children.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Disconnected,
    Connecting,
    Ready,
    Draining,
    Closed,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Disconnected => "Disconnected",
            ServerState::Connecting => "Connecting",
            ServerState::Ready => "Ready",
            ServerState::Draining => "Draining",
            ServerState::Closed => "Closed",
        }
    }
}

/// Pending-request table: id → awaiter.
///
/// Invariant: an entry's existence means exactly one reader-loop delivery or
/// one synthetic completion (timeout, cancellation, drain) will consume it.
type Pending = FxHashMap<u64, oneshot::Sender<Result<JsonRpcResponse>>>;

/// Write half of the connection, one variant per transport.
enum WriteLink {
    Stdio(StdioLink),
    Http(HttpStreamLink),
}

/// One connection to one tool server, safe to call concurrently.
pub struct ToolServer {
    id: Arc<str>,
    config: ServerConfig,
    state: Mutex<ServerState>,
    pending: Arc<Mutex<Pending>>,
    /// Write-serialisation primitive: guarantees whole-line JSON writes and
    /// pending registration before release
    link: AsyncMutex<Option<WriteLink>>,
    /// Sender side of the frame channel; http POST pumps write into it
    frame_tx: Mutex<Option<mpsc::Sender<String>>>,
    next_id: AtomicU64,
    sampling: RwLock<Option<Arc<dyn SamplingHandler>>>,
    /// Mutex mode: one in-flight request-response cycle at a time
    serial_lock: AsyncMutex<()>,
    /// Cancelled when the connection goes down (close or fatal I/O)
    conn_cancel: Mutex<CancellationToken>,
    process: Mutex<Option<Child>>,
}

impl std::fmt::Debug for ToolServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolServer")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl ToolServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            id: Arc::from(config.id.as_str()),
            config,
            state: Mutex::new(ServerState::Disconnected),
            pending: Arc::new(Mutex::new(Pending::default())),
            link: AsyncMutex::new(None),
            frame_tx: Mutex::new(None),
            next_id: AtomicU64::new(1),
            sampling: RwLock::new(None),
            serial_lock: AsyncMutex::new(()),
            conn_cancel: Mutex::new(CancellationToken::new()),
            process: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// Calls are only accepted while Ready.
    pub fn is_ready(&self) -> bool {
        self.state() == ServerState::Ready
    }

    /// In-flight requests awaiting a response (health observability).
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Install the sampling relay handler for child-originated
    /// `sampling/createMessage` requests.
    pub fn set_sampling_handler(&self, handler: Arc<dyn SamplingHandler>) {
        *self.sampling.write() = Some(handler);
    }

    /// Per-call timeout from config, falling back to the default.
    pub fn call_timeout(&self) -> Duration {
        self.config
            .call_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(CALL_TIMEOUT)
    }

    fn init_timeout(&self) -> Duration {
        if let Some(ms) = self.config.init_timeout_ms {
            return Duration::from_millis(ms);
        }
        if self.config.is_remote() {
            REMOTE_INIT_TIMEOUT
        } else {
            INIT_TIMEOUT
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock() = state;
    }

    /// Connect to the tool server: spawn (stdio) or probe (http-stream),
    /// start the reader and stderr tasks, then run the initialize handshake.
    ///
    /// Idempotent while Ready. Allowed from Disconnected or Closed
    /// (reconnection policy is caller-driven).
    ///
    /// # Errors
    ///
    /// Returns `PmlError::ConnectionFailed` when spawning or the handshake
    /// fails; the server ends up Closed.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ServerState::Ready => return Ok(()),
                ServerState::Connecting | ServerState::Draining => {
                    return Err(PmlError::ServerNotReady {
                        server_id: self.id.to_string(),
                        state: state.as_str().to_string(),
                    })
                }
                ServerState::Disconnected | ServerState::Closed => *state = ServerState::Connecting,
            }
            *self.conn_cancel.lock() = CancellationToken::new();
        }

        let (frame_tx, frame_rx) = mpsc::channel::<String>(FRAME_CHANNEL_CAPACITY);
        *self.frame_tx.lock() = Some(frame_tx.clone());

        match &self.config.transport {
            TransportConfig::Stdio { .. } => {
                let (child, stdin, stdout, stderr) =
                    match spawn_stdio(&self.id, &self.config.transport).await {
                        Ok(parts) => parts,
                        Err(e) => {
                            self.set_state(ServerState::Closed);
                            return Err(e);
                        }
                    };

                *self.process.lock() = Some(child);
                *self.link.lock().await = Some(WriteLink::Stdio(StdioLink::new(stdin)));

                self.spawn_stdout_pump(stdout, frame_tx);
                self.spawn_stderr_tee(stderr);
            }
            TransportConfig::HttpStream { url, headers } => {
                let http = match HttpStreamLink::new(url.clone(), headers.clone()) {
                    Ok(l) => l,
                    Err(e) => {
                        self.set_state(ServerState::Closed);
                        return Err(e);
                    }
                };
                *self.link.lock().await = Some(WriteLink::Http(http));
            }
        }

        self.spawn_reader(frame_rx);

        if let Err(e) = self.initialize().await {
            self.close().await;
            return Err(PmlError::ConnectionFailed {
                server_id: self.id.to_string(),
                reason: e.to_string(),
            });
        }

        self.set_state(ServerState::Ready);
        info!(server = %self.id, "tool server ready");
        Ok(())
    }

    /// Connect over caller-supplied IO instead of a spawned child.
    ///
    /// Used when the server is already attached to a socket or, in tests,
    /// one half of `tokio::io::duplex`. Runs the same reader task and
    /// initialize handshake as `connect`.
    pub async fn connect_io(
        self: &Arc<Self>,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ServerState::Ready => return Ok(()),
                ServerState::Disconnected | ServerState::Closed => *state = ServerState::Connecting,
                other => {
                    return Err(PmlError::ServerNotReady {
                        server_id: self.id.to_string(),
                        state: other.as_str().to_string(),
                    })
                }
            }
            *self.conn_cancel.lock() = CancellationToken::new();
        }

        let (frame_tx, frame_rx) = mpsc::channel::<String>(FRAME_CHANNEL_CAPACITY);
        *self.frame_tx.lock() = Some(frame_tx.clone());
        *self.link.lock().await = Some(WriteLink::Stdio(StdioLink::new(writer)));

        self.spawn_stdout_pump(reader, frame_tx);
        self.spawn_reader(frame_rx);

        if let Err(e) = self.initialize().await {
            self.close().await;
            return Err(PmlError::ConnectionFailed {
                server_id: self.id.to_string(),
                reason: e.to_string(),
            });
        }

        self.set_state(ServerState::Ready);
        Ok(())
    }

    /// Pump transport lines into the frame channel; EOF or I/O error tears
    /// the connection down.
    fn spawn_stdout_pump(
        self: &Arc<Self>,
        reader: impl AsyncRead + Send + Unpin + 'static,
        frame_tx: mpsc::Sender<String>,
    ) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if frame_tx.send(line).await.is_err() {
                            break; // reader gone
                        }
                    }
                    Ok(None) => {
                        debug!(server = %server.id, "stdout EOF");
                        break;
                    }
                    Err(e) => {
                        warn!(server = %server.id, error = %e, "stdout read error");
                        break;
                    }
                }
            }
            server.on_stream_closed();
        });
    }

    /// Stderr tee: free-form text lines, logged tagged with the server id,
    /// never interpreted.
    fn spawn_stderr_tee(self: &Arc<Self>, stderr: impl AsyncRead + Send + Unpin + 'static) {
        let server_id = Arc::clone(&self.id);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(target: "pml_gateway::toolserver", server = %server_id, "{}", line);
            }
        });
    }

    /// The single reader task: dispatch every incoming frame.
    fn spawn_reader(self: &Arc<Self>, mut frame_rx: mpsc::Receiver<String>) {
        let server = Arc::clone(self);
        let cancel = self.conn_cancel.lock().clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = frame_rx.recv() => {
                        match frame {
                            Some(line) => server.dispatch_frame(&line).await,
                            None => break,
                        }
                    }
                }
            }
            server.drain_pending();
        });
    }

    /// Dispatch one decoded frame from the child.
    async fn dispatch_frame(self: &Arc<Self>, line: &str) {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(server = %self.id, error = %e, "dropping undecodable frame");
                return;
            }
        };

        match Frame::classify(value) {
            Some(Frame::Response(response)) => {
                let Some(id) = response.id_u64() else {
                    warn!(server = %self.id, "response without numeric id, dropped");
                    return;
                };
                let awaiter = self.pending.lock().remove(&id);
                match awaiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(response));
                    }
                    None => {
                        // Timed-out or cancelled call; late response is dropped
                        debug!(server = %self.id, id, "late response for unknown id, dropped");
                    }
                }
            }
            Some(Frame::Request { id, method, params }) => {
                self.relay_child_request(id, method, params);
            }
            Some(Frame::Notification { method }) => {
                debug!(server = %self.id, method = %method, "child notification");
            }
            None => {
                warn!(server = %self.id, "non-object frame, dropped");
            }
        }
    }

    /// Sampling relay: forward a child-originated request to the installed
    /// handler and write its response back to the child. Without a handler
    /// (or for any other method) the child gets `MethodNotSupported`.
    fn relay_child_request(self: &Arc<Self>, id: Value, method: String, params: Value) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let handler = server.sampling.read().clone();
            let response = match (method.as_str(), handler) {
                ("sampling/createMessage", Some(handler)) => {
                    match handler.create_message(&server.id, params).await {
                        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                        Err(e) => json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": {"code": -32603, "message": e.to_string()}
                        }),
                    }
                }
                _ => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": format!("Method not supported: {}", method)}
                }),
            };

            if let Err(e) = server.write_frame(&response.to_string()).await {
                warn!(server = %server.id, error = %e, "failed to write relay response");
            }
        });
    }

    /// Fatal I/O path: mark unhealthy and wake every awaiter.
    fn on_stream_closed(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ServerState::Ready | ServerState::Connecting) {
                *state = ServerState::Draining;
            }
        }
        self.conn_cancel.lock().cancel();
        self.drain_pending();
        self.set_state(ServerState::Closed);
    }

    /// Complete every pending awaiter with `ConnectionClosed`.
    fn drain_pending(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        if !drained.is_empty() {
            warn!(server = %self.id, count = drained.len(), "draining pending requests");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(PmlError::ConnectionClosed {
                server_id: self.id.to_string(),
            }));
        }
    }

    /// Write one whole JSON line through the write-serialisation primitive.
    async fn write_frame(&self, line: &str) -> Result<()> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or_else(|| PmlError::ServerNotReady {
            server_id: self.id.to_string(),
            state: self.state().as_str().to_string(),
        })?;

        match link {
            WriteLink::Stdio(stdio) => {
                if let Err(e) = stdio.write_line(line).await {
                    warn!(server = %self.id, error = %e, "write failed");
                    return Err(PmlError::ConnectionClosed {
                        server_id: self.id.to_string(),
                    });
                }
            }
            WriteLink::Http(http) => {
                let frame_tx = self.frame_tx.lock().clone().ok_or_else(|| {
                    PmlError::ConnectionClosed {
                        server_id: self.id.to_string(),
                    }
                })?;
                http.post_line(&self.id, line.to_string(), frame_tx);
            }
        }
        Ok(())
    }

    /// Initialize handshake:
    /// 1. Send `initialize` with protocol version and client info
    /// 2. Await the response within the (transport-dependent) timeout
    /// 3. Send `notifications/initialized`
    async fn initialize(&self) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"sampling": {}},
            "clientInfo": {"name": "pml-gateway", "version": env!("CARGO_PKG_VERSION")}
        });

        let response = self
            .raw_call("initialize", params, self.init_timeout(), None)
            .await?;

        if !response.is_success() {
            return Err(PmlError::ConnectionFailed {
                server_id: self.id.to_string(),
                reason: response
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "initialize rejected".to_string()),
            });
        }

        self.write_frame(&serde_json::to_string(&JsonRpcNotification::new(
            "notifications/initialized",
        ))?)
        .await
    }

    /// Send a request and await its response.
    ///
    /// The pending entry is registered before the write primitive is
    /// released; timeout and cancellation remove it so the late response is
    /// dropped on arrival.
    async fn raw_call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<JsonRpcResponse> {
        // Mutex mode: hold for the whole request-response cycle
        let _serial = if self.config.serial {
            Some(self.serial_lock.lock().await)
        } else {
            None
        };

        let id = self.next_id();
        let request = JsonRpcRequest::new(id, method, params);
        let line = serde_json::to_string(&request)?;
        let (tx, mut rx) = oneshot::channel();

        {
            let mut guard = self.link.lock().await;
            let link = guard.as_mut().ok_or_else(|| PmlError::ServerNotReady {
                server_id: self.id.to_string(),
                state: self.state().as_str().to_string(),
            })?;

            self.pending.lock().insert(id, tx);

            let write_result = match link {
                WriteLink::Stdio(stdio) => stdio.write_line(&line).await.map_err(|e| {
                    PmlError::ConnectionFailed {
                        server_id: self.id.to_string(),
                        reason: e.to_string(),
                    }
                }),
                WriteLink::Http(http) => {
                    match self.frame_tx.lock().clone() {
                        Some(frame_tx) => {
                            http.post_line(&self.id, line.clone(), frame_tx);
                            Ok(())
                        }
                        None => Err(PmlError::ConnectionClosed {
                            server_id: self.id.to_string(),
                        }),
                    }
                }
            };

            if let Err(e) = write_result {
                self.pending.lock().remove(&id);
                return Err(e);
            }
        } // write primitive released, pending entry already registered

        enum Outcome {
            Resp(std::result::Result<Result<JsonRpcResponse>, oneshot::error::RecvError>),
            Timeout,
            Cancelled,
        }

        let outcome = if let Some(cancel) = cancel {
            tokio::select! {
                r = &mut rx => Outcome::Resp(r),
                _ = tokio::time::sleep(timeout) => Outcome::Timeout,
                _ = cancel.cancelled() => Outcome::Cancelled,
            }
        } else {
            tokio::select! {
                r = &mut rx => Outcome::Resp(r),
                _ = tokio::time::sleep(timeout) => Outcome::Timeout,
            }
        };

        match outcome {
            Outcome::Resp(Ok(result)) => result,
            Outcome::Resp(Err(_)) => Err(PmlError::ConnectionClosed {
                server_id: self.id.to_string(),
            }),
            Outcome::Timeout => {
                self.pending.lock().remove(&id);
                Err(PmlError::ToolCallTimeout {
                    server_id: self.id.to_string(),
                    tool: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Outcome::Cancelled => {
                self.pending.lock().remove(&id);
                Err(PmlError::Cancelled {
                    server_id: self.id.to_string(),
                })
            }
        }
    }

    /// Call a tool on this server.
    ///
    /// Safe to invoke concurrently from any number of callers; requests are
    /// correlated by id, not by send order.
    ///
    /// # Errors
    ///
    /// - `ServerNotReady` outside the Ready state (fail fast when unhealthy)
    /// - `ToolCallTimeout` / `Cancelled` per the per-call bound
    /// - `ToolCallFailed` when the server returns a JSON-RPC error
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<ToolCallResult> {
        if !self.is_ready() {
            return Err(PmlError::ServerNotReady {
                server_id: self.id.to_string(),
                state: self.state().as_str().to_string(),
            });
        }

        let params = json!({"name": name, "arguments": arguments});
        let response = self
            .raw_call("tools/call", params, self.call_timeout(), cancel)
            .await?;

        if let Some(error) = response.error {
            return Err(PmlError::ToolCallFailed {
                server_id: self.id.to_string(),
                tool: name.to_string(),
                reason: error.message,
                error_code: Some(error.code),
            });
        }

        let result = response.result.ok_or_else(|| PmlError::ProtocolError {
            server_id: self.id.to_string(),
            reason: format!("empty result for tools/call '{}'", name),
        })?;

        Ok(ToolCallResult::from_rpc_result(&result))
    }

    /// List the tools this server exposes, stamped with the server's
    /// scope and approval mode.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        if !self.is_ready() {
            return Err(PmlError::ServerNotReady {
                server_id: self.id.to_string(),
                state: self.state().as_str().to_string(),
            });
        }

        let response = self
            .raw_call("tools/list", json!({}), self.call_timeout(), None)
            .await?;

        if let Some(error) = response.error {
            return Err(PmlError::ProtocolError {
                server_id: self.id.to_string(),
                reason: error.message,
            });
        }

        let result = response.result.unwrap_or(Value::Null);
        let tools = result
            .get("tools")
            .and_then(|t| t.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|item| {
                        let name = item.get("name")?.as_str()?;
                        let mut tool = ToolDescriptor::new(&self.id, name)
                            .with_scope(self.config.scope)
                            .with_approval(self.config.approval);
                        if let Some(desc) = item.get("description").and_then(|d| d.as_str()) {
                            tool = tool.with_description(desc);
                        }
                        if let Some(schema) = item.get("inputSchema") {
                            tool = tool.with_input_schema(schema.clone());
                        }
                        Some(tool)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(tools)
    }

    /// Close the connection: Draining → Closed, kill the child, drain
    /// pending awaiters.
    pub async fn close(&self) {
        self.set_state(ServerState::Draining);
        self.conn_cancel.lock().cancel();

        if let Some(mut link) = self.link.lock().await.take() {
            if let WriteLink::Stdio(ref mut stdio) = link {
                let _ = stdio.shutdown().await;
            }
        }

        let child = self.process.lock().take();
        if let Some(mut child) = child {
            let _ = child.kill().await;
        }

        self.drain_pending();
        *self.frame_tx.lock() = None;
        self.set_state(ServerState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    /// Serve the initialize handshake plus canned tools/call responses over
    /// the far end of a duplex pipe.
    async fn fake_server(
        io: tokio::io::DuplexStream,
        mut respond: impl FnMut(u64, &str, &Value) -> Option<Value> + Send + 'static,
    ) {
        let (read, mut write) = tokio::io::split(io);
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let value: Value = serde_json::from_str(&line).unwrap();
            let method = value["method"].as_str().unwrap_or_default().to_string();
            if method.starts_with("notifications/") {
                continue;
            }
            let id = value["id"].as_u64().unwrap();
            let response = if method == "initialize" {
                json!({"jsonrpc": "2.0", "id": id, "result": {"serverInfo": {"name": "fake"}}})
            } else {
                match respond(id, &method, &value["params"]) {
                    Some(r) => r,
                    None => continue,
                }
            };
            write
                .write_all(format!("{}\n", response).as_bytes())
                .await
                .unwrap();
        }
    }

    fn test_server(id: &str) -> Arc<ToolServer> {
        Arc::new(ToolServer::new(ServerConfig::stdio(id, "unused")))
    }

    #[test]
    fn new_server_starts_disconnected() {
        let server = ToolServer::new(ServerConfig::stdio("db", "echo"));
        assert_eq!(server.state(), ServerState::Disconnected);
        assert!(!server.is_ready());
    }

    #[tokio::test]
    async fn call_rejected_when_not_ready() {
        let server = test_server("db");
        let err = server
            .call_tool("query", json!({}), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PML-100");
    }

    #[tokio::test]
    async fn connect_io_performs_handshake() {
        let (local, remote) = tokio::io::duplex(4096);
        tokio::spawn(fake_server(remote, |_, _, _| None));

        let server = test_server("db");
        let (read, write) = tokio::io::split(local);
        server.connect_io(read, write).await.unwrap();

        assert_eq!(server.state(), ServerState::Ready);
    }

    #[tokio::test]
    async fn call_tool_round_trip() {
        let (local, remote) = tokio::io::duplex(4096);
        tokio::spawn(fake_server(remote, |id, method, params| {
            assert_eq!(method, "tools/call");
            let name = params["name"].as_str().unwrap().to_string();
            Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"content": [{"type": "text", "text": format!("ran {}", name)}], "isError": false}
            }))
        }));

        let server = test_server("db");
        let (read, write) = tokio::io::split(local);
        server.connect_io(read, write).await.unwrap();

        let result = server
            .call_tool("query", json!({"sql": "select 1"}), None)
            .await
            .unwrap();
        assert_eq!(result.text(), "ran query");
        assert!(server.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn server_error_maps_to_tool_call_failed() {
        let (local, remote) = tokio::io::duplex(4096);
        tokio::spawn(fake_server(remote, |id, _, _| {
            Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32000, "message": "table missing"}
            }))
        }));

        let server = test_server("db");
        let (read, write) = tokio::io::split(local);
        server.connect_io(read, write).await.unwrap();

        let err = server.call_tool("query", json!({}), None).await.unwrap_err();
        match err {
            PmlError::ToolCallFailed {
                reason, error_code, ..
            } => {
                assert_eq!(reason, "table missing");
                assert_eq!(error_code, Some(-32000));
            }
            other => panic!("expected ToolCallFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancellation_removes_pending_entry() {
        let (local, remote) = tokio::io::duplex(4096);
        // Respond to initialize only; swallow tool calls
        tokio::spawn(fake_server(remote, |_, _, _| None));

        let server = test_server("db");
        let (read, write) = tokio::io::split(local);
        server.connect_io(read, write).await.unwrap();

        let cancel = CancellationToken::new();
        let call = {
            let server = Arc::clone(&server);
            let cancel = cancel.clone();
            tokio::spawn(async move { server.call_tool("slow", json!({}), Some(&cancel)).await })
        };

        // Let the request register, then cancel
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "PML-105");
        assert!(server.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn stream_close_drains_pending_with_connection_closed() {
        let (local, remote) = tokio::io::duplex(4096);
        // Handshake then drop the connection on the first tools/call
        let handle = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(remote);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let value: Value = serde_json::from_str(&line).unwrap();
                match value["method"].as_str() {
                    Some("initialize") => {
                        let id = value["id"].as_u64().unwrap();
                        let resp = json!({"jsonrpc": "2.0", "id": id, "result": {}});
                        write
                            .write_all(format!("{}\n", resp).as_bytes())
                            .await
                            .unwrap();
                    }
                    Some("notifications/initialized") => {}
                    _ => break, // drop connection mid-call
                }
            }
        });

        let server = test_server("db");
        let (read, write) = tokio::io::split(local);
        server.connect_io(read, write).await.unwrap();

        let err = server.call_tool("query", json!({}), None).await.unwrap_err();
        assert_eq!(err.code(), "PML-102");
        assert_eq!(server.state(), ServerState::Closed);
        handle.abort();
    }

    #[tokio::test]
    async fn sampling_relay_round_trip() {
        struct Recorder;

        #[async_trait::async_trait]
        impl SamplingHandler for Recorder {
            async fn create_message(&self, server_id: &str, params: Value) -> Result<Value> {
                assert_eq!(server_id, "db");
                Ok(json!({"role": "assistant", "echo": params["prompt"]}))
            }
        }

        let (local, remote) = tokio::io::duplex(4096);

        // Child: after handshake, issue a sampling request and relay the
        // gateway's answer back as the tools/call result
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(remote);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let value: Value = serde_json::from_str(&line).unwrap();
                match value["method"].as_str() {
                    Some("initialize") => {
                        let id = value["id"].as_u64().unwrap();
                        let resp = json!({"jsonrpc": "2.0", "id": id, "result": {}});
                        write.write_all(format!("{}\n", resp).as_bytes()).await.unwrap();
                    }
                    Some("notifications/initialized") => {}
                    Some("tools/call") => {
                        let call_id = value["id"].as_u64().unwrap();
                        // Ask the parent for a sample first
                        let sampling = json!({
                            "jsonrpc": "2.0", "id": 9001,
                            "method": "sampling/createMessage",
                            "params": {"prompt": "hello"}
                        });
                        write.write_all(format!("{}\n", sampling).as_bytes()).await.unwrap();

                        // Wait for the sampling response
                        let reply = lines.next_line().await.unwrap().unwrap();
                        let reply: Value = serde_json::from_str(&reply).unwrap();
                        assert_eq!(reply["id"], 9001);
                        assert_eq!(reply["result"]["echo"], "hello");

                        let resp = json!({
                            "jsonrpc": "2.0", "id": call_id,
                            "result": {"content": [{"type": "text", "text": "sampled"}], "isError": false}
                        });
                        write.write_all(format!("{}\n", resp).as_bytes()).await.unwrap();
                    }
                    _ => {}
                }
            }
        });

        let server = test_server("db");
        server.set_sampling_handler(Arc::new(Recorder));
        let (read, write) = tokio::io::split(local);
        server.connect_io(read, write).await.unwrap();

        let result = server.call_tool("ask", json!({}), None).await.unwrap();
        assert_eq!(result.text(), "sampled");
    }

    #[tokio::test]
    async fn sampling_without_handler_gets_method_not_supported() {
        let (local, remote) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(remote);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let value: Value = serde_json::from_str(&line).unwrap();
                match value["method"].as_str() {
                    Some("initialize") => {
                        let id = value["id"].as_u64().unwrap();
                        let resp = json!({"jsonrpc": "2.0", "id": id, "result": {}});
                        write.write_all(format!("{}\n", resp).as_bytes()).await.unwrap();
                    }
                    Some("notifications/initialized") => {}
                    Some("tools/call") => {
                        let call_id = value["id"].as_u64().unwrap();
                        let sampling = json!({
                            "jsonrpc": "2.0", "id": 77,
                            "method": "sampling/createMessage", "params": {}
                        });
                        write.write_all(format!("{}\n", sampling).as_bytes()).await.unwrap();

                        let reply = lines.next_line().await.unwrap().unwrap();
                        let reply: Value = serde_json::from_str(&reply).unwrap();
                        assert_eq!(reply["id"], 77);
                        assert_eq!(reply["error"]["code"], -32601);

                        let resp = json!({
                            "jsonrpc": "2.0", "id": call_id,
                            "result": {"content": [{"type": "text", "text": "ok"}], "isError": false}
                        });
                        write.write_all(format!("{}\n", resp).as_bytes()).await.unwrap();
                    }
                    _ => {}
                }
            }
        });

        let server = test_server("db");
        let (read, write) = tokio::io::split(local);
        server.connect_io(read, write).await.unwrap();

        let result = server.call_tool("ask", json!({}), None).await.unwrap();
        assert_eq!(result.text(), "ok");
    }
}
