//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

use pml_gateway::dispatch::{Dispatcher, Gateway};
use pml_gateway::event::EventBus;
use pml_gateway::mux::{Multiplexer, ServerConfig, ToolDescriptor, ToolServer};
use pml_gateway::registry::CapabilityRegistry;
use pml_gateway::runtime::{CodeRunner, WorkflowExecutor, WorkflowStore};
use pml_gateway::SourceScanner;

/// Serve newline-delimited JSON-RPC on the far end of a duplex pipe.
///
/// `initialize` and notifications are handled automatically; every other
/// frame goes through `handler`, which returns zero or more response frames
/// to write back.
pub fn spawn_json_server(
    io: DuplexStream,
    mut handler: impl FnMut(&Value) -> Vec<Value> + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(io);
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let value: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let method = value["method"].as_str().unwrap_or("");
            let frames = if method == "initialize" {
                vec![json!({
                    "jsonrpc": "2.0",
                    "id": value["id"],
                    "result": {"serverInfo": {"name": "fake-server"}}
                })]
            } else if method.starts_with("notifications/") {
                vec![]
            } else {
                handler(&value)
            };
            for frame in frames {
                if write
                    .write_all(format!("{}\n", frame).as_bytes())
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    })
}

/// A Ready tool server backed by a duplex-connected fake.
pub async fn ready_server(
    config: ServerConfig,
    handler: impl FnMut(&Value) -> Vec<Value> + Send + 'static,
) -> Arc<ToolServer> {
    let server = Arc::new(ToolServer::new(config));
    let (local, remote) = tokio::io::duplex(65536);
    spawn_json_server(remote, handler);
    let (read, write) = tokio::io::split(local);
    server.connect_io(read, write).await.expect("handshake");
    server
}

/// A successful `tools/call` response frame echoing the request id.
pub fn tool_ok(id: &Value, text: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "content": [{"type": "text", "text": text.into()}],
            "isError": false
        }
    })
}

/// A failed `tools/call` response frame.
pub fn tool_err(id: &Value, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": -32000, "message": message.into()}
    })
}

/// Gateway wired for tests: supplied multiplexer and runner, in-memory
/// registry, fresh bus and store.
pub fn test_gateway(
    mux: Arc<Multiplexer>,
    runner: Arc<dyn CodeRunner>,
    auto_approve: bool,
) -> (Dispatcher, Arc<Gateway>) {
    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(CapabilityRegistry::in_memory(Arc::clone(&bus)));
    let executor = WorkflowExecutor::new(
        Arc::clone(&mux),
        runner,
        Arc::clone(&bus),
        Arc::clone(&registry) as _,
    );
    let gateway = Arc::new(Gateway {
        mux,
        registry,
        bus,
        store: Arc::new(WorkflowStore::new()),
        executor,
        parser: Arc::new(SourceScanner::new()),
        auto_approve,
    });
    (Dispatcher::new(Arc::clone(&gateway)), gateway)
}

/// Register a descriptor so the executor sees the tool as known.
pub fn register_tool(mux: &Multiplexer, descriptor: ToolDescriptor) {
    mux.index().insert(descriptor);
}
