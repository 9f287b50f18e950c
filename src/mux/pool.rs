//! Multiplexer - the tool-server fleet and the tool index
//!
//! One [`ToolServer`] per configured server; `call_tool` routes by server id
//! and may be invoked concurrently from any number of callers. Discovery
//! aggregates every server's `tools/list` into a [`ToolIndex`] keyed
//! `"<server>:<tool>"` - the explicit tool table that replaces the original's
//! dynamic proxy objects.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{PmlError, Result};
use crate::mux::server::ToolServer;
use crate::mux::types::{SamplingHandler, ServerConfig, ToolCallResult, ToolDescriptor};

/// Explicit tool table indexed by `"<server>:<tool>"`. Immutable entries;
/// refreshed wholesale by discovery.
#[derive(Default)]
pub struct ToolIndex {
    tools: DashMap<Arc<str>, ToolDescriptor>,
}

impl ToolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, descriptor: ToolDescriptor) {
        self.tools
            .insert(Arc::clone(&descriptor.full_id), descriptor);
    }

    pub fn get(&self, full_id: &str) -> Option<ToolDescriptor> {
        self.tools.get(full_id).map(|d| d.value().clone())
    }

    pub fn contains(&self, full_id: &str) -> bool {
        self.tools.contains_key(full_id)
    }

    pub fn all(&self) -> Vec<ToolDescriptor> {
        self.tools.iter().map(|d| d.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolIndex")
            .field("len", &self.len())
            .finish()
    }
}

/// The tool-server fleet.
pub struct Multiplexer {
    servers: DashMap<String, Arc<ToolServer>>,
    index: Arc<ToolIndex>,
}

impl Multiplexer {
    pub fn new(configs: Vec<ServerConfig>) -> Self {
        let servers = DashMap::new();
        for config in configs {
            let id = config.id.clone();
            servers.insert(id, Arc::new(ToolServer::new(config)));
        }
        Self {
            servers,
            index: Arc::new(ToolIndex::new()),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Register a pre-built server (tests wire duplex-connected servers in
    /// through this).
    pub fn add_server(&self, server: Arc<ToolServer>) {
        self.servers.insert(server.id().to_string(), server);
    }

    pub fn server(&self, server_id: &str) -> Result<Arc<ToolServer>> {
        self.servers
            .get(server_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| PmlError::UnknownServer {
                server_id: server_id.to_string(),
            })
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.key().clone()).collect()
    }

    pub fn index(&self) -> &Arc<ToolIndex> {
        &self.index
    }

    /// Install a sampling relay handler on every server.
    pub fn set_sampling_handler(&self, handler: Arc<dyn SamplingHandler>) {
        for server in self.servers.iter() {
            server.value().set_sampling_handler(Arc::clone(&handler));
        }
    }

    /// Connect every configured server. Failures are logged and skipped;
    /// the failed server stays Closed and calls to it fail fast.
    pub async fn connect_all(&self) {
        for entry in self.servers.iter() {
            let server = Arc::clone(entry.value());
            if server.is_ready() {
                continue;
            }
            if let Err(e) = server.connect().await {
                warn!(server = %entry.key(), error = %e, "tool server failed to connect");
            }
        }
    }

    /// Refresh the tool index from every ready server's `tools/list`.
    pub async fn discover(&self) -> Result<usize> {
        let mut count = 0;
        for entry in self.servers.iter() {
            let server = Arc::clone(entry.value());
            if !server.is_ready() {
                continue;
            }
            match server.list_tools().await {
                Ok(tools) => {
                    count += tools.len();
                    for tool in tools {
                        self.index.insert(tool);
                    }
                }
                Err(e) => {
                    warn!(server = %entry.key(), error = %e, "tools/list failed");
                }
            }
        }
        info!(tools = count, "tool discovery complete");
        Ok(count)
    }

    /// Call `name` on `server_id`. Concurrent calls multiplex over the same
    /// connection and are correlated by request id.
    pub async fn call_tool(
        &self,
        server_id: &str,
        name: &str,
        arguments: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<ToolCallResult> {
        let server = self.server(server_id)?;
        server.call_tool(name, arguments, cancel).await
    }

    /// Call a tool by its fully-qualified `"<server>:<tool>"` id.
    pub async fn call_full(
        &self,
        full_id: &str,
        arguments: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<ToolCallResult> {
        let (server_id, name) = full_id.split_once(':').ok_or_else(|| PmlError::UnknownTool {
            tool: full_id.to_string(),
        })?;
        self.call_tool(server_id, name, arguments, cancel).await
    }

    /// Close every connection.
    pub async fn shutdown(&self) {
        for entry in self.servers.iter() {
            entry.value().close().await;
        }
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("servers", &self.servers.len())
            .field("tools", &self.index.len())
            .finish()
    }
}
