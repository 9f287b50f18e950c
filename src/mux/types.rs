//! Multiplexer Types
//!
//! Core types for tool-server connections:
//! - [`ServerConfig`]: how to reach a server (stdio child or http-stream)
//! - [`ToolDescriptor`]: a discovered tool, keyed `"<server>:<tool>"`
//! - [`Scope`] / [`ApprovalMode`]: permission class and HIL gating
//! - [`ToolCallResult`] / [`ContentBlock`]: tool invocation results
//! - [`SamplingHandler`]: callback for child-originated sampling requests

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Sandbox permission class for a tool.
///
/// Governs what a task may do and whether it needs approval: anything above
/// `minimal` that is not a pure operation goes through the HIL gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    /// Pure computation, no I/O
    Minimal,
    /// Read-only access to local resources
    Readonly,
    /// Filesystem read/write
    Filesystem,
    /// Outbound network calls
    NetworkApi,
    /// Full MCP-standard surface
    #[default]
    McpStandard,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Minimal => "minimal",
            Scope::Readonly => "readonly",
            Scope::Filesystem => "filesystem",
            Scope::NetworkApi => "network-api",
            Scope::McpStandard => "mcp-standard",
        }
    }
}

/// Whether calls to a tool require a human in the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    #[default]
    Auto,
    Hil,
}

/// How to reach a tool server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum TransportConfig {
    /// Spawn a child process speaking newline-delimited JSON-RPC on stdio
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    /// POST each request to a remote endpoint, read a chunked JSON line stream back
    HttpStream {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// Tool server configuration.
///
/// # Example TOML
///
/// ```toml
/// [servers.db]
/// transport = "stdio"
/// command = "npx"
/// args = ["-y", "@example/db-server"]
/// scope = "network-api"
/// approval = "hil"
/// serial = false
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Server id (key in the servers table)
    #[serde(skip)]
    pub id: String,

    #[serde(flatten)]
    pub transport: TransportConfig,

    /// Permission class applied to every tool this server exposes
    #[serde(default)]
    pub scope: Scope,

    /// Approval mode applied to every tool this server exposes
    #[serde(default)]
    pub approval: ApprovalMode,

    /// Mutex mode: one in-flight request at a time, for servers that
    /// mis-handle interleaved responses
    #[serde(default)]
    pub serial: bool,

    /// Per-call timeout override (ms)
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,

    /// Initialize-handshake timeout override (ms); defaults to 10 s local,
    /// 30 s remote
    #[serde(default)]
    pub init_timeout_ms: Option<u64>,
}

impl ServerConfig {
    /// Create a stdio server config with the given id and command.
    pub fn stdio(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            transport: TransportConfig::Stdio {
                command: command.into(),
                args: Vec::new(),
                env: HashMap::new(),
                cwd: None,
            },
            scope: Scope::default(),
            approval: ApprovalMode::default(),
            serial: false,
            call_timeout_ms: None,
            init_timeout_ms: None,
        }
    }

    /// Create an http-stream server config.
    pub fn http_stream(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            transport: TransportConfig::HttpStream {
                url: url.into(),
                headers: HashMap::new(),
            },
            scope: Scope::default(),
            approval: ApprovalMode::default(),
            serial: false,
            call_timeout_ms: None,
            init_timeout_ms: None,
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        if let TransportConfig::Stdio { ref mut args, .. } = self.transport {
            args.push(arg.into());
        }
        self
    }

    pub fn with_args(mut self, new_args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        if let TransportConfig::Stdio { ref mut args, .. } = self.transport {
            args.extend(new_args.into_iter().map(Into::into));
        }
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportConfig::Stdio { ref mut env, .. } = self.transport {
            env.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_approval(mut self, approval: ApprovalMode) -> Self {
        self.approval = approval;
        self
    }

    pub fn serial_mode(mut self) -> Self {
        self.serial = true;
        self
    }

    /// Whether this server is remote (longer initialize timeout applies).
    pub fn is_remote(&self) -> bool {
        matches!(self.transport, TransportConfig::HttpStream { .. })
    }
}

/// A discovered tool, immutable post-load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    /// Fully-qualified id: `"<serverId>:<name>"`
    pub full_id: Arc<str>,

    /// Owning server id
    pub server_id: Arc<str>,

    /// Tool name as the server exposes it
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// JSON Schema for the tool's arguments
    #[serde(default)]
    pub input_schema: Option<Value>,

    #[serde(default)]
    pub output_schema: Option<Value>,

    /// Permission class (inherited from the server config)
    #[serde(default)]
    pub scope: Scope,

    /// Approval mode (inherited from the server config)
    #[serde(default)]
    pub approval: ApprovalMode,

    /// Description embedding for intent ranking, computed at discovery time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl ToolDescriptor {
    pub fn new(server_id: &str, name: &str) -> Self {
        Self {
            full_id: Arc::from(format!("{}:{}", server_id, name)),
            server_id: Arc::from(server_id),
            name: name.to_string(),
            description: None,
            input_schema: None,
            output_schema: None,
            scope: Scope::default(),
            approval: ApprovalMode::default(),
            embedding: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_approval(mut self, approval: ApprovalMode) -> Self {
        self.approval = approval;
        self
    }
}

/// Result from a tool call.
///
/// Contains one or more content blocks with the tool's output.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ToolCallResult {
    /// Content blocks returned by the tool
    pub content: Vec<ContentBlock>,

    /// Whether the tool call resulted in an error
    #[serde(default)]
    pub is_error: bool,
}

impl ToolCallResult {
    /// Create a successful result with the given content blocks.
    pub fn success(content: Vec<ContentBlock>) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    /// Create an error result with a text message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(message)],
            is_error: true,
        }
    }

    /// Extract all text content from the result, joined with newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The result as a JSON value: parsed text when it parses, raw text otherwise.
    pub fn to_value(&self) -> Value {
        let text = self.text();
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    }

    /// Parse from the raw `tools/call` result shape:
    /// `{ "content": [{ "type": "text", "text": "..." }], "isError": false }`
    pub fn from_rpc_result(result: &Value) -> Self {
        let content = result
            .get("content")
            .and_then(|c| c.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|item| {
                        let text = item.get("text")?.as_str()?;
                        Some(ContentBlock::text(text.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let is_error = result
            .get("isError")
            .and_then(|e| e.as_bool())
            .unwrap_or(false);

        Self { content, is_error }
    }
}

/// Content block in tool results.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ContentBlock {
    /// Content type: "text", "image", or "resource"
    #[serde(rename = "type")]
    pub content_type: String,

    /// Text content (for type="text")
    #[serde(default)]
    pub text: Option<String>,

    /// Base64-encoded data (for type="image")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    /// MIME type (for type="image")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ContentBlock {
    /// Create a text content block.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: "text".to_string(),
            text: Some(text.into()),
            data: None,
            mime_type: None,
        }
    }
}

/// Handler for child-originated sampling requests.
///
/// The reader task invokes this when a child sends `sampling/createMessage`;
/// the handler is free to await an external exchange before returning the
/// response payload, which the multiplexer writes back to the child.
#[async_trait]
pub trait SamplingHandler: Send + Sync {
    async fn create_message(&self, server_id: &str, params: Value) -> Result<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scope_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_value(Scope::NetworkApi).unwrap(),
            json!("network-api")
        );
        assert_eq!(
            serde_json::to_value(Scope::McpStandard).unwrap(),
            json!("mcp-standard")
        );
    }

    #[test]
    fn descriptor_full_id_format() {
        let desc = ToolDescriptor::new("db", "query");
        assert_eq!(&*desc.full_id, "db:query");
        assert_eq!(&*desc.server_id, "db");
        assert_eq!(desc.name, "query");
    }

    #[test]
    fn server_config_builder() {
        let config = ServerConfig::stdio("db", "npx")
            .with_args(["-y", "@example/db-server"])
            .with_env("DB_URL", "postgres://localhost")
            .with_scope(Scope::NetworkApi)
            .with_approval(ApprovalMode::Hil);

        assert_eq!(config.id, "db");
        assert_eq!(config.scope, Scope::NetworkApi);
        assert_eq!(config.approval, ApprovalMode::Hil);
        assert!(!config.is_remote());
        match &config.transport {
            TransportConfig::Stdio { command, args, env, .. } => {
                assert_eq!(command, "npx");
                assert_eq!(args.len(), 2);
                assert_eq!(env.get("DB_URL").unwrap(), "postgres://localhost");
            }
            other => panic!("expected stdio transport, got {:?}", other),
        }
    }

    #[test]
    fn http_stream_is_remote() {
        let config = ServerConfig::http_stream("web", "https://tools.example.com/rpc");
        assert!(config.is_remote());
    }

    #[test]
    fn tool_result_text_joins_blocks() {
        let result = ToolCallResult::success(vec![
            ContentBlock::text("line one"),
            ContentBlock::text("line two"),
        ]);
        assert_eq!(result.text(), "line one\nline two");
        assert!(!result.is_error);
    }

    #[test]
    fn tool_result_from_rpc_shape() {
        let raw = json!({
            "content": [{"type": "text", "text": "{\"rows\": 3}"}],
            "isError": false
        });
        let result = ToolCallResult::from_rpc_result(&raw);
        assert_eq!(result.to_value(), json!({"rows": 3}));
    }

    #[test]
    fn tool_result_to_value_falls_back_to_string() {
        let result = ToolCallResult::success(vec![ContentBlock::text("not json")]);
        assert_eq!(result.to_value(), json!("not json"));
    }
}
