//! Gateway Error Types with Error Codes
//!
//! Error code ranges:
//! - PML-000-009: Dispatch/request errors
//! - PML-010-019: Build errors (parse, DAG shape)
//! - PML-020-029: DAG validation errors
//! - PML-030-039: Workflow/executor errors
//! - PML-040-049: Approval/replan errors
//! - PML-050-059: Sandbox errors
//! - PML-060-069: Registry errors
//! - PML-100-119: Tool-server (multiplexer) errors
//! - PML-120-129: Config errors
//!
//! Every variant also maps onto the JSON-RPC wire code table via
//! [`PmlError::rpc_code`] so the dispatcher can shape errors without
//! inspecting variants at the call site.

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PmlError>;

/// JSON-RPC error codes used on the wire.
pub mod rpc_code {
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const TOOL_EXECUTION_FAILED: i64 = -32000;
    pub const APPROVAL_DENIED: i64 = -32001;
    pub const UNKNOWN_TOOL: i64 = -32002;
    pub const WORKFLOW_NOT_FOUND: i64 = -32003;
    pub const TIMEOUT: i64 = -32004;
}

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// All error variants are part of the public API.
///
/// Implements both `thiserror::Error` for std error compatibility
/// and `miette::Diagnostic` for fancy terminal error display.
#[derive(Error, Debug, Diagnostic)]
#[diagnostic(url(docsrs))]
pub enum PmlError {
    // ═══════════════════════════════════════════
    // DISPATCH ERRORS (000-009)
    // ═══════════════════════════════════════════
    #[error("[PML-001] Invalid request: {reason}")]
    #[diagnostic(code(pml::invalid_request))]
    InvalidRequest { reason: String },

    #[error("[PML-002] Method not found: {method}")]
    #[diagnostic(code(pml::method_not_found))]
    MethodNotFound { method: String },

    #[error("[PML-003] Invalid params for '{method}': {reason}")]
    #[diagnostic(
        code(pml::invalid_params),
        help("Check required fields against the method table")
    )]
    InvalidParams { method: String, reason: String },

    #[error("[PML-004] Internal error: {reason}")]
    #[diagnostic(code(pml::internal))]
    Internal { reason: String },

    // ═══════════════════════════════════════════
    // BUILD ERRORS (010-019)
    // ═══════════════════════════════════════════
    #[error("[PML-010] Failed to parse code: {details}")]
    #[diagnostic(
        code(pml::parse_error),
        help("The scanner only recognises the documented operation set")
    )]
    ParseError { details: String },

    #[error("[PML-011] Invalid DAG: {reason}")]
    #[diagnostic(code(pml::invalid_dag))]
    InvalidDag { reason: String },

    #[error("[PML-012] Cycle detected in DAG: {cycle}")]
    CycleDetected { cycle: String },

    #[error("[PML-013] Forbidden pattern in pure operation: {pattern}")]
    #[diagnostic(
        code(pml::forbidden_pattern),
        help("Pure operations may not use eval, dynamic import, fetch, timers or host APIs")
    )]
    ForbiddenPattern { pattern: String },

    // ═══════════════════════════════════════════
    // DAG VALIDATION (020-029)
    // ═══════════════════════════════════════════
    #[error("[PML-020] Unknown tool '{tool}'")]
    #[diagnostic(
        code(pml::unknown_tool),
        help("Check the tool id against pml:discover output")
    )]
    UnknownTool { tool: String },

    #[error("[PML-021] Missing dependency: task '{task_id}' depends on unknown '{dep_id}'")]
    MissingDependency { task_id: String, dep_id: String },

    // ═══════════════════════════════════════════
    // WORKFLOW/EXECUTOR ERRORS (030-039)
    // ═══════════════════════════════════════════
    #[error("[PML-030] Workflow '{workflow_id}' not found or expired")]
    #[diagnostic(
        code(pml::workflow_not_found),
        help("Workflow state expires one hour after the last command")
    )]
    WorkflowNotFound { workflow_id: String },

    #[error("[PML-031] Task '{task_id}' failed: {reason}")]
    TaskFailed { task_id: String, reason: String },

    #[error("[PML-032] Workflow '{workflow_id}' aborted: {reason}")]
    Aborted { workflow_id: String, reason: String },

    #[error("[PML-033] Operation '{operation}' timed out after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    #[error("[PML-034] Workflow '{workflow_id}' is not paused (state: {state})")]
    NotPaused { workflow_id: String, state: String },

    // ═══════════════════════════════════════════
    // APPROVAL/REPLAN ERRORS (040-049)
    // ═══════════════════════════════════════════
    #[error("[PML-040] Approval denied for checkpoint '{checkpoint_id}'")]
    ApprovalDenied { checkpoint_id: String },

    #[error("[PML-041] Replan rejected: {reason}")]
    #[diagnostic(
        code(pml::replan_rejected),
        help("Replan is only accepted while the workflow is paused between layers")
    )]
    ReplanRejected { reason: String },

    // ═══════════════════════════════════════════
    // SANDBOX ERRORS (050-059)
    // ═══════════════════════════════════════════
    #[error("[PML-050] Sandbox execution failed: {reason}")]
    SandboxError { reason: String },

    #[error("[PML-051] Sandbox runner not configured")]
    #[diagnostic(
        code(pml::sandbox_not_configured),
        help("Set [sandbox] runner in the gateway config")
    )]
    SandboxNotConfigured,

    // ═══════════════════════════════════════════
    // REGISTRY ERRORS (060-069)
    // ═══════════════════════════════════════════
    #[error("[PML-060] Capability '{id}' not found")]
    CapabilityNotFound { id: String },

    #[error("[PML-061] Registry error: {reason}")]
    RegistryError { reason: String },

    // ═══════════════════════════════════════════
    // TOOL-SERVER ERRORS (100-119)
    // ═══════════════════════════════════════════
    #[error("[PML-100] Tool server '{server_id}' is not ready (state: {state})")]
    #[diagnostic(
        code(pml::server_not_ready),
        help("Calls are only accepted in the Ready state; reconnect the server")
    )]
    ServerNotReady { server_id: String, state: String },

    #[error("[PML-101] Tool server '{server_id}' failed to connect: {reason}")]
    ConnectionFailed { server_id: String, reason: String },

    #[error("[PML-102] Tool server '{server_id}' connection closed")]
    ConnectionClosed { server_id: String },

    #[error("[PML-103] Tool call '{tool}' on '{server_id}' failed: {reason}")]
    ToolCallFailed {
        server_id: String,
        tool: String,
        reason: String,
        /// JSON-RPC error code returned by the child, if any
        error_code: Option<i64>,
    },

    #[error("[PML-104] Tool call '{tool}' on '{server_id}' timed out after {timeout_ms}ms")]
    ToolCallTimeout {
        server_id: String,
        tool: String,
        timeout_ms: u64,
    },

    #[error("[PML-105] Tool call cancelled on '{server_id}'")]
    Cancelled { server_id: String },

    #[error("[PML-106] Protocol error from '{server_id}': {reason}")]
    ProtocolError { server_id: String, reason: String },

    #[error("[PML-107] Sampling not supported: no handler installed for '{server_id}'")]
    SamplingNotSupported { server_id: String },

    #[error("[PML-108] Unknown tool server '{server_id}'")]
    UnknownServer { server_id: String },

    // ═══════════════════════════════════════════
    // CONFIG ERRORS (120-129)
    // ═══════════════════════════════════════════
    #[error("[PML-120] Config error: {reason}")]
    ConfigError { reason: String },

    #[error("[PML-121] IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("[PML-122] JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl PmlError {
    /// Get the error code (e.g., "PML-010")
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "PML-001",
            Self::MethodNotFound { .. } => "PML-002",
            Self::InvalidParams { .. } => "PML-003",
            Self::Internal { .. } => "PML-004",
            Self::ParseError { .. } => "PML-010",
            Self::InvalidDag { .. } => "PML-011",
            Self::CycleDetected { .. } => "PML-012",
            Self::ForbiddenPattern { .. } => "PML-013",
            Self::UnknownTool { .. } => "PML-020",
            Self::MissingDependency { .. } => "PML-021",
            Self::WorkflowNotFound { .. } => "PML-030",
            Self::TaskFailed { .. } => "PML-031",
            Self::Aborted { .. } => "PML-032",
            Self::Timeout { .. } => "PML-033",
            Self::NotPaused { .. } => "PML-034",
            Self::ApprovalDenied { .. } => "PML-040",
            Self::ReplanRejected { .. } => "PML-041",
            Self::SandboxError { .. } => "PML-050",
            Self::SandboxNotConfigured => "PML-051",
            Self::CapabilityNotFound { .. } => "PML-060",
            Self::RegistryError { .. } => "PML-061",
            Self::ServerNotReady { .. } => "PML-100",
            Self::ConnectionFailed { .. } => "PML-101",
            Self::ConnectionClosed { .. } => "PML-102",
            Self::ToolCallFailed { .. } => "PML-103",
            Self::ToolCallTimeout { .. } => "PML-104",
            Self::Cancelled { .. } => "PML-105",
            Self::ProtocolError { .. } => "PML-106",
            Self::SamplingNotSupported { .. } => "PML-107",
            Self::UnknownServer { .. } => "PML-108",
            Self::ConfigError { .. } => "PML-120",
            Self::IoError(_) => "PML-121",
            Self::JsonError(_) => "PML-122",
        }
    }

    /// JSON-RPC wire code for this error.
    pub fn rpc_code(&self) -> i64 {
        use rpc_code::*;
        match self {
            Self::InvalidRequest { .. } => INVALID_REQUEST,
            Self::MethodNotFound { .. } => METHOD_NOT_FOUND,
            Self::InvalidParams { .. }
            | Self::ParseError { .. }
            | Self::InvalidDag { .. }
            | Self::CycleDetected { .. }
            | Self::ForbiddenPattern { .. }
            | Self::MissingDependency { .. }
            | Self::ReplanRejected { .. }
            | Self::NotPaused { .. } => INVALID_PARAMS,
            Self::UnknownTool { .. } | Self::UnknownServer { .. } => UNKNOWN_TOOL,
            Self::WorkflowNotFound { .. } => WORKFLOW_NOT_FOUND,
            Self::Aborted { .. } | Self::ApprovalDenied { .. } | Self::Cancelled { .. } => {
                APPROVAL_DENIED
            }
            Self::Timeout { .. } | Self::ToolCallTimeout { .. } => TIMEOUT,
            Self::TaskFailed { .. }
            | Self::ToolCallFailed { .. }
            | Self::SandboxError { .. }
            | Self::ConnectionFailed { .. }
            | Self::ConnectionClosed { .. }
            | Self::ServerNotReady { .. }
            | Self::ProtocolError { .. }
            | Self::SamplingNotSupported { .. } => TOOL_EXECUTION_FAILED,
            Self::Internal { .. }
            | Self::SandboxNotConfigured
            | Self::CapabilityNotFound { .. }
            | Self::RegistryError { .. }
            | Self::ConfigError { .. }
            | Self::IoError(_)
            | Self::JsonError(_) => INTERNAL_ERROR,
        }
    }

    /// Check if error is recoverable (can be retried by an upstream caller)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::ToolCallTimeout { .. }
                | Self::ToolCallFailed { .. }
                | Self::ConnectionClosed { .. }
                | Self::ServerNotReady { .. }
                | Self::SandboxError { .. }
        )
    }
}

impl FixSuggestion for PmlError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            PmlError::InvalidRequest { .. } => Some("Check the JSON-RPC envelope: jsonrpc, id, method"),
            PmlError::MethodNotFound { .. } => {
                Some("Supported methods: pml:discover, pml:execute, pml:abort, pml:replan, tools/list, tools/call")
            }
            PmlError::InvalidParams { .. } => Some("Check required fields against the method table"),
            PmlError::ParseError { .. } => {
                Some("Only the documented operation set is recognised (mcp.*, capabilities.*, whitelisted methods, loops)")
            }
            PmlError::InvalidDag { .. } | PmlError::CycleDetected { .. } => {
                Some("Remove circular data dependencies from the code")
            }
            PmlError::ForbiddenPattern { .. } => {
                Some("Pure operations must be deterministic: no eval, import, fetch, timers or host APIs")
            }
            PmlError::UnknownTool { .. } => Some("Run pml:discover to list available tools"),
            PmlError::WorkflowNotFound { .. } => {
                Some("Workflow state expires after one hour; re-run pml:execute")
            }
            PmlError::Aborted { .. } => Some("The workflow was aborted; partial results remain for audit"),
            PmlError::ReplanRejected { .. } => {
                Some("Replan only while the workflow is paused at an approval gate")
            }
            PmlError::SandboxNotConfigured => Some("Set [sandbox] runner in the gateway config"),
            PmlError::ServerNotReady { .. } | PmlError::ConnectionFailed { .. } => {
                Some("Check the tool server command and its logs (stderr is teed to the gateway log)")
            }
            PmlError::ToolCallTimeout { .. } => {
                Some("Increase the per-server call timeout or check the server")
            }
            PmlError::ConfigError { .. } => Some("Check the gateway config TOML for syntax errors"),
            _ => None,
        }
    }
}
