//! PML Gateway - orchestration runtime for tool-calling agents
//!
//! ## Module Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        DOMAIN MODEL                          │
//! │  dag/       code → logical DAG → physical DAG (fusion)       │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      APPLICATION LAYER                       │
//! │  runtime/   layered executor (HIL, abort, replan, trace)     │
//! │  dispatch/  JSON-RPC method table + stdio front door         │
//! └──────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    INFRASTRUCTURE LAYER                      │
//! │  mux/       tool-server multiplexer (stdio + http-stream)    │
//! │  registry/  content-addressed capabilities + intent search   │
//! │  event/     bounded pub/sub fan-out                          │
//! │  util/      interner, dot-path resolution, constants         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`dag`] | Operation-set scanner, dependency inference, fusion, layering |
//! | [`runtime`] | Per-layer scheduling, approval gates, cancellation, traces |
//! | [`dispatch`] | `pml:*` meta-operations, error shaping, stdio server |
//! | [`mux`] | Child tool servers: pending-table correlation, sampling relay |
//! | [`registry`] | Capability records, dedup, dependency edges, similarity |
//! | [`event`] | Typed pub/sub with bounded per-subscriber queues |
//! | [`rpc`] | JSON-RPC 2.0 wire types and frame classification |
//! | [`config`] | TOML + env configuration |
//! | [`error`] | Error codes with wire-code mapping and fix suggestions |

// ═══════════════════════════════════════════════════════════════
// DOMAIN MODEL
// ═══════════════════════════════════════════════════════════════
pub mod dag;

// ═══════════════════════════════════════════════════════════════
// APPLICATION LAYER
// ═══════════════════════════════════════════════════════════════
pub mod dispatch;
pub mod runtime;

// ═══════════════════════════════════════════════════════════════
// INFRASTRUCTURE LAYER
// ═══════════════════════════════════════════════════════════════
pub mod event;
pub mod mux;
pub mod registry;
pub mod rpc;
pub mod util;

// ═══════════════════════════════════════════════════════════════
// CROSS-CUTTING
// ═══════════════════════════════════════════════════════════════
pub mod config;
pub mod error;

// ═══════════════════════════════════════════════════════════════
// PUBLIC API RE-EXPORTS
// ═══════════════════════════════════════════════════════════════

pub use config::GatewayConfig;
pub use error::{FixSuggestion, PmlError, Result};

pub use dag::{
    build_logical, fuse, CodeParser, LogicalDag, LogicalNode, PhysicalDag, PhysicalTask,
    SourceScanner,
};
pub use dispatch::{serve_stdio, Dispatcher, Gateway};
pub use event::{Event, EventBus, EventFilter, EventKind};
pub use mux::{
    ApprovalMode, Multiplexer, SamplingHandler, Scope, ServerConfig, ToolDescriptor, ToolIndex,
    ToolServer,
};
pub use registry::{Capability, CapabilityRegistry, Embedder, Scorer};
pub use rpc::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
pub use runtime::{
    CodeRunner, ExecOutcome, ExecutionTrace, MockRunner, ProcessRunner, WorkflowExecutor,
    WorkflowState, WorkflowStore,
};
