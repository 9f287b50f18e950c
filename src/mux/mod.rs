//! Tool-Server Multiplexer
//!
//! Owns the lifecycle of every child tool server and provides a safe,
//! concurrently-callable `call_tool` operation. One connection per server;
//! concurrent JSON-RPC requests are correlated by id through a
//! pending-request table, stderr is teed to the gateway log, and
//! child-originated sampling requests are relayed to an installed handler.
//!
//! Key types:
//! - [`ToolServer`]: a single connection (state machine, reader task, pending table)
//! - [`Multiplexer`]: the fleet - serverId → connection, plus the [`ToolIndex`]
//! - [`ServerConfig`] / [`ToolDescriptor`]: configuration and discovery types

mod pool;
mod server;
mod transport;
mod types;

pub use pool::{Multiplexer, ToolIndex};
pub use server::{ServerState, ToolServer};
pub use transport::{spawn_stdio, HttpStreamLink, StdioLink};
pub use types::{
    ApprovalMode, ContentBlock, SamplingHandler, Scope, ServerConfig, ToolCallResult,
    ToolDescriptor, TransportConfig,
};
