//! Dispatcher - the JSON-RPC meta-operation surface
//!
//! Method table: `pml:discover`, `pml:execute`, `pml:abort`, `pml:replan`,
//! plus the standard `tools/list` / `tools/call` forwarded to the
//! multiplexer. `Dispatcher::dispatch` is the single entry point; the stdio
//! front door (and any out-of-scope HTTP wrapper) only frames lines around
//! it.

mod dispatcher;
mod stdio;

pub use dispatcher::{Dispatcher, Gateway};
pub use stdio::{serve_stdio, ClientSamplingRelay};
