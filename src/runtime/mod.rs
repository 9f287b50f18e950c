//! Runtime - layered DAG execution
//!
//! - [`sandbox`]: static purity check and the code-runner boundary
//! - [`state`]: ephemeral workflow state with a 1 h TTL store
//! - [`executor`]: the per-layer scheduler (HIL gates, fan-out, abort, replan)
//! - [`trace`]: logical-view executed-path production

pub mod executor;
pub mod sandbox;
pub mod state;
pub mod trace;

pub use executor::{CapabilityResolver, ExecOutcome, WorkflowExecutor};
pub use sandbox::{check_pure, CodeRunner, MockRunner, ProcessRunner};
pub use state::{PendingHil, TaskResult, TaskStatus, WorkflowState, WorkflowStatus, WorkflowStore};
pub use trace::{build_trace, ExecutionTrace, TraceEntry};
