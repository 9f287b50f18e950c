//! Execution Trace - the logical view of a completed workflow
//!
//! Callers see atomic operations even after fusion: the trace walks the
//! *logical* DAG in topological order and emits exactly one entry per
//! visible node. Loops contribute `loop:<type>` followed by their
//! deduplicated body tools; physical tasks carrying `fusedFrom` contribute
//! one entry per replaced logical node with the physical duration split
//! evenly.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::LogicalNode;
use crate::runtime::state::WorkflowState;

/// One logical step in the executed path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEntry {
    pub tool: Arc<str>,
    /// Estimated duration (physical duration split across fused members)
    pub duration_ms: u64,
    pub success: bool,
}

/// Per-execution record, written to the capability registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub id: String,
    pub workflow_id: Arc<str>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<String>,
    pub intent: String,
    pub executed_at: DateTime<Utc>,
    pub success: bool,
    pub duration_ms: u64,
    pub executed_path: Vec<Arc<str>>,
    pub task_results: Vec<TraceEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_trace_id: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

/// Build the logical trace for a workflow.
///
/// Hidden nodes (loop bodies, decision branches, nested operations) never
/// appear on their own: their loop or decision represents them, so the path
/// length stays bounded by the unique operations plus one entry per loop and
/// loop iteration count never introduces duplicates.
pub fn build_trace(state: &WorkflowState, success: bool, duration_ms: u64) -> ExecutionTrace {
    let mut entries: Vec<TraceEntry> = Vec::new();

    let order = state.dag.logical.topo_order().unwrap_or_else(|_| {
        state
            .dag
            .logical
            .nodes
            .iter()
            .map(LogicalNode::id)
            .collect()
    });

    for node_id in order {
        let node = state.dag.logical.node(node_id);
        if !node.is_schedulable() {
            continue;
        }

        let Some(task_id) = state.dag.logical_to_physical.get(&node_id) else {
            continue;
        };
        let result = state.completed.get(task_id);
        let physical_ms = result.map(|r| r.duration.as_millis() as u64).unwrap_or(0);
        let task_success = result.map(|r| r.is_success()).unwrap_or(false);

        match node {
            LogicalNode::Loop { body_tools, .. } => {
                let share = physical_ms / (1 + body_tools.len()) as u64;
                entries.push(TraceEntry {
                    tool: node.tool(),
                    duration_ms: share,
                    success: task_success,
                });
                for tool in body_tools {
                    entries.push(TraceEntry {
                        tool: Arc::clone(tool),
                        duration_ms: share,
                        success: task_success,
                    });
                }
            }
            _ => {
                let fused = state
                    .task(task_id)
                    .map(|t| t.metadata.fused_from.len())
                    .unwrap_or(0);
                let share = if fused > 1 {
                    physical_ms / fused as u64
                } else {
                    physical_ms
                };
                entries.push(TraceEntry {
                    tool: node.tool(),
                    duration_ms: share,
                    success: task_success,
                });
            }
        }
    }

    ExecutionTrace {
        id: format!("trace-{}", uuid::Uuid::new_v4()),
        workflow_id: Arc::clone(&state.workflow_id),
        capability_id: None,
        intent: state.intent.clone(),
        executed_at: Utc::now(),
        success,
        duration_ms,
        executed_path: entries.iter().map(|e| Arc::clone(&e.tool)).collect(),
        task_results: entries,
        parent_trace_id: None,
        priority: 0,
    }
}
