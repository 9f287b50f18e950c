//! Event Types - closed set, tagged by wire name
//!
//! The envelope carries a monotonic sequence id, a timestamp relative to bus
//! creation, and the emitting source. `EventKind` serialises with a `type`
//! tag using the dotted wire names (`tool.start`, `dag.task.completed`, …).
//!
//! Uses Arc<str> for id fields to enable zero-cost cloning across the
//! fan-out path.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Single event in the gateway stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Monotonic sequence ID (for ordering)
    pub id: u64,
    /// Time since bus start (ms)
    pub timestamp_ms: u64,
    /// Emitting component ("executor", "mux", "registry", …)
    pub source: Arc<str>,
    /// Event type and payload
    pub kind: EventKind,
}

/// All event types (closed set).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum EventKind {
    // ═══════════════════════════════════════════
    // TOOL LEVEL
    // ═══════════════════════════════════════════
    #[serde(rename = "tool.start")]
    ToolStart {
        workflow_id: Arc<str>,
        tool: Arc<str>,
        server_id: Arc<str>,
    },
    #[serde(rename = "tool.end")]
    ToolEnd {
        workflow_id: Arc<str>,
        tool: Arc<str>,
        server_id: Arc<str>,
        success: bool,
        duration_ms: u64,
    },

    // ═══════════════════════════════════════════
    // CAPABILITY LEVEL
    // ═══════════════════════════════════════════
    #[serde(rename = "capability.start")]
    CapabilityStart {
        workflow_id: Arc<str>,
        capability_id: Arc<str>,
    },
    #[serde(rename = "capability.end")]
    CapabilityEnd {
        workflow_id: Arc<str>,
        capability_id: Arc<str>,
        success: bool,
        duration_ms: u64,
    },
    /// A new capability was stored from a completed workflow
    #[serde(rename = "capability.learned")]
    CapabilityLearned {
        capability_id: Arc<str>,
        name: Arc<str>,
        tools_used: Vec<Arc<str>>,
    },
    /// An existing capability was reused (dedup hit)
    #[serde(rename = "capability.matched")]
    CapabilityMatched {
        capability_id: Arc<str>,
        name: Arc<str>,
        usage_count: u64,
    },

    // ═══════════════════════════════════════════
    // DAG / WORKFLOW LEVEL
    // ═══════════════════════════════════════════
    #[serde(rename = "dag.started")]
    DagStarted {
        workflow_id: Arc<str>,
        task_count: usize,
        layer_count: usize,
    },
    #[serde(rename = "dag.task.started")]
    DagTaskStarted {
        workflow_id: Arc<str>,
        task_id: Arc<str>,
        layer_index: usize,
    },
    #[serde(rename = "dag.task.completed")]
    DagTaskCompleted {
        workflow_id: Arc<str>,
        task_id: Arc<str>,
        layer_index: usize,
        duration_ms: u64,
    },
    #[serde(rename = "dag.task.failed")]
    DagTaskFailed {
        workflow_id: Arc<str>,
        task_id: Arc<str>,
        layer_index: usize,
        error: String,
        safe_to_fail: bool,
    },
    #[serde(rename = "dag.completed")]
    DagCompleted {
        workflow_id: Arc<str>,
        duration_ms: u64,
    },
    #[serde(rename = "dag.replanned")]
    DagReplanned {
        workflow_id: Arc<str>,
        added_tasks: usize,
        new_layer_count: usize,
    },
    #[serde(rename = "workflow.failed")]
    WorkflowFailed {
        workflow_id: Arc<str>,
        reason: String,
    },

    // ═══════════════════════════════════════════
    // SYSTEM LEVEL
    // ═══════════════════════════════════════════
    /// Capability dependency edges were flushed to the registry
    #[serde(rename = "graph.synced")]
    GraphSynced { edges: usize },
    #[serde(rename = "heartbeat")]
    Heartbeat { uptime_ms: u64 },
    #[serde(rename = "health.check")]
    HealthCheck { healthy: bool, detail: Value },
    #[serde(rename = "metrics.snapshot")]
    MetricsSnapshot { metrics: Value },
}

impl EventKind {
    /// The wire name of this event's type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ToolStart { .. } => "tool.start",
            Self::ToolEnd { .. } => "tool.end",
            Self::CapabilityStart { .. } => "capability.start",
            Self::CapabilityEnd { .. } => "capability.end",
            Self::CapabilityLearned { .. } => "capability.learned",
            Self::CapabilityMatched { .. } => "capability.matched",
            Self::DagStarted { .. } => "dag.started",
            Self::DagTaskStarted { .. } => "dag.task.started",
            Self::DagTaskCompleted { .. } => "dag.task.completed",
            Self::DagTaskFailed { .. } => "dag.task.failed",
            Self::DagCompleted { .. } => "dag.completed",
            Self::DagReplanned { .. } => "dag.replanned",
            Self::WorkflowFailed { .. } => "workflow.failed",
            Self::GraphSynced { .. } => "graph.synced",
            Self::Heartbeat { .. } => "heartbeat",
            Self::HealthCheck { .. } => "health.check",
            Self::MetricsSnapshot { .. } => "metrics.snapshot",
        }
    }

    /// Extract workflow_id if the event is workflow-scoped
    pub fn workflow_id(&self) -> Option<&str> {
        match self {
            Self::ToolStart { workflow_id, .. }
            | Self::ToolEnd { workflow_id, .. }
            | Self::CapabilityStart { workflow_id, .. }
            | Self::CapabilityEnd { workflow_id, .. }
            | Self::DagStarted { workflow_id, .. }
            | Self::DagTaskStarted { workflow_id, .. }
            | Self::DagTaskCompleted { workflow_id, .. }
            | Self::DagTaskFailed { workflow_id, .. }
            | Self::DagCompleted { workflow_id, .. }
            | Self::DagReplanned { workflow_id, .. }
            | Self::WorkflowFailed { workflow_id, .. } => Some(workflow_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_with_dotted_type_tag() {
        let kind = EventKind::DagTaskCompleted {
            workflow_id: "wf-1".into(),
            task_id: "task_0".into(),
            layer_index: 2,
            duration_ms: 150,
        };

        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "dag.task.completed");
        assert_eq!(json["task_id"], "task_0");
        assert_eq!(json["layer_index"], 2);
    }

    #[test]
    fn deserializes_from_tagged_json() {
        let json = json!({
            "type": "tool.start",
            "workflow_id": "wf-9",
            "tool": "db:query",
            "server_id": "db"
        });

        let kind: EventKind = serde_json::from_value(json).unwrap();
        assert_eq!(
            kind,
            EventKind::ToolStart {
                workflow_id: "wf-9".into(),
                tool: "db:query".into(),
                server_id: "db".into(),
            }
        );
    }

    #[test]
    fn type_name_matches_serde_tag() {
        let kinds = [
            EventKind::Heartbeat { uptime_ms: 0 },
            EventKind::GraphSynced { edges: 3 },
            EventKind::WorkflowFailed {
                workflow_id: "wf".into(),
                reason: "aborted".into(),
            },
        ];
        for kind in kinds {
            let json = serde_json::to_value(&kind).unwrap();
            assert_eq!(json["type"], kind.type_name());
        }
    }

    #[test]
    fn workflow_id_extraction() {
        let scoped = EventKind::DagStarted {
            workflow_id: "wf-7".into(),
            task_count: 3,
            layer_count: 2,
        };
        assert_eq!(scoped.workflow_id(), Some("wf-7"));

        let system = EventKind::Heartbeat { uptime_ms: 10 };
        assert_eq!(system.workflow_id(), None);
    }
}
