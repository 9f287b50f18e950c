//! Physical DAG - executable tasks after fusion
//!
//! Every logical node maps to exactly one physical task (many-to-one).
//! Tasks carry the metadata the executor and trace production need:
//! which logical nodes were fused in, the fusion pattern, loop body tools,
//! and the sandbox scope that drives approval and safe-to-fail decisions.
//!
//! Layering partitions tasks by longest-path depth: within a layer tasks
//! are independent and run in parallel, layers are strictly ordered.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::dag::logical::{LogicalDag, NodeId};
use crate::error::{PmlError, Result};
use crate::mux::Scope;

/// Stack-allocated deps: most tasks have 0-4 dependencies
pub type DepVec = SmallVec<[Arc<str>; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Dispatch to the tool-server multiplexer
    McpCall,
    /// Dispatch to the code sandbox
    CodeExec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FusionPattern {
    Sequential,
    ForkJoin,
}

/// Per-task sandbox configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub scope: Scope,
}

impl SandboxConfig {
    pub fn minimal() -> Self {
        Self {
            scope: Scope::Minimal,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// All fused members are pure operations
    #[serde(default)]
    pub pure: bool,

    /// Logical nodes this task replaced (empty for 1:1 tasks)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fused_from: Vec<NodeId>,

    /// Tool ids of the logical nodes behind this task, in fusion order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logical_tools: Vec<Arc<str>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fusion_pattern: Option<FusionPattern>,

    /// Set when this task is a loop abstraction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_id: Option<NodeId>,

    /// Deduplicated tools used inside the loop body
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub body_tools: Vec<Arc<str>>,

    /// Fork-join branch count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_count: Option<usize>,
}

/// One executable task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalTask {
    pub id: Arc<str>,

    pub kind: TaskKind,

    /// `"<server>:<tool>"` for mcp calls, `"code:<op>"` / `"loop:<type>"` /
    /// `"capability:<name>"` for code execution
    pub tool: Arc<str>,

    /// Code to execute in the sandbox (code_exec only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Argument source text (mcp calls only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,

    /// Ids of tasks this task depends on
    #[serde(default)]
    pub deps: DepVec,

    /// Binding names this task's result provides to downstream tasks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exports: Vec<String>,

    /// Binding names this task needs resolved before it runs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<String>,

    pub metadata: TaskMetadata,

    pub sandbox: SandboxConfig,
}

impl PhysicalTask {
    /// Safe-to-fail: pure operations and minimal-scope tasks do not halt the
    /// workflow when they fail.
    pub fn is_safe_to_fail(&self) -> bool {
        self.metadata.pure || self.sandbox.scope == Scope::Minimal
    }
}

/// The physical DAG plus the two-way logical mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhysicalDag {
    pub tasks: Vec<PhysicalTask>,
    pub logical_to_physical: FxHashMap<NodeId, Arc<str>>,
    pub physical_to_logical: FxHashMap<Arc<str>, Vec<NodeId>>,
    pub logical: LogicalDag,
}

impl PhysicalDag {
    pub fn task(&self, id: &str) -> Option<&PhysicalTask> {
        self.tasks.iter().find(|t| &*t.id == id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Partition tasks into layers by longest-path depth.
    ///
    /// Kahn over the dependency edges; a task's depth is one more than the
    /// deepest of its dependencies. Within a layer order follows task id
    /// creation order, which tracks statement order.
    pub fn layers(&self) -> Result<Vec<Vec<Arc<str>>>> {
        let mut depth: FxHashMap<Arc<str>, usize> = FxHashMap::default();
        let mut remaining: Vec<&PhysicalTask> = self.tasks.iter().collect();
        let mut progress = true;

        while !remaining.is_empty() && progress {
            progress = false;
            let mut next_round = Vec::new();
            for task in remaining {
                let resolved: Option<usize> = task.deps.iter().try_fold(0usize, |acc, dep| {
                    depth.get(dep.as_ref()).map(|d| acc.max(d + 1))
                });
                match resolved {
                    Some(d) => {
                        depth.insert(Arc::clone(&task.id), d);
                        progress = true;
                    }
                    None => next_round.push(task),
                }
            }
            remaining = next_round;
        }

        if !remaining.is_empty() {
            return Err(PmlError::InvalidDag {
                reason: format!(
                    "unresolvable dependencies for tasks: {}",
                    remaining
                        .iter()
                        .map(|t| t.id.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            });
        }

        let max_depth = depth.values().copied().max().unwrap_or(0);
        let mut layers: Vec<Vec<Arc<str>>> = vec![Vec::new(); if self.tasks.is_empty() { 0 } else { max_depth + 1 }];
        for task in &self.tasks {
            let d = depth[&task.id];
            layers[d].push(Arc::clone(&task.id));
        }
        Ok(layers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_task(id: &str, deps: &[&str]) -> PhysicalTask {
        PhysicalTask {
            id: Arc::from(id),
            kind: TaskKind::CodeExec,
            tool: Arc::from("code:map"),
            code: Some("x.map(v=>v)".to_string()),
            args: None,
            deps: deps.iter().map(|d| Arc::from(*d)).collect(),
            exports: vec![],
            imports: vec![],
            metadata: TaskMetadata {
                pure: true,
                ..Default::default()
            },
            sandbox: SandboxConfig::minimal(),
        }
    }

    #[test]
    fn single_task_single_layer() {
        let dag = PhysicalDag {
            tasks: vec![mk_task("task_0", &[])],
            ..Default::default()
        };
        let layers = dag.layers().unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(&*layers[0][0], "task_0");
    }

    #[test]
    fn longest_path_depth_layering() {
        // task_0 → task_1 → task_3, task_0 → task_2 → task_3
        // plus task_4 depending only on task_0: depth 1
        let dag = PhysicalDag {
            tasks: vec![
                mk_task("task_0", &[]),
                mk_task("task_1", &["task_0"]),
                mk_task("task_2", &["task_0"]),
                mk_task("task_3", &["task_1", "task_2"]),
                mk_task("task_4", &["task_0"]),
            ],
            ..Default::default()
        };
        let layers = dag.layers().unwrap();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0], vec![Arc::<str>::from("task_0")]);
        assert_eq!(layers[1].len(), 3);
        assert_eq!(layers[2], vec![Arc::<str>::from("task_3")]);
    }

    #[test]
    fn missing_dep_is_invalid_dag() {
        let dag = PhysicalDag {
            tasks: vec![mk_task("task_0", &["ghost"])],
            ..Default::default()
        };
        let err = dag.layers().unwrap_err();
        assert_eq!(err.code(), "PML-011");
    }

    #[test]
    fn pure_and_minimal_are_safe_to_fail() {
        let pure = mk_task("task_0", &[]);
        assert!(pure.is_safe_to_fail());

        let mut external = mk_task("task_1", &[]);
        external.metadata.pure = false;
        external.sandbox.scope = Scope::NetworkApi;
        assert!(!external.is_safe_to_fail());

        let mut minimal_impure = mk_task("task_2", &[]);
        minimal_impure.metadata.pure = false;
        assert!(minimal_impure.is_safe_to_fail());
    }

    #[test]
    fn empty_dag_has_no_layers() {
        let dag = PhysicalDag::default();
        assert!(dag.layers().unwrap().is_empty());
    }
}
