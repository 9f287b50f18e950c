//! Workflow State - ephemeral, TTL one hour
//!
//! One [`WorkflowState`] per workflow id, held behind a single-writer async
//! mutex in the [`WorkflowStore`]: the dispatcher routes every command for a
//! given id through its handle, so there is exactly one writer at a time.
//! The TTL is refreshed on each command; expired entries surface
//! `WorkflowNotFound`.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::dag::{PhysicalDag, PhysicalTask};
use crate::error::{PmlError, Result};
use crate::util::WORKFLOW_TTL;

/// Task execution status
#[derive(Debug, Clone)]
pub enum TaskStatus {
    Success,
    Failed(String),
}

/// Task execution result
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Output as JSON Value (Arc for O(1) cloning of large structures)
    pub output: Arc<Value>,
    pub duration: Duration,
    pub status: TaskStatus,
}

impl TaskResult {
    pub fn success(output: impl Into<Value>, duration: Duration) -> Self {
        Self {
            output: Arc::new(output.into()),
            duration,
            status: TaskStatus::Success,
        }
    }

    pub fn failed(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            output: Arc::new(Value::Null),
            duration,
            status: TaskStatus::Failed(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, TaskStatus::Success)
    }

    pub fn error(&self) -> Option<&str> {
        match &self.status {
            TaskStatus::Failed(e) => Some(e),
            TaskStatus::Success => None,
        }
    }

    /// Output as string (zero-copy for string values)
    pub fn output_str(&self) -> Cow<'_, str> {
        match &*self.output {
            Value::String(s) => Cow::Borrowed(s),
            other => Cow::Owned(other.to_string()),
        }
    }
}

/// Where a workflow is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowStatus {
    Running,
    /// Waiting at an approval gate
    Paused,
    Completed,
    Failed,
    Aborted,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Aborted => "aborted",
        }
    }
}

/// An open approval gate.
#[derive(Debug, Clone)]
pub struct PendingHil {
    pub checkpoint_id: Arc<str>,
    /// Tasks held at the gate
    pub tasks: Vec<Arc<str>>,
    /// Layer the gate protects; cleared once approved
    pub layer_index: usize,
}

/// Per-workflow mutable state.
#[derive(Debug)]
pub struct WorkflowState {
    pub workflow_id: Arc<str>,
    pub intent: String,
    /// Source code the workflow was built from; becomes the capability
    /// template on completion
    pub code_template: String,
    pub dag: PhysicalDag,
    pub layers: Vec<Vec<Arc<str>>>,
    /// Number of fully-completed layers
    pub layer_index: usize,
    pub completed: FxHashMap<Arc<str>, TaskResult>,
    /// binding name → producing task id
    pub exports: FxHashMap<String, Arc<str>>,
    pub status: WorkflowStatus,
    pub pending_hil: Option<PendingHil>,
    /// Layer already approved through the gate (runs without re-gating)
    pub approved_layer: Option<usize>,
    /// Auto mode: skip HIL gates entirely
    pub auto: bool,
    /// Force a gate on every layer (per-layer validation)
    pub gate_every_layer: bool,
    pub started_at: Instant,
    /// Replan generation counter, used to namespace replacement task ids
    pub generation: usize,
}

impl WorkflowState {
    pub fn new(workflow_id: Arc<str>, intent: String, dag: PhysicalDag) -> Result<Self> {
        Self::with_code(workflow_id, intent, String::new(), dag)
    }

    pub fn with_code(
        workflow_id: Arc<str>,
        intent: String,
        code_template: String,
        dag: PhysicalDag,
    ) -> Result<Self> {
        let layers = dag.layers()?;
        let mut exports = FxHashMap::default();
        for task in &dag.tasks {
            for name in &task.exports {
                exports.insert(name.clone(), Arc::clone(&task.id));
            }
        }
        Ok(Self {
            workflow_id,
            intent,
            code_template,
            dag,
            layers,
            layer_index: 0,
            completed: FxHashMap::default(),
            exports,
            status: WorkflowStatus::Running,
            pending_hil: None,
            approved_layer: None,
            auto: false,
            gate_every_layer: false,
            started_at: Instant::now(),
            generation: 0,
        })
    }

    pub fn task(&self, id: &str) -> Option<&PhysicalTask> {
        self.dag.task(id)
    }

    /// Replace the remaining layers with a freshly-built DAG. Completed
    /// results stay in place as pre-existing bindings; replacement task ids
    /// are namespaced by generation so they never collide.
    pub fn apply_replan(&mut self, mut new_dag: PhysicalDag) -> Result<(usize, usize)> {
        self.generation += 1;
        let prefix = format!("g{}_", self.generation);

        for task in &mut new_dag.tasks {
            task.id = Arc::from(format!("{}{}", prefix, task.id));
            for dep in task.deps.iter_mut() {
                *dep = Arc::from(format!("{}{}", prefix, dep));
            }
        }
        let mut l2p = FxHashMap::default();
        for (node, task_id) in new_dag.logical_to_physical.drain() {
            l2p.insert(node, Arc::from(format!("{}{}", prefix, task_id)));
        }
        new_dag.logical_to_physical = l2p;
        let mut p2l = FxHashMap::default();
        for (task_id, nodes) in new_dag.physical_to_logical.drain() {
            p2l.insert(
                Arc::<str>::from(format!("{}{}", prefix, task_id)),
                nodes,
            );
        }
        new_dag.physical_to_logical = p2l;

        let added = new_dag.tasks.len();
        let layers = new_dag.layers()?;
        let layer_count = layers.len();

        for task in &new_dag.tasks {
            for name in &task.exports {
                self.exports.insert(name.clone(), Arc::clone(&task.id));
            }
        }

        self.dag = new_dag;
        self.layers = layers;
        self.layer_index = 0;
        self.pending_hil = None;
        self.approved_layer = None;
        // Resumes on the next Continue command
        self.status = WorkflowStatus::Paused;

        Ok((added, layer_count))
    }
}

/// Handle to one workflow: single-writer state plus the abort signal.
#[derive(Debug)]
pub struct WorkflowHandle {
    pub state: tokio::sync::Mutex<WorkflowState>,
    pub cancel: CancellationToken,
    expires_at: Mutex<Instant>,
}

impl WorkflowHandle {
    fn new(state: WorkflowState, ttl: Duration) -> Self {
        Self {
            state: tokio::sync::Mutex::new(state),
            cancel: CancellationToken::new(),
            expires_at: Mutex::new(Instant::now() + ttl),
        }
    }

    fn touch(&self, ttl: Duration) {
        *self.expires_at.lock() = Instant::now() + ttl;
    }

    fn is_expired(&self) -> bool {
        *self.expires_at.lock() < Instant::now()
    }
}

/// Workflow state store with lazy TTL expiry.
pub struct WorkflowStore {
    entries: DashMap<Arc<str>, Arc<WorkflowHandle>>,
    ttl: Duration,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::with_ttl(WORKFLOW_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn insert(&self, state: WorkflowState) -> Arc<WorkflowHandle> {
        let id = Arc::clone(&state.workflow_id);
        let handle = Arc::new(WorkflowHandle::new(state, self.ttl));
        self.entries.insert(id, Arc::clone(&handle));
        handle
    }

    /// Look up a workflow, refreshing its TTL. Expired entries are removed
    /// and surface `WorkflowNotFound`.
    pub fn get(&self, workflow_id: &str) -> Result<Arc<WorkflowHandle>> {
        if let Some(entry) = self.entries.get(workflow_id) {
            let handle = Arc::clone(entry.value());
            drop(entry);
            if handle.is_expired() {
                self.entries.remove(workflow_id);
                return Err(PmlError::WorkflowNotFound {
                    workflow_id: workflow_id.to_string(),
                });
            }
            handle.touch(self.ttl);
            return Ok(handle);
        }
        Err(PmlError::WorkflowNotFound {
            workflow_id: workflow_id.to_string(),
        })
    }

    pub fn remove(&self, workflow_id: &str) {
        self.entries.remove(workflow_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for WorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{SandboxConfig, TaskKind, TaskMetadata};
    use serde_json::json;

    fn tiny_dag() -> PhysicalDag {
        PhysicalDag {
            tasks: vec![PhysicalTask {
                id: Arc::from("task_0"),
                kind: TaskKind::CodeExec,
                tool: Arc::from("code:map"),
                code: Some("return 1;".to_string()),
                args: None,
                deps: Default::default(),
                exports: vec!["d".to_string()],
                imports: vec![],
                metadata: TaskMetadata {
                    pure: true,
                    ..Default::default()
                },
                sandbox: SandboxConfig::minimal(),
            }],
            ..Default::default()
        }
    }

    fn state(id: &str) -> WorkflowState {
        WorkflowState::new(Arc::from(id), "test intent".to_string(), tiny_dag()).unwrap()
    }

    #[test]
    fn exports_indexed_on_creation() {
        let state = state("wf-1");
        assert_eq!(&**state.exports.get("d").unwrap(), "task_0");
        assert_eq!(state.layers.len(), 1);
    }

    #[tokio::test]
    async fn store_get_refreshes_ttl() {
        let store = WorkflowStore::with_ttl(Duration::from_millis(200));
        store.insert(state("wf-1"));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.get("wf-1").is_ok());

        // Refreshed above, so still alive past the original deadline
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.get("wf-1").is_ok());
    }

    #[tokio::test]
    async fn expired_workflow_is_not_found() {
        let store = WorkflowStore::with_ttl(Duration::from_millis(20));
        store.insert(state("wf-1"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        let err = store.get("wf-1").unwrap_err();
        assert_eq!(err.code(), "PML-030");
        assert!(store.is_empty());
    }

    #[test]
    fn unknown_workflow_is_not_found() {
        let store = WorkflowStore::new();
        assert_eq!(store.get("ghost").unwrap_err().code(), "PML-030");
    }

    #[test]
    fn replan_namespaces_new_task_ids() {
        let mut st = state("wf-1");
        st.completed.insert(
            Arc::from("task_0"),
            TaskResult::success(json!([1, 2]), Duration::from_millis(5)),
        );
        st.status = WorkflowStatus::Paused;

        let (added, layer_count) = st.apply_replan(tiny_dag()).unwrap();
        assert_eq!(added, 1);
        assert_eq!(layer_count, 1);
        assert_eq!(st.layer_index, 0);
        assert_eq!(st.status, WorkflowStatus::Paused);

        // Old result kept for audit, new task id namespaced
        assert!(st.completed.contains_key("task_0"));
        assert_eq!(&*st.dag.tasks[0].id, "g1_task_0");
        assert_eq!(&**st.exports.get("d").unwrap(), "g1_task_0");
    }

    #[test]
    fn task_result_accessors() {
        let ok = TaskResult::success(json!({"n": 1}), Duration::from_millis(3));
        assert!(ok.is_success());
        assert!(ok.error().is_none());

        let bad = TaskResult::failed("boom", Duration::from_millis(1));
        assert!(!bad.is_success());
        assert_eq!(bad.error(), Some("boom"));
        assert_eq!(bad.output_str(), "null");
    }
}
