//! DAG Executor - layered scheduling with HIL gates
//!
//! Per-layer state machine:
//!
//! 1. Compute the approval set `H`: a task needs approval when its tool is
//!    unknown, its descriptor declares `approvalMode = hil`, or its sandbox
//!    scope is not `minimal` and it is not pure. Pure `code:*` operations
//!    are always auto-approved.
//! 2. If `H` is non-empty and the workflow is not in auto mode, pause:
//!    persist the state and surface `ApprovalRequired`. Nothing in the layer
//!    starts until a `Continue(approved)` arrives.
//! 3. Run the layer's tasks in parallel (JoinSet fan-out), resolving each
//!    task's imports against the completed-tasks map, dispatching mcp calls
//!    to the multiplexer and code to the sandbox.
//! 4. Record results and emit `dag.task.*` events tagged with the layer.
//! 5. A non-safe-to-fail failure stops the workflow (`workflow.failed`);
//!    safe-to-fail failures (pure ops, minimal scope) are reported and the
//!    workflow continues.
//!
//! Abort cancels in-flight calls through the cancellation token and discards
//! the remaining layers; partial results stay in the completed map for
//! audit.

use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::dag::{PhysicalTask, TaskKind};
use crate::error::{PmlError, Result};
use crate::event::{EventBus, EventKind};
use crate::mux::{ApprovalMode, Multiplexer, Scope};
use crate::runtime::sandbox::{check_pure, run_with_cancel, CodeRunner};
use crate::runtime::state::{PendingHil, TaskResult, WorkflowState, WorkflowStatus};
use crate::runtime::trace::{build_trace, ExecutionTrace};
use crate::util::jsonpath;

static UNQUOTED_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([{,]\s*)([A-Za-z_$][A-Za-z0-9_$]*)\s*:").expect("valid regex"));

/// Resolver for `capabilities.<name>(...)` tasks: name → code template.
pub trait CapabilityResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<String>;
}

/// Resolver for gateways without a registry wired in.
pub struct NoCapabilities;

impl CapabilityResolver for NoCapabilities {
    fn resolve(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Outcome of driving a workflow until it pauses, completes, or fails.
#[derive(Debug)]
pub enum ExecOutcome {
    Completed {
        result: Value,
        trace: ExecutionTrace,
    },
    ApprovalRequired {
        checkpoint_id: Arc<str>,
        tasks: Vec<Value>,
    },
    Failed {
        reason: String,
    },
}

/// The layered scheduler. Cheap to clone per workflow.
#[derive(Clone)]
pub struct WorkflowExecutor {
    mux: Arc<Multiplexer>,
    runner: Arc<dyn CodeRunner>,
    bus: Arc<EventBus>,
    caps: Arc<dyn CapabilityResolver>,
}

impl WorkflowExecutor {
    pub fn new(
        mux: Arc<Multiplexer>,
        runner: Arc<dyn CodeRunner>,
        bus: Arc<EventBus>,
        caps: Arc<dyn CapabilityResolver>,
    ) -> Self {
        Self {
            mux,
            runner,
            bus,
            caps,
        }
    }

    /// Does this task go through the HIL gate?
    fn needs_approval(&self, task: &PhysicalTask) -> bool {
        if task.metadata.pure {
            return false;
        }
        match task.kind {
            TaskKind::McpCall => match self.mux.index().get(&task.tool) {
                None => true, // unknown tool
                Some(descriptor) => {
                    descriptor.approval == ApprovalMode::Hil
                        || descriptor.scope != Scope::Minimal
                }
            },
            TaskKind::CodeExec => task.sandbox.scope != Scope::Minimal,
        }
    }

    /// Drive the workflow from its current layer until it pauses, fails,
    /// aborts, or completes.
    #[instrument(skip(self, state, cancel), fields(workflow = %state.workflow_id))]
    pub async fn run(
        &self,
        state: &mut WorkflowState,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome> {
        if state.layer_index == 0 && state.completed.is_empty() {
            self.bus.publish(
                "executor",
                EventKind::DagStarted {
                    workflow_id: Arc::clone(&state.workflow_id),
                    task_count: state.dag.len(),
                    layer_count: state.layers.len(),
                },
            );
        }
        state.status = WorkflowStatus::Running;

        let layers = state.layers.clone();
        for layer_index in state.layer_index..layers.len() {
            if cancel.is_cancelled() {
                return self.abort_path(state, "aborted");
            }

            let tasks: Vec<PhysicalTask> = layers[layer_index]
                .iter()
                .filter_map(|id| state.task(id).cloned())
                .collect();

            // ── HIL gate ──
            let gate: Vec<&PhysicalTask> = if state.gate_every_layer {
                tasks.iter().collect()
            } else {
                tasks.iter().filter(|t| self.needs_approval(t)).collect()
            };

            if !gate.is_empty() && !state.auto && state.approved_layer != Some(layer_index) {
                let checkpoint_id: Arc<str> =
                    Arc::from(format!("chk-{}", uuid::Uuid::new_v4()));
                let summaries: Vec<Value> = gate
                    .iter()
                    .map(|t| {
                        json!({
                            "task_id": &*t.id,
                            "tool": &*t.tool,
                            "kind": t.kind,
                            "scope": t.sandbox.scope.as_str(),
                        })
                    })
                    .collect();

                state.status = WorkflowStatus::Paused;
                state.pending_hil = Some(PendingHil {
                    checkpoint_id: Arc::clone(&checkpoint_id),
                    tasks: gate.iter().map(|t| Arc::clone(&t.id)).collect(),
                    layer_index,
                });
                info!(layer = layer_index, held = summaries.len(), "approval required");
                return Ok(ExecOutcome::ApprovalRequired {
                    checkpoint_id,
                    tasks: summaries,
                });
            }

            // ── Parallel fan-out ──
            let mut join_set: JoinSet<(Arc<str>, TaskResult)> = JoinSet::new();
            for task in tasks {
                let bindings = self.resolve_bindings(state, &task);
                let executor = self.clone();
                let workflow_id = Arc::clone(&state.workflow_id);
                let cancel = cancel.clone();

                join_set.spawn(async move {
                    let id = Arc::clone(&task.id);
                    let result = executor
                        .execute_task(&workflow_id, &task, bindings, layer_index, &cancel)
                        .await;
                    (id, result)
                });
            }

            let mut halting_failure: Option<String> = None;
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((task_id, result)) => {
                        if let Some(error) = result.error() {
                            let safe = state
                                .task(&task_id)
                                .map(PhysicalTask::is_safe_to_fail)
                                .unwrap_or(false);
                            if !safe && halting_failure.is_none() {
                                halting_failure =
                                    Some(format!("task '{}' failed: {}", task_id, error));
                            }
                        }
                        state.completed.insert(task_id, result);
                    }
                    Err(e) => {
                        halting_failure = Some(format!("task panicked: {}", e));
                    }
                }
            }

            if cancel.is_cancelled() {
                return self.abort_path(state, "aborted");
            }

            if let Some(reason) = halting_failure {
                state.status = WorkflowStatus::Failed;
                self.bus.publish(
                    "executor",
                    EventKind::WorkflowFailed {
                        workflow_id: Arc::clone(&state.workflow_id),
                        reason: reason.clone(),
                    },
                );
                return Ok(ExecOutcome::Failed { reason });
            }

            state.layer_index = layer_index + 1;
            state.approved_layer = None;
            state.pending_hil = None;
        }

        // ── Completed ──
        state.status = WorkflowStatus::Completed;
        let duration_ms = state.started_at.elapsed().as_millis() as u64;
        let result = self.final_output(state);
        let trace = build_trace(state, true, duration_ms);

        self.bus.publish(
            "executor",
            EventKind::DagCompleted {
                workflow_id: Arc::clone(&state.workflow_id),
                duration_ms,
            },
        );

        Ok(ExecOutcome::Completed { result, trace })
    }

    /// Abort: discard remaining layers, keep partial results for audit,
    /// emit `workflow.failed` exactly once.
    fn abort_path(&self, state: &mut WorkflowState, reason: &str) -> Result<ExecOutcome> {
        state.status = WorkflowStatus::Aborted;
        self.bus.publish(
            "executor",
            EventKind::WorkflowFailed {
                workflow_id: Arc::clone(&state.workflow_id),
                reason: reason.to_string(),
            },
        );
        Err(PmlError::Aborted {
            workflow_id: state.workflow_id.to_string(),
            reason: reason.to_string(),
        })
    }

    /// Execute one task: dispatch by kind, emit task and tool events.
    async fn execute_task(
        &self,
        workflow_id: &Arc<str>,
        task: &PhysicalTask,
        bindings: Value,
        layer_index: usize,
        cancel: &CancellationToken,
    ) -> TaskResult {
        let start = Instant::now();

        self.bus.publish(
            "executor",
            EventKind::DagTaskStarted {
                workflow_id: Arc::clone(workflow_id),
                task_id: Arc::clone(&task.id),
                layer_index,
            },
        );

        let outcome = match task.kind {
            TaskKind::McpCall => self.run_mcp(workflow_id, task, &bindings, cancel).await,
            TaskKind::CodeExec => self.run_code(task, &bindings, cancel).await,
        };

        let duration = start.elapsed();
        match outcome {
            Ok(value) => {
                self.bus.publish(
                    "executor",
                    EventKind::DagTaskCompleted {
                        workflow_id: Arc::clone(workflow_id),
                        task_id: Arc::clone(&task.id),
                        layer_index,
                        duration_ms: duration.as_millis() as u64,
                    },
                );
                TaskResult::success(value, duration)
            }
            Err(e) => {
                self.bus.publish(
                    "executor",
                    EventKind::DagTaskFailed {
                        workflow_id: Arc::clone(workflow_id),
                        task_id: Arc::clone(&task.id),
                        layer_index,
                        error: e.to_string(),
                        safe_to_fail: task.is_safe_to_fail(),
                    },
                );
                TaskResult::failed(e.to_string(), duration)
            }
        }
    }

    async fn run_mcp(
        &self,
        workflow_id: &Arc<str>,
        task: &PhysicalTask,
        bindings: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        if !self.mux.index().contains(&task.tool) {
            return Err(PmlError::UnknownTool {
                tool: task.tool.to_string(),
            });
        }

        let (server_id, _) = task.tool.split_once(':').ok_or_else(|| PmlError::UnknownTool {
            tool: task.tool.to_string(),
        })?;
        let server_id: Arc<str> = Arc::from(server_id);

        let arguments = resolve_args(task.args.as_deref().unwrap_or(""), bindings);

        self.bus.publish(
            "mux",
            EventKind::ToolStart {
                workflow_id: Arc::clone(workflow_id),
                tool: Arc::clone(&task.tool),
                server_id: Arc::clone(&server_id),
            },
        );

        let start = Instant::now();
        let result = self
            .mux
            .call_full(&task.tool, arguments, Some(cancel))
            .await;

        let (success, value) = match result {
            Ok(call) if call.is_error => (
                false,
                Err(PmlError::ToolCallFailed {
                    server_id: server_id.to_string(),
                    tool: task.tool.to_string(),
                    reason: call.text(),
                    error_code: None,
                }),
            ),
            Ok(call) => (true, Ok(call.to_value())),
            Err(e) => (false, Err(e)),
        };

        self.bus.publish(
            "mux",
            EventKind::ToolEnd {
                workflow_id: Arc::clone(workflow_id),
                tool: Arc::clone(&task.tool),
                server_id,
                success,
                duration_ms: start.elapsed().as_millis() as u64,
            },
        );

        value
    }

    async fn run_code(
        &self,
        task: &PhysicalTask,
        bindings: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        if let Some(name) = task.tool.strip_prefix("capability:") {
            let template = self.caps.resolve(name).ok_or_else(|| PmlError::UnknownTool {
                tool: task.tool.to_string(),
            })?;
            return run_with_cancel(
                self.runner.as_ref(),
                &template,
                bindings,
                task.sandbox.scope,
                cancel,
            )
            .await;
        }

        let code = task.code.as_deref().ok_or_else(|| PmlError::Internal {
            reason: format!("code_exec task '{}' has no code", task.id),
        })?;

        if task.metadata.pure {
            check_pure(code)?;
        }

        debug!(task = %task.id, "dispatching to sandbox");
        run_with_cancel(
            self.runner.as_ref(),
            code,
            bindings,
            task.sandbox.scope,
            cancel,
        )
        .await
    }

    /// Resolve a task's imports against the completed-tasks map.
    fn resolve_bindings(&self, state: &WorkflowState, task: &PhysicalTask) -> Value {
        let mut map = serde_json::Map::new();
        for name in &task.imports {
            let Some(producer_id) = state.exports.get(name) else {
                warn!(task = %task.id, binding = %name, "unresolved import");
                continue;
            };
            let Some(result) = state.completed.get(producer_id) else {
                warn!(task = %task.id, binding = %name, "producer not completed");
                continue;
            };
            let multi_export = state
                .task(producer_id)
                .map(|t| t.exports.len() > 1)
                .unwrap_or(false);
            let value = if multi_export {
                result.output.get(name).cloned().unwrap_or(Value::Null)
            } else {
                (*result.output).clone()
            };
            map.insert(name.clone(), value);
        }
        Value::Object(map)
    }

    /// The workflow result: the last final task (no dependents) that
    /// succeeded.
    fn final_output(&self, state: &WorkflowState) -> Value {
        let mut has_dependents: rustc_hash::FxHashSet<&str> = Default::default();
        for task in &state.dag.tasks {
            for dep in &task.deps {
                has_dependents.insert(dep.as_ref());
            }
        }

        state
            .dag
            .tasks
            .iter()
            .rev()
            .filter(|t| !has_dependents.contains(&*t.id))
            .find_map(|t| {
                state
                    .completed
                    .get(&t.id)
                    .filter(|r| r.is_success())
                    .map(|r| (*r.output).clone())
            })
            .unwrap_or(Value::Null)
    }
}

/// Resolve an argument source fragment into a JSON object.
///
/// Tries, in order: verbatim JSON, then JSON after quoting bare object keys
/// and substituting bound identifiers (dot paths like `row.addr` resolve
/// into the binding's value). Falls back to wrapping the raw text.
pub fn resolve_args(args_src: &str, bindings: &Value) -> Value {
    let trimmed = args_src.trim();
    if trimmed.is_empty() {
        return json!({});
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value;
    }

    // Quote bare keys: { sql: q } → { "sql": q }
    let mut candidate = UNQUOTED_KEY
        .replace_all(trimmed, |caps: &regex::Captures<'_>| {
            format!("{}\"{}\":", &caps[1], &caps[2])
        })
        .into_owned();

    // Substitute bound identifiers (with optional dot/index paths) by their
    // JSON encoding
    if let Value::Object(map) = bindings {
        for (name, value) in map {
            let pattern = format!(
                r"\b{}\b((?:\.[A-Za-z_$][A-Za-z0-9_$]*|\[[0-9]+\])*)",
                regex::escape(name)
            );
            let Ok(re) = Regex::new(&pattern) else { continue };
            candidate = re
                .replace_all(&candidate, |caps: &regex::Captures<'_>| {
                    let path = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                    let resolved = if path.is_empty() {
                        Some(value.clone())
                    } else {
                        jsonpath::resolve(value, path.trim_start_matches('.'))
                            .ok()
                            .flatten()
                    };
                    serde_json::to_string(&resolved.unwrap_or(Value::Null))
                        .unwrap_or_else(|_| "null".to_string())
                })
                .into_owned();
        }
    }

    if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
        return value;
    }

    json!({ "raw": trimmed, "bindings": bindings })
}
