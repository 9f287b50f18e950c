//! Method table and request shaping
//!
//! Every error is shaped onto the wire code table: build errors surface as
//! −32602 / −32002 before any workflow exists, approval denial and abort as
//! −32001, expiry as −32003, timeouts as −32004, tool failures as −32000
//! with `{serverId, toolName}` payloads.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::dag::{build_logical, fuse, CodeParser, TaskKind};
use crate::error::{PmlError, Result};
use crate::event::{EventBus, EventKind};
use crate::mux::Multiplexer;
use crate::registry::{cosine, CapabilityRegistry, EdgeType};
use crate::rpc::{Frame, JsonRpcError, JsonRpcResponse};
use crate::runtime::{
    ExecOutcome, WorkflowExecutor, WorkflowState, WorkflowStatus, WorkflowStore,
};
use crate::util::CAPABILITY_MATCH_THRESHOLD;

/// Everything the meta-operations touch, wired once at startup.
pub struct Gateway {
    pub mux: Arc<Multiplexer>,
    pub registry: Arc<CapabilityRegistry>,
    pub bus: Arc<EventBus>,
    pub store: Arc<WorkflowStore>,
    pub executor: WorkflowExecutor,
    pub parser: Arc<dyn CodeParser>,
    /// Skip HIL gates entirely (trusted-operator automation)
    pub auto_approve: bool,
}

/// JSON-RPC dispatcher over a [`Gateway`].
#[derive(Clone)]
pub struct Dispatcher {
    gateway: Arc<Gateway>,
}

impl Dispatcher {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Dispatch one raw line. `None` when no response is owed (notification
    /// or undecodable input that carries no id).
    pub async fn dispatch_line(&self, line: &str) -> Option<JsonRpcResponse> {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                return Some(JsonRpcResponse::failure(
                    Value::Null,
                    JsonRpcError::new(
                        PmlError::InvalidRequest {
                            reason: String::new(),
                        }
                        .rpc_code(),
                        "Invalid request: not JSON",
                    ),
                ))
            }
        };
        self.dispatch(value).await
    }

    /// Dispatch one decoded request object.
    pub async fn dispatch(&self, request: Value) -> Option<JsonRpcResponse> {
        match Frame::classify(request) {
            Some(Frame::Request { id, method, params }) => {
                Some(self.handle(id, &method, params).await)
            }
            Some(Frame::Notification { method }) => {
                info!(method = %method, "notification ignored");
                None
            }
            Some(Frame::Response(_)) | None => None,
        }
    }

    #[instrument(skip(self, params), fields(method = %method))]
    async fn handle(&self, id: Value, method: &str, params: Value) -> JsonRpcResponse {
        let result = match method {
            "initialize" => self.initialize(),
            "pml:discover" => self.discover(&params),
            "pml:execute" => self.execute(&params).await,
            "pml:abort" => self.abort(&params).await,
            "pml:replan" => self.replan(&params).await,
            "tools/list" => self.tools_list(),
            "tools/call" => self.tools_call(&params).await,
            other => Err(PmlError::MethodNotFound {
                method: other.to_string(),
            }),
        };

        match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => {
                warn!(error = %e, "request failed");
                JsonRpcResponse::failure(id, shape_error(&e))
            }
        }
    }

    fn initialize(&self) -> Result<Value> {
        Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": {} },
            "serverInfo": {
                "name": "pml-gateway",
                "version": env!("CARGO_PKG_VERSION"),
            }
        }))
    }

    // ═══════════════════════════════════════════
    // pml:discover
    // ═══════════════════════════════════════════

    fn discover(&self, params: &Value) -> Result<Value> {
        let intent = require_str(params, "intent", "pml:discover")?;
        let limit = params
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(10) as usize;
        let min_score = params
            .pointer("/filter/minScore")
            .and_then(Value::as_f64)
            .unwrap_or(0.0) as f32;
        let kind_filter = params
            .pointer("/filter/type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let include_related = params
            .get("include_related")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let context_tools: Vec<Arc<str>> = self
            .gateway
            .mux
            .index()
            .all()
            .iter()
            .map(|d| Arc::clone(&d.full_id))
            .collect();

        let mut results: Vec<Value> = Vec::new();

        if kind_filter.as_deref() != Some("tool") {
            for (capability, score) in
                self.gateway
                    .registry
                    .search(intent, min_score, limit, &context_tools)
            {
                let mut entry = json!({
                    "kind": "capability",
                    "id": capability.id,
                    "name": capability.name,
                    "score": score,
                    "intent": capability.intent,
                    "toolsUsed": capability.tools_used,
                    "successRate": capability.success_rate,
                    "usageCount": capability.usage_count,
                });
                if include_related {
                    let related: Vec<Value> = self
                        .gateway
                        .registry
                        .edges()
                        .into_iter()
                        .filter(|e| e.from_capability_id == capability.id)
                        .map(|e| {
                            json!({
                                "to": e.to_capability_id,
                                "edgeType": e.edge_type,
                                "observedCount": e.observed_count,
                                "confidenceScore": e.confidence_score,
                            })
                        })
                        .collect();
                    entry["related"] = Value::Array(related);
                }
                results.push(entry);
            }
        }

        if kind_filter.as_deref() != Some("capability") {
            let intent_embedding = self.gateway.registry.embed(intent);
            for descriptor in self.gateway.mux.index().all() {
                let text = descriptor
                    .description
                    .clone()
                    .unwrap_or_else(|| descriptor.name.clone());
                let embedding = descriptor
                    .embedding
                    .clone()
                    .unwrap_or_else(|| self.gateway.registry.embed(&text));
                let score = cosine(&intent_embedding, &embedding);
                if score < min_score {
                    continue;
                }
                results.push(json!({
                    "kind": "tool",
                    "id": descriptor.full_id,
                    "score": score,
                    "description": descriptor.description,
                    "scope": descriptor.scope,
                    "approvalMode": descriptor.approval,
                }));
            }
        }

        results.sort_by(|a, b| {
            let sa = a["score"].as_f64().unwrap_or(0.0);
            let sb = b["score"].as_f64().unwrap_or(0.0);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(limit);

        Ok(json!({ "results": results }))
    }

    // ═══════════════════════════════════════════
    // pml:execute
    // ═══════════════════════════════════════════

    async fn execute(&self, params: &Value) -> Result<Value> {
        // Resume path
        if let Some(cont) = params.get("continue_workflow") {
            let workflow_id = require_str(cont, "workflow_id", "pml:execute")?;
            let approved = cont
                .get("approved")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            return self.continue_workflow(workflow_id, approved).await;
        }

        let intent = require_str(params, "intent", "pml:execute")?;

        // Accepted suggestion: run a named capability with given args
        if let Some(accept) = params.get("accept_suggestion") {
            let call_name = require_str(accept, "callName", "pml:execute")?;
            let capability = self
                .gateway
                .registry
                .get_by_name(call_name)
                .or_else(|| {
                    self.gateway
                        .registry
                        .search(call_name, 0.0, 1, &[])
                        .into_iter()
                        .map(|(c, _)| c)
                        .next()
                })
                .ok_or_else(|| PmlError::UnknownTool {
                    tool: call_name.to_string(),
                })?;
            let code = capability.code_template.clone();
            return self.run_new_workflow(intent, &code, params).await;
        }

        // Explicit code wins
        if let Some(code) = params.get("code").and_then(Value::as_str) {
            return self.run_new_workflow(intent, code, params).await;
        }

        // Intent only: replay a confident capability match, otherwise
        // surface suggestions
        let matches = self.gateway.registry.search(intent, 0.0, 5, &[]);
        if let Some((capability, score)) = matches.first() {
            if *score >= CAPABILITY_MATCH_THRESHOLD {
                let code = capability.code_template.clone();
                return self.run_new_workflow(intent, &code, params).await;
            }
        }

        let suggestions: Vec<Value> = matches
            .iter()
            .map(|(c, score)| {
                json!({
                    "callName": c.name,
                    "id": c.id,
                    "score": score,
                    "intent": c.intent,
                })
            })
            .collect();
        Ok(json!({ "status": "suggestions", "suggestedDag": suggestions }))
    }

    async fn run_new_workflow(&self, intent: &str, code: &str, params: &Value) -> Result<Value> {
        let output = build_logical(self.gateway.parser.as_ref(), code)?;
        let dag = fuse(&output, self.gateway.mux.index())?;

        let workflow_id: Arc<str> = Arc::from(format!("wf-{}", Uuid::new_v4()));
        let mut state = WorkflowState::with_code(
            Arc::clone(&workflow_id),
            intent.to_string(),
            code.to_string(),
            dag,
        )?;
        state.auto = self.gateway.auto_approve;
        state.gate_every_layer = params
            .pointer("/options/per_layer_validation")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let handle = self.gateway.store.insert(state);
        let mut guard = handle.state.lock().await;
        let outcome = self
            .gateway
            .executor
            .run(&mut guard, &handle.cancel)
            .await?;
        self.outcome_to_result(&mut guard, outcome)
    }

    async fn continue_workflow(&self, workflow_id: &str, approved: bool) -> Result<Value> {
        let handle = self.gateway.store.get(workflow_id)?;
        let mut guard = handle.state.lock().await;

        if guard.status != WorkflowStatus::Paused {
            return Err(PmlError::NotPaused {
                workflow_id: workflow_id.to_string(),
                state: guard.status.as_str().to_string(),
            });
        }

        let pending = guard.pending_hil.take();
        if !approved {
            guard.status = WorkflowStatus::Failed;
            let checkpoint_id = pending
                .map(|p| p.checkpoint_id.to_string())
                .unwrap_or_default();
            self.gateway.bus.publish(
                "executor",
                EventKind::WorkflowFailed {
                    workflow_id: Arc::clone(&guard.workflow_id),
                    reason: "approval_denied".to_string(),
                },
            );
            return Err(PmlError::ApprovalDenied { checkpoint_id });
        }

        if let Some(pending) = pending {
            guard.approved_layer = Some(pending.layer_index);
        }

        let outcome = self
            .gateway
            .executor
            .run(&mut guard, &handle.cancel)
            .await?;
        self.outcome_to_result(&mut guard, outcome)
    }

    fn outcome_to_result(
        &self,
        state: &mut WorkflowState,
        outcome: ExecOutcome,
    ) -> Result<Value> {
        match outcome {
            ExecOutcome::Completed { result, trace } => {
                let capability = self
                    .gateway
                    .registry
                    .save_execution(&trace, &state.code_template);

                // Contains edges to sub-capabilities the workflow invoked
                let edges: Vec<(String, String, EdgeType)> = state
                    .dag
                    .tasks
                    .iter()
                    .filter(|t| t.kind == TaskKind::CodeExec)
                    .filter_map(|t| t.tool.strip_prefix("capability:"))
                    .filter_map(|name| self.gateway.registry.get_by_name(name))
                    .map(|sub| (capability.id.clone(), sub.id, EdgeType::Contains))
                    .collect();
                self.gateway.registry.record_edges(&edges);

                Ok(json!({
                    "status": "success",
                    "data": result,
                    "traceId": trace.id,
                    "workflowId": &*state.workflow_id,
                    "capabilityId": capability.id,
                    "executedPath": trace.executed_path,
                }))
            }
            ExecOutcome::ApprovalRequired {
                checkpoint_id,
                tasks,
            } => Ok(json!({
                "status": "approval_required",
                "workflowId": &*state.workflow_id,
                "checkpointId": &*checkpoint_id,
                "tasks": tasks,
            })),
            ExecOutcome::Failed { reason } => Err(PmlError::TaskFailed {
                task_id: state.workflow_id.to_string(),
                reason,
            }),
        }
    }

    // ═══════════════════════════════════════════
    // pml:abort
    // ═══════════════════════════════════════════

    async fn abort(&self, params: &Value) -> Result<Value> {
        let workflow_id = require_str(params, "workflow_id", "pml:abort")?;
        let reason = require_str(params, "reason", "pml:abort")?;

        let handle = self.gateway.store.get(workflow_id)?;
        // Cancel first so an in-flight layer fails fast, then settle state
        handle.cancel.cancel();

        let mut guard = handle.state.lock().await;
        if guard.status != WorkflowStatus::Aborted {
            guard.status = WorkflowStatus::Aborted;
            guard.pending_hil = None;
            self.gateway.bus.publish(
                "executor",
                EventKind::WorkflowFailed {
                    workflow_id: Arc::clone(&guard.workflow_id),
                    reason: format!("aborted: {}", reason),
                },
            );
        }

        Ok(json!({ "status": "aborted" }))
    }

    // ═══════════════════════════════════════════
    // pml:replan
    // ═══════════════════════════════════════════

    async fn replan(&self, params: &Value) -> Result<Value> {
        let workflow_id = require_str(params, "workflow_id", "pml:replan")?;
        let new_requirement = require_str(params, "new_requirement", "pml:replan")?;

        let handle = self.gateway.store.get(workflow_id)?;
        let mut guard = handle.state.lock().await;

        if guard.status != WorkflowStatus::Paused {
            return Err(PmlError::ReplanRejected {
                reason: format!(
                    "workflow is {}, replan needs a paused workflow",
                    guard.status.as_str()
                ),
            });
        }

        // Explicit code, or the closest stored capability for the new
        // requirement (the planner itself is an external collaborator)
        let code = match params.get("code").and_then(Value::as_str) {
            Some(code) => code.to_string(),
            None => self
                .gateway
                .registry
                .search(new_requirement, CAPABILITY_MATCH_THRESHOLD, 1, &[])
                .into_iter()
                .map(|(c, _)| c.code_template)
                .next()
                .ok_or_else(|| PmlError::InvalidParams {
                    method: "pml:replan".to_string(),
                    reason: "no code given and no capability matches the new requirement"
                        .to_string(),
                })?,
        };

        let output = build_logical(self.gateway.parser.as_ref(), &code)?;
        let new_dag = fuse(&output, self.gateway.mux.index())?;
        let (added_tasks, new_layer_count) = guard.apply_replan(new_dag)?;
        guard.intent = new_requirement.to_string();
        guard.code_template = code;

        self.gateway.bus.publish(
            "executor",
            EventKind::DagReplanned {
                workflow_id: Arc::clone(&guard.workflow_id),
                added_tasks,
                new_layer_count,
            },
        );

        Ok(json!({
            "status": "replanned",
            "addedTasks": added_tasks,
            "newLayerCount": new_layer_count,
        }))
    }

    // ═══════════════════════════════════════════
    // tools/list + tools/call
    // ═══════════════════════════════════════════

    fn tools_list(&self) -> Result<Value> {
        let tools: Vec<Value> = self
            .gateway
            .mux
            .index()
            .all()
            .into_iter()
            .map(|d| {
                json!({
                    "name": d.full_id,
                    "description": d.description,
                    "inputSchema": d.input_schema.unwrap_or_else(|| json!({"type": "object"})),
                })
            })
            .collect();
        Ok(json!({ "tools": tools }))
    }

    async fn tools_call(&self, params: &Value) -> Result<Value> {
        let name = require_str(params, "name", "tools/call")?;
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        let descriptor =
            self.gateway
                .mux
                .index()
                .get(name)
                .ok_or_else(|| PmlError::UnknownTool {
                    tool: name.to_string(),
                })?;

        // Validate arguments against the tool's input schema
        if let Some(schema) = &descriptor.input_schema {
            if let Ok(validator) = jsonschema::validator_for(schema) {
                if !validator.is_valid(&arguments) {
                    return Err(PmlError::InvalidParams {
                        method: "tools/call".to_string(),
                        reason: format!("arguments do not match inputSchema of '{}'", name),
                    });
                }
            }
        }

        let result = self.gateway.mux.call_full(name, arguments, None).await?;
        Ok(json!({
            "content": result.content,
            "isError": result.is_error,
        }))
    }
}

/// Map an internal error onto the wire shape, with tool-failure payloads.
fn shape_error(error: &PmlError) -> JsonRpcError {
    let rpc = JsonRpcError::new(error.rpc_code(), error.to_string());
    match error {
        PmlError::ToolCallFailed {
            server_id, tool, ..
        } => rpc.with_data(json!({ "serverId": server_id, "toolName": tool })),
        PmlError::ToolCallTimeout {
            server_id, tool, ..
        } => rpc.with_data(json!({ "serverId": server_id, "toolName": tool })),
        _ => rpc,
    }
}

fn require_str<'a>(params: &'a Value, field: &str, method: &str) -> Result<&'a str> {
    params
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PmlError::InvalidParams {
            method: method.to_string(),
            reason: format!("missing required field '{}'", field),
        })
}
