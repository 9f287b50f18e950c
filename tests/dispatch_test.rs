//! Dispatcher integration: the JSON-RPC method table end to end
//!
//! Exercises error shaping (the −326xx / −3200x table), the execute →
//! approval → continue flow, capability learning and dedup, abort, replan
//! preconditions, and the tools/* surface.

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use common::{ready_server, register_tool, test_gateway, tool_ok};
use pml_gateway::mux::{ApprovalMode, Multiplexer, Scope, ServerConfig, ToolDescriptor};
use pml_gateway::runtime::MockRunner;

async fn call(dispatcher: &pml_gateway::Dispatcher, id: u64, method: &str, params: Value) -> Value {
    let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
    let response = dispatcher
        .dispatch(request)
        .await
        .expect("request with id gets a response");
    serde_json::to_value(&response).unwrap()
}

#[tokio::test]
async fn invalid_json_line_yields_invalid_request() {
    let mux = Arc::new(Multiplexer::empty());
    let (dispatcher, _) = test_gateway(mux, Arc::new(MockRunner::constant(json!(null))), true);

    let response = dispatcher.dispatch_line("this is not json").await.unwrap();
    assert_eq!(response.error.as_ref().unwrap().code, -32600);
}

#[tokio::test]
async fn unknown_method_yields_method_not_found() {
    let mux = Arc::new(Multiplexer::empty());
    let (dispatcher, _) = test_gateway(mux, Arc::new(MockRunner::constant(json!(null))), true);

    let response = call(&dispatcher, 1, "pml:transmogrify", json!({})).await;
    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn notifications_get_no_response() {
    let mux = Arc::new(Multiplexer::empty());
    let (dispatcher, _) = test_gateway(mux, Arc::new(MockRunner::constant(json!(null))), true);

    let response = dispatcher
        .dispatch(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .await;
    assert!(response.is_none());
}

#[tokio::test]
async fn discover_requires_intent() {
    let mux = Arc::new(Multiplexer::empty());
    let (dispatcher, _) = test_gateway(mux, Arc::new(MockRunner::constant(json!(null))), true);

    let response = call(&dispatcher, 1, "pml:discover", json!({})).await;
    assert_eq!(response["error"]["code"], -32602);
}

#[tokio::test]
async fn execute_code_learns_capability_and_dedups() {
    let mux = Arc::new(Multiplexer::empty());
    let (dispatcher, gateway) =
        test_gateway(mux, Arc::new(MockRunner::constant(json!(12))), true);

    let params = json!({
        "intent": "sum doubled numbers",
        "code": "const n=[1,2,3]; const d = n.map(x=>x*2); return d.reduce((a,b)=>a+b,0);"
    });

    let first = call(&dispatcher, 1, "pml:execute", params.clone()).await;
    assert_eq!(first["result"]["status"], "success");
    assert_eq!(first["result"]["data"], 12);
    assert!(first["result"]["workflowId"].as_str().unwrap().starts_with("wf-"));
    let capability_id = first["result"]["capabilityId"].as_str().unwrap().to_string();

    // Same code: dedup, one record, usage climbs
    let second = call(&dispatcher, 2, "pml:execute", params).await;
    assert_eq!(second["result"]["capabilityId"], capability_id.as_str());
    assert_eq!(gateway.registry.len(), 1);
    let capability = gateway.registry.get_by_id(&capability_id).unwrap();
    assert!(capability.usage_count >= 2);
}

#[tokio::test]
async fn discover_finds_learned_capability() {
    let mux = Arc::new(Multiplexer::empty());
    let (dispatcher, _) = test_gateway(mux, Arc::new(MockRunner::constant(json!(1))), true);

    call(
        &dispatcher,
        1,
        "pml:execute",
        json!({
            "intent": "query the sales database and build a report",
            "code": "const d = n.map(x=>x);"
        }),
    )
    .await;

    let response = call(
        &dispatcher,
        2,
        "pml:discover",
        json!({"intent": "build the sales report from the database"}),
    )
    .await;

    let results = response["result"]["results"].as_array().unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0]["kind"], "capability");
}

#[tokio::test]
async fn intent_only_execute_returns_suggestions_when_no_confident_match() {
    let mux = Arc::new(Multiplexer::empty());
    let (dispatcher, _) = test_gateway(mux, Arc::new(MockRunner::constant(json!(1))), true);

    let response = call(
        &dispatcher,
        1,
        "pml:execute",
        json!({"intent": "do something nobody has done before"}),
    )
    .await;
    assert_eq!(response["result"]["status"], "suggestions");
}

#[tokio::test]
async fn approval_flow_through_dispatcher() {
    let db = ready_server(
        ServerConfig::stdio("db", "unused")
            .with_scope(Scope::NetworkApi)
            .with_approval(ApprovalMode::Hil),
        |request| vec![tool_ok(&request["id"], "[1,2,3]")],
    )
    .await;

    let mux = Arc::new(Multiplexer::empty());
    mux.add_server(db);
    register_tool(
        &mux,
        ToolDescriptor::new("db", "query")
            .with_scope(Scope::NetworkApi)
            .with_approval(ApprovalMode::Hil),
    );

    let (dispatcher, _) = test_gateway(
        Arc::clone(&mux),
        Arc::new(MockRunner::constant(json!([1, 2, 3]))),
        false, // HIL active
    );

    let response = call(
        &dispatcher,
        1,
        "pml:execute",
        json!({
            "intent": "read the table",
            "code": "const rows = await mcp.db.query({});"
        }),
    )
    .await;

    assert_eq!(response["result"]["status"], "approval_required");
    let workflow_id = response["result"]["workflowId"].as_str().unwrap().to_string();
    assert!(response["result"]["checkpointId"]
        .as_str()
        .unwrap()
        .starts_with("chk-"));

    // Approve: the held layer runs and the workflow completes
    let resumed = call(
        &dispatcher,
        2,
        "pml:execute",
        json!({
            "continue_workflow": {"workflow_id": workflow_id, "approved": true}
        }),
    )
    .await;
    assert_eq!(resumed["result"]["status"], "success");
    assert_eq!(resumed["result"]["data"], json!([1, 2, 3]));
}

#[tokio::test]
async fn denied_approval_maps_to_approval_denied() {
    let mux = Arc::new(Multiplexer::empty());
    register_tool(
        &mux,
        ToolDescriptor::new("db", "query").with_approval(ApprovalMode::Hil),
    );

    let (dispatcher, _) = test_gateway(
        Arc::clone(&mux),
        Arc::new(MockRunner::constant(json!(null))),
        false,
    );

    let response = call(
        &dispatcher,
        1,
        "pml:execute",
        json!({
            "intent": "read the table",
            "code": "const rows = await mcp.db.query({});"
        }),
    )
    .await;
    let workflow_id = response["result"]["workflowId"].as_str().unwrap().to_string();

    let denied = call(
        &dispatcher,
        2,
        "pml:execute",
        json!({
            "continue_workflow": {"workflow_id": workflow_id, "approved": false}
        }),
    )
    .await;
    assert_eq!(denied["error"]["code"], -32001);
}

#[tokio::test]
async fn abort_unknown_workflow_is_not_found() {
    let mux = Arc::new(Multiplexer::empty());
    let (dispatcher, _) = test_gateway(mux, Arc::new(MockRunner::constant(json!(null))), true);

    let response = call(
        &dispatcher,
        1,
        "pml:abort",
        json!({"workflow_id": "wf-ghost", "reason": "cleanup"}),
    )
    .await;
    assert_eq!(response["error"]["code"], -32003);
}

#[tokio::test]
async fn abort_paused_workflow_succeeds() {
    let mux = Arc::new(Multiplexer::empty());
    register_tool(
        &mux,
        ToolDescriptor::new("db", "query").with_approval(ApprovalMode::Hil),
    );
    let (dispatcher, _) = test_gateway(
        Arc::clone(&mux),
        Arc::new(MockRunner::constant(json!(null))),
        false,
    );

    let response = call(
        &dispatcher,
        1,
        "pml:execute",
        json!({"intent": "x", "code": "const rows = await mcp.db.query({});"}),
    )
    .await;
    let workflow_id = response["result"]["workflowId"].as_str().unwrap().to_string();

    let aborted = call(
        &dispatcher,
        2,
        "pml:abort",
        json!({"workflow_id": workflow_id, "reason": "changed my mind"}),
    )
    .await;
    assert_eq!(aborted["result"]["status"], "aborted");

    // Continuing an aborted workflow is rejected
    let resumed = call(
        &dispatcher,
        3,
        "pml:execute",
        json!({"continue_workflow": {"workflow_id": workflow_id, "approved": true}}),
    )
    .await;
    assert_eq!(resumed["error"]["code"], -32602);
}

#[tokio::test]
async fn replan_requires_paused_workflow() {
    let mux = Arc::new(Multiplexer::empty());
    let (dispatcher, _) = test_gateway(
        Arc::clone(&mux),
        Arc::new(MockRunner::constant(json!(1))),
        true,
    );

    // Completed workflow: replan must be rejected
    let response = call(
        &dispatcher,
        1,
        "pml:execute",
        json!({"intent": "x", "code": "const d = n.map(x=>x);"}),
    )
    .await;
    let workflow_id = response["result"]["workflowId"].as_str().unwrap().to_string();

    let rejected = call(
        &dispatcher,
        2,
        "pml:replan",
        json!({"workflow_id": workflow_id, "new_requirement": "something else"}),
    )
    .await;
    assert_eq!(rejected["error"]["code"], -32602);
}

#[tokio::test]
async fn replan_paused_workflow_rebuilds_suffix() {
    let mux = Arc::new(Multiplexer::empty());
    register_tool(
        &mux,
        ToolDescriptor::new("db", "query").with_approval(ApprovalMode::Hil),
    );
    let (dispatcher, _) = test_gateway(
        Arc::clone(&mux),
        Arc::new(MockRunner::constant(json!(7))),
        false,
    );

    let response = call(
        &dispatcher,
        1,
        "pml:execute",
        json!({"intent": "x", "code": "const rows = await mcp.db.query({});"}),
    )
    .await;
    let workflow_id = response["result"]["workflowId"].as_str().unwrap().to_string();
    assert_eq!(response["result"]["status"], "approval_required");

    let replanned = call(
        &dispatcher,
        2,
        "pml:replan",
        json!({
            "workflow_id": workflow_id,
            "new_requirement": "just shape local data",
            "code": "const d = n.map(x=>x);"
        }),
    )
    .await;
    assert_eq!(replanned["result"]["status"], "replanned");
    assert_eq!(replanned["result"]["addedTasks"], 1);
    assert_eq!(replanned["result"]["newLayerCount"], 1);

    // The replanned suffix is pure, so continuing runs it to completion
    let resumed = call(
        &dispatcher,
        3,
        "pml:execute",
        json!({"continue_workflow": {"workflow_id": workflow_id, "approved": true}}),
    )
    .await;
    assert_eq!(resumed["result"]["status"], "success");
    assert_eq!(resumed["result"]["data"], 7);
}

#[tokio::test]
async fn tools_call_validates_arguments_against_schema() {
    let srv = ready_server(ServerConfig::stdio("db", "unused"), |request| {
        vec![tool_ok(&request["id"], "ok")]
    })
    .await;

    let mux = Arc::new(Multiplexer::empty());
    mux.add_server(srv);
    register_tool(
        &mux,
        ToolDescriptor::new("db", "query").with_input_schema(json!({
            "type": "object",
            "properties": {"sql": {"type": "string"}},
            "required": ["sql"]
        })),
    );

    let (dispatcher, _) = test_gateway(
        Arc::clone(&mux),
        Arc::new(MockRunner::constant(json!(null))),
        true,
    );

    // Valid arguments pass through to the server
    let ok = call(
        &dispatcher,
        1,
        "tools/call",
        json!({"name": "db:query", "arguments": {"sql": "select 1"}}),
    )
    .await;
    assert_eq!(ok["result"]["isError"], false);

    // Schema violation: missing required field
    let bad = call(
        &dispatcher,
        2,
        "tools/call",
        json!({"name": "db:query", "arguments": {"limit": 5}}),
    )
    .await;
    assert_eq!(bad["error"]["code"], -32602);

    // Unknown tool
    let unknown = call(
        &dispatcher,
        3,
        "tools/call",
        json!({"name": "db:nope", "arguments": {}}),
    )
    .await;
    assert_eq!(unknown["error"]["code"], -32002);
}

#[tokio::test]
async fn tools_list_exposes_the_index() {
    let mux = Arc::new(Multiplexer::empty());
    register_tool(
        &mux,
        ToolDescriptor::new("db", "query").with_description("run SQL"),
    );
    register_tool(&mux, ToolDescriptor::new("email", "send"));

    let (dispatcher, _) = test_gateway(
        Arc::clone(&mux),
        Arc::new(MockRunner::constant(json!(null))),
        true,
    );

    let response = call(&dispatcher, 1, "tools/list", json!({})).await;
    let tools = response["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 2);
    assert!(tools.iter().any(|t| t["name"] == "db:query"));
}
