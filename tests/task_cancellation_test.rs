//! Task cancellation through the full dispatch path: the stored cancel
//! token reaches the running handler, the task ends `cancelled`, and a
//! late handler outcome is discarded.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use mcp_runtime::server::hooks::Hooks;
use mcp_runtime::server::session::Session;
use mcp_runtime::server::{RequestContext, Server, ToolHandler};
use mcp_runtime::types::{
    methods, CallToolParams, CallToolResult, JSONRPCRequest, RequestId, TaskSupport, Tool,
};
use mcp_runtime::Result;

struct StallingTool {
    started: Arc<tokio::sync::Notify>,
    observed_cancel: Arc<AtomicUsize>,
}

#[async_trait]
impl ToolHandler for StallingTool {
    async fn handle(&self, ctx: RequestContext, _params: CallToolParams) -> Result<CallToolResult> {
        self.started.notify_one();
        ctx.cancellation().cancelled().await;
        self.observed_cancel.fetch_add(1, Ordering::SeqCst);
        // This return value must be discarded; the task is already
        // cancelled by the time it lands.
        Ok(CallToolResult::text("too late"))
    }
}

fn request(id: i64, method: &str, params: Value) -> JSONRPCRequest {
    JSONRPCRequest::new(RequestId::from(id), method, params)
}

#[tokio::test]
async fn cancel_reaches_the_handler_and_sticks() {
    let started = Arc::new(tokio::sync::Notify::new());
    let observed_cancel = Arc::new(AtomicUsize::new(0));
    let cancelled_hooks = Arc::new(AtomicUsize::new(0));

    let mut hooks = Hooks::new();
    {
        let cancelled_hooks = cancelled_hooks.clone();
        hooks.add_on_task_cancelled(move |_| {
            cancelled_hooks.fetch_add(1, Ordering::SeqCst);
        });
    }

    let server = Server::builder()
        .name("cancel-test")
        .hooks(hooks)
        .tool(
            Tool::new("stall", "Waits forever", json!({})).with_task_support(TaskSupport::Optional),
            Arc::new(StallingTool {
                started: started.clone(),
                observed_cancel: observed_cancel.clone(),
            }),
        )
        .build();

    let session = server.new_session("s-cancel");
    session.mark_initialized();
    server.register_session(session.clone()).unwrap();
    let ctx = RequestContext::new().with_session(session as Arc<dyn Session>);

    let response = server
        .handle_request(
            request(
                1,
                methods::TOOLS_CALL,
                json!({"name": "stall", "arguments": {}, "task": {"ttl": 60000}}),
            ),
            ctx.clone(),
        )
        .await;
    let task_id = response.result().unwrap()["task"]["taskId"]
        .as_str()
        .unwrap()
        .to_string();

    started.notified().await;

    let response = server
        .handle_request(
            request(2, methods::TASKS_CANCEL, json!({"taskId": task_id})),
            ctx.clone(),
        )
        .await;
    assert_eq!(response.result().unwrap()["status"], "cancelled");
    assert_eq!(cancelled_hooks.load(Ordering::SeqCst), 1);

    // The handler observes the cancellation at its suspension point.
    for _ in 0..100 {
        if observed_cancel.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(observed_cancel.load(Ordering::SeqCst), 1);

    // The late "too late" result never resurrects the task.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let response = server
        .handle_request(
            request(3, methods::TASKS_GET, json!({"taskId": task_id})),
            ctx.clone(),
        )
        .await;
    assert_eq!(response.result().unwrap()["status"], "cancelled");

    let response = server
        .handle_request(
            request(4, methods::TASKS_RESULT, json!({"taskId": task_id})),
            ctx.clone(),
        )
        .await;
    assert!(response.error_details().is_some());

    // Cancelling a terminal task is a no-op success, and the hook does
    // not fire again.
    let response = server
        .handle_request(
            request(5, methods::TASKS_CANCEL, json!({"taskId": task_id})),
            ctx,
        )
        .await;
    assert_eq!(response.result().unwrap()["status"], "cancelled");
    assert_eq!(cancelled_hooks.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancel_unknown_task_is_invalid_params() -> anyhow::Result<()> {
    let server = Server::builder().name("cancel-test").build();
    let session = server.new_session("s");
    session.mark_initialized();
    server.register_session(session.clone())?;
    let ctx = RequestContext::new().with_session(session as Arc<dyn Session>);

    let response = server
        .handle_request(
            request(1, methods::TASKS_CANCEL, json!({"taskId": "ghost"})),
            ctx,
        )
        .await;
    let error = response
        .error_details()
        .ok_or_else(|| anyhow::anyhow!("expected an error reply"))?;
    assert_eq!(error.code, -32602);
    assert!(error.message.contains("task not found"));
    Ok(())
}

#[tokio::test]
async fn max_concurrent_tasks_surfaces_as_internal_error() {
    let started = Arc::new(tokio::sync::Notify::new());
    let server = Server::builder()
        .name("cancel-test")
        .max_concurrent_tasks(1)
        .tool(
            Tool::new("stall", "Waits forever", json!({})).with_task_support(TaskSupport::Required),
            Arc::new(StallingTool {
                started: started.clone(),
                observed_cancel: Arc::new(AtomicUsize::new(0)),
            }),
        )
        .build();

    let session = server.new_session("s");
    session.mark_initialized();
    server.register_session(session.clone()).unwrap();
    let ctx = RequestContext::new().with_session(session as Arc<dyn Session>);

    let response = server
        .handle_request(
            request(1, methods::TOOLS_CALL, json!({"name": "stall", "task": {}})),
            ctx.clone(),
        )
        .await;
    assert!(response.result().is_some());

    let response = server
        .handle_request(
            request(2, methods::TOOLS_CALL, json!({"name": "stall", "task": {}})),
            ctx,
        )
        .await;
    let error = response.error_details().unwrap();
    assert_eq!(error.code, -32603);
    assert_eq!(error.message, "max concurrent tasks limit reached (1)");
}
