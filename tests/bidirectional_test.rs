//! Server-initiated requests (elicitation, sampling, roots) riding the
//! session event channel, with client responses routed back to the
//! pending call.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use mcp_runtime::server::session::{Session, SessionEvent, SessionWithClientInfo};
use mcp_runtime::server::{RequestContext, Server, ToolHandler};
use mcp_runtime::types::{
    methods, CallToolParams, CallToolResult, ClientCapabilities, ElicitAction, ElicitParams,
    ElicitationCapabilities, JSONRPCRequest, JSONRPCResponse, RequestId, Tool,
};
use mcp_runtime::Result;

/// Asks the user for a name via elicitation, then reports the outcome.
struct AskName;

#[async_trait]
impl ToolHandler for AskName {
    async fn handle(&self, ctx: RequestContext, _params: CallToolParams) -> Result<CallToolResult> {
        let result = ctx
            .elicit(ElicitParams {
                message: "What is your name?".to_string(),
                requested_schema: Some(json!({
                    "type": "object",
                    "properties": {"name": {"type": "string"}}
                })),
            })
            .await?;

        let text = match result.action {
            ElicitAction::Accept => {
                let name = result
                    .content
                    .as_ref()
                    .and_then(|c| c.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or("anonymous");
                format!("hello, {name}")
            },
            ElicitAction::Decline => "declined".to_string(),
            ElicitAction::Cancel => "cancelled".to_string(),
        };
        Ok(CallToolResult::text(text))
    }
}

fn server() -> Arc<Server> {
    Server::builder()
        .name("bidi-test")
        .tool(
            Tool::new("ask_name", "Asks via elicitation", json!({"type": "object"})),
            Arc::new(AskName),
        )
        .build()
}

fn request(id: i64, method: &str, params: Value) -> JSONRPCRequest {
    JSONRPCRequest::new(RequestId::from(id), method, params)
}

#[tokio::test]
async fn elicitation_round_trip() {
    let server = server();
    let session = server.new_session("s-bidi");
    session.mark_initialized();
    session.set_client_info(
        None,
        Some(ClientCapabilities {
            elicitation: Some(ElicitationCapabilities::default()),
            ..Default::default()
        }),
    );
    let mut receiver = session.take_receiver().unwrap();
    server.register_session(session.clone()).unwrap();
    let ctx = RequestContext::new().with_session(session.clone() as Arc<dyn Session>);

    // Run the tool call; it parks awaiting the client's answer.
    let call_server = server.clone();
    let call_ctx = ctx.clone();
    let call = tokio::spawn(async move {
        call_server
            .handle_request(
                request(1, methods::TOOLS_CALL, json!({"name": "ask_name"})),
                call_ctx,
            )
            .await
    });

    // The elicitation request appears on the session's event channel,
    // exactly as the SSE writer would see it.
    let event = tokio::time::timeout(std::time::Duration::from_secs(5), receiver.recv())
        .await
        .expect("timed out waiting for elicitation request")
        .expect("channel closed early");
    let elicit_request = match event {
        SessionEvent::Request(r) => r,
        other => panic!("expected a request event, got {other:?}"),
    };
    assert_eq!(elicit_request.method, "elicitation/create");
    assert_eq!(elicit_request.params["message"], "What is your name?");

    // The client answers by POSTing a response frame; feed it through
    // the same frame path the transport uses.
    let answer = JSONRPCResponse::success(
        elicit_request.id,
        json!({"action": "accept", "content": {"name": "Ada"}}),
    );
    let raw = serde_json::to_vec(&answer).unwrap();
    let reply = server.handle_frame(&raw, ctx).await;
    assert!(reply.is_none(), "response frames produce no reply");

    let response = call.await.unwrap();
    assert_eq!(
        response.result().unwrap()["content"][0]["text"],
        "hello, Ada"
    );
}

#[tokio::test]
async fn declined_elicitation_is_a_normal_result() {
    let server = server();
    let session = server.new_session("s-decline");
    session.mark_initialized();
    session.set_client_info(
        None,
        Some(ClientCapabilities {
            elicitation: Some(ElicitationCapabilities::default()),
            ..Default::default()
        }),
    );
    let mut receiver = session.take_receiver().unwrap();
    server.register_session(session.clone()).unwrap();
    let ctx = RequestContext::new().with_session(session.clone() as Arc<dyn Session>);

    let call_server = server.clone();
    let call_ctx = ctx.clone();
    let call = tokio::spawn(async move {
        call_server
            .handle_request(
                request(1, methods::TOOLS_CALL, json!({"name": "ask_name"})),
                call_ctx,
            )
            .await
    });

    let elicit_request = match receiver.recv().await.unwrap() {
        SessionEvent::Request(r) => r,
        other => panic!("expected a request event, got {other:?}"),
    };
    let answer = JSONRPCResponse::success(elicit_request.id, json!({"action": "decline"}));
    let raw = serde_json::to_vec(&answer).unwrap();
    server.handle_frame(&raw, ctx).await;

    let response = call.await.unwrap();
    assert_eq!(response.result().unwrap()["content"][0]["text"], "declined");
}

#[tokio::test]
async fn undeclared_client_capability_fails_the_call() {
    let server = server();
    let session = server.new_session("s-nocap");
    session.mark_initialized();
    session.set_client_info(None, Some(ClientCapabilities::default()));
    server.register_session(session.clone()).unwrap();
    let ctx = RequestContext::new().with_session(session as Arc<dyn Session>);

    let response = server
        .handle_request(
            request(1, methods::TOOLS_CALL, json!({"name": "ask_name"})),
            ctx,
        )
        .await;
    let error = response.error_details().unwrap();
    assert_eq!(error.code, -32603);
    assert!(error.message.contains("does not support elicitation"));
}

#[tokio::test]
async fn stray_response_is_dropped_quietly() {
    let server = server();
    let session = server.new_session("s-stray");
    session.mark_initialized();
    server.register_session(session.clone()).unwrap();
    let ctx = RequestContext::new().with_session(session as Arc<dyn Session>);

    // Nothing pending: a pong-style empty result is swallowed without a
    // reply and without disturbing the session.
    let reply = server
        .handle_frame(br#"{"jsonrpc":"2.0","id":7,"result":{}}"#, ctx.clone())
        .await;
    assert!(reply.is_none());

    // The session still serves requests afterwards.
    let response = server
        .handle_request(request(8, methods::PING, Value::Null), ctx)
        .await;
    assert!(response.result().is_some());
}

#[tokio::test]
async fn unregistered_session_abort_fails_pending_round_trip() {
    use mcp_runtime::server::session::SessionWithElicitation;

    let server = server();
    let session = server.new_session("s-abort");
    session.mark_initialized();
    session.set_client_info(
        None,
        Some(ClientCapabilities {
            elicitation: Some(ElicitationCapabilities::default()),
            ..Default::default()
        }),
    );
    let mut receiver = session.take_receiver().unwrap();
    server.register_session(session.clone()).unwrap();

    let elicit_session = session.clone();
    let pending = tokio::spawn(async move {
        elicit_session
            .elicit(ElicitParams {
                message: "still there?".to_string(),
                requested_schema: None,
            })
            .await
    });

    // Wait for the request to be queued, then tear the session down.
    let _ = receiver.recv().await.unwrap();
    server.unregister_session("s-abort");
    session.abort_pending();

    let outcome = pending.await.unwrap();
    assert!(matches!(outcome, Err(mcp_runtime::Error::TransportClosed)));
}
