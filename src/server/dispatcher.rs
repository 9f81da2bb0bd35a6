//! Frame dispatch: parse, gate, hooks, routing, and reply shaping.
//!
//! Panic recovery wraps only the handler call. Envelope serialization
//! happens outside the recovery frame so a broken reply surfaces as an
//! internal error instead of being masked.

use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::error::{Error, Result, SessionCapability};
use crate::types::jsonrpc::{
    parse_frame, Frame, JSONRPCNotification, JSONRPCRequest, JSONRPCResponse, RequestId,
};
use crate::types::protocol::{
    methods, CallToolParams, CancelTaskParams, CancelledParams, GetPromptParams, GetTaskParams,
    InitializeParams, InitializeResult, ListPromptsParams, ListPromptsResult,
    ListResourceTemplatesParams, ListResourceTemplatesResult, ListResourcesParams,
    ListResourcesResult, ListTasksParams, ListTasksResult, ListToolsParams, ListToolsResult,
    ReadResourceParams, SetLevelParams, TaskSupport,
};
use crate::types::tasks::{CreateTaskResult, TaskRequestParams, TaskStatus};
use crate::{DEFAULT_NEGOTIATED_VERSION, LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};

use super::registry::{best_template_match, paginate, PromptEntry, TemplateEntry, ToolEntry};
use super::{RequestContext, Server};

fn decode<T: DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| Error::invalid_params(e.to_string()))
}

fn decode_or_default<T: DeserializeOwned + Default>(params: Value) -> Result<T> {
    if params.is_null() {
        Ok(T::default())
    } else {
        decode(params)
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(Error::from)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Server {
    /// Decode and dispatch a raw frame.
    ///
    /// Returns the reply for requests and parse failures; notifications
    /// and inbound responses produce no reply.
    pub async fn handle_frame(&self, raw: &[u8], ctx: RequestContext) -> Option<JSONRPCResponse> {
        match parse_frame(raw) {
            Err(e) => Some(JSONRPCResponse::error(RequestId::Null, e.to_jsonrpc_error())),
            Ok(Frame::Request(request)) => Some(self.handle_request(request, ctx).await),
            Ok(Frame::Notification(notification)) => {
                self.handle_notification(notification, ctx).await;
                None
            },
            Ok(Frame::Response(response)) => {
                self.route_client_response(response, &ctx);
                None
            },
        }
    }

    /// Handle one request end to end, producing exactly one reply.
    pub async fn handle_request(
        &self,
        request: JSONRPCRequest,
        ctx: RequestContext,
    ) -> JSONRPCResponse {
        let id = request.id.clone();
        let method = request.method.clone();

        // Everything except the handshake and liveness probes requires a
        // completed initialize on the session.
        let initialized = ctx
            .session()
            .map(|s| s.is_initialized())
            .unwrap_or(false);
        if !initialized && method != methods::INITIALIZE && method != methods::PING {
            let err = Error::internal("server not initialized: call initialize first");
            return JSONRPCResponse::error(id, err.to_jsonrpc_error());
        }

        let inflight_key = Server::inflight_key(
            ctx.session().map(|s| s.id().to_string()).as_deref(),
            &id,
        );
        self.register_inflight(inflight_key.clone(), ctx.cancellation().clone());

        self.hooks
            .run_before(self.recover_panics, &ctx, Some(&id), &method, &request.params);

        let outcome = if self.recover_panics {
            match AssertUnwindSafe(self.dispatch_method(&request, &ctx))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => Err(Error::internal(format!(
                    "panic recovered: {}",
                    panic_message(payload.as_ref())
                ))),
            }
        } else {
            self.dispatch_method(&request, &ctx).await
        };

        self.remove_inflight(&inflight_key);

        match outcome {
            Ok(result) => {
                self.hooks
                    .run_after(self.recover_panics, &ctx, Some(&id), &method, &result);
                JSONRPCResponse::success(id, result)
            },
            Err(error) => {
                tracing::debug!(
                    target: "mcp.dispatch",
                    method = %method,
                    error = %error,
                    "request failed"
                );
                self.hooks
                    .run_error(self.recover_panics, &ctx, Some(&id), &method, &error);
                JSONRPCResponse::error(id, error.to_jsonrpc_error())
            },
        }
    }

    /// Handle an inbound notification. Produces no reply.
    pub async fn handle_notification(&self, notification: JSONRPCNotification, ctx: RequestContext) {
        self.hooks.run_before(
            self.recover_panics,
            &ctx,
            None,
            &notification.method,
            &notification.params,
        );

        match notification.method.as_str() {
            methods::NOTIF_INITIALIZED => {
                // State already flipped when the initialize reply was
                // handed to the transport; nothing to do here.
                tracing::debug!(
                    target: "mcp.dispatch",
                    session = ctx.session().map(|s| s.id().to_string()).as_deref().unwrap_or(""),
                    "client reports initialization complete"
                );
            },
            methods::NOTIF_CANCELLED => {
                match decode::<CancelledParams>(notification.params.clone()) {
                    Ok(params) => {
                        let key = Server::inflight_key(
                            ctx.session().map(|s| s.id().to_string()).as_deref(),
                            &params.request_id,
                        );
                        if self.cancel_inflight(&key) {
                            tracing::debug!(
                                target: "mcp.dispatch",
                                request = %params.request_id,
                                reason = params.reason.as_deref().unwrap_or(""),
                                "request cancelled by client"
                            );
                        }
                    },
                    Err(e) => {
                        tracing::debug!(target: "mcp.dispatch", error = %e, "bad cancelled notification");
                    },
                }
            },
            other => {
                tracing::debug!(target: "mcp.dispatch", method = other, "ignoring notification");
            },
        }
    }

    /// Route an inbound response frame to the pending server-initiated
    /// request it answers. Any frame carrying `result` or `error` lands
    /// here; with no session or no pending slot it is dropped after a
    /// debug log, never treated as a method call.
    pub fn route_client_response(&self, response: JSONRPCResponse, ctx: &RequestContext) -> bool {
        match ctx.session() {
            Some(session) => {
                let routed = session.complete_pending(response);
                if !routed {
                    tracing::debug!(
                        target: "mcp.dispatch",
                        session = %session.id(),
                        "response frame matched no pending request"
                    );
                }
                routed
            },
            None => {
                tracing::debug!(
                    target: "mcp.dispatch",
                    "response frame with no session; dropped"
                );
                false
            },
        }
    }

    async fn dispatch_method(&self, request: &JSONRPCRequest, ctx: &RequestContext) -> Result<Value> {
        let params = request.params.clone();
        match request.method.as_str() {
            methods::INITIALIZE => {
                let params: InitializeParams = decode_or_default(params)?;
                to_value(self.handle_initialize(ctx, params))
            },
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => {
                let params: ListToolsParams = decode_or_default(params)?;
                to_value(self.handle_list_tools(ctx, &params)?)
            },
            methods::TOOLS_CALL => {
                let params: CallToolParams = decode(params)?;
                self.handle_call_tool(ctx, params).await
            },
            methods::PROMPTS_LIST => {
                let params: ListPromptsParams = decode_or_default(params)?;
                to_value(self.handle_list_prompts(ctx, &params)?)
            },
            methods::PROMPTS_GET => {
                let params: GetPromptParams = decode(params)?;
                let entry = self.lookup_prompt(&params.name, ctx).ok_or_else(|| {
                    Error::invalid_params(format!("prompt not found: {}", params.name))
                })?;
                to_value(entry.handler.render(ctx.clone(), params).await?)
            },
            methods::RESOURCES_LIST => {
                let params: ListResourcesParams = decode_or_default(params)?;
                to_value(self.handle_list_resources(ctx, &params)?)
            },
            methods::RESOURCES_TEMPLATES_LIST => {
                let params: ListResourceTemplatesParams = decode_or_default(params)?;
                to_value(self.handle_list_templates(ctx, &params)?)
            },
            methods::RESOURCES_READ => {
                let params: ReadResourceParams = decode(params)?;
                self.handle_read_resource(ctx, params).await
            },
            methods::LOGGING_SET_LEVEL => {
                let params: SetLevelParams = decode(params)?;
                let session = ctx
                    .session()
                    .ok_or_else(|| Error::internal("no session attached to request context"))?;
                let logging =
                    session
                        .as_logging()
                        .ok_or_else(|| Error::SessionMissingCapability {
                            session_id: session.id().to_string(),
                            capability: SessionCapability::Logging,
                        })?;
                logging.set_log_level(params.level);
                Ok(json!({}))
            },
            methods::TASKS_GET => {
                let params: GetTaskParams = decode(params)?;
                to_value(self.task_manager.get(&params.task_id)?)
            },
            methods::TASKS_RESULT => {
                let params: GetTaskParams = decode(params)?;
                to_value(self.task_manager.result(&params.task_id)?)
            },
            methods::TASKS_CANCEL => {
                let params: CancelTaskParams = decode(params)?;
                to_value(self.task_manager.cancel_task(&params.task_id)?)
            },
            methods::TASKS_LIST => {
                let params: ListTasksParams = decode_or_default(params)?;
                let (tasks, next_cursor) = self
                    .task_manager
                    .list(params.cursor.as_deref(), self.pagination_limit)?;
                to_value(ListTasksResult { tasks, next_cursor })
            },
            other => Err(Error::MethodNotFound(other.to_string())),
        }
    }

    fn handle_initialize(&self, ctx: &RequestContext, params: InitializeParams) -> InitializeResult {
        let requested = params.protocol_version.clone();
        let negotiated = if requested.is_empty() {
            DEFAULT_NEGOTIATED_VERSION.to_string()
        } else if SUPPORTED_PROTOCOL_VERSIONS.contains(&requested.as_str()) {
            requested
        } else {
            // Not an error: echo the newest supported version and let the
            // client decide whether to proceed.
            LATEST_PROTOCOL_VERSION.to_string()
        };

        if let Some(session) = ctx.session() {
            if let Some(client_info) = session.as_client_info() {
                client_info.set_client_info(
                    params.client_info.clone(),
                    Some(params.capabilities.clone()),
                );
                client_info.set_protocol_version(negotiated.clone());
            }
        }

        InitializeResult {
            protocol_version: negotiated,
            capabilities: self.capabilities(),
            server_info: self.info().clone(),
            instructions: self.instructions().map(str::to_string),
        }
    }

    fn lookup_tool(&self, name: &str, ctx: &RequestContext) -> Option<ToolEntry> {
        if let Some(tools) = ctx.session().and_then(|s| s.as_tools()) {
            if let Some(entry) = tools.session_tools().get(name) {
                return Some(entry.clone());
            }
        }
        self.tools.get(name)
    }

    fn lookup_prompt(&self, name: &str, ctx: &RequestContext) -> Option<PromptEntry> {
        if let Some(prompts) = ctx.session().and_then(|s| s.as_prompts()) {
            if let Some(entry) = prompts.session_prompts().get(name) {
                return Some(entry.clone());
            }
        }
        self.prompts.get(name)
    }

    fn handle_list_tools(
        &self,
        ctx: &RequestContext,
        params: &ListToolsParams,
    ) -> Result<ListToolsResult> {
        let ordered = match ctx.session().and_then(|s| s.as_tools()) {
            Some(tools) => self.tools.snapshot_with_overlay(&tools.session_tools()),
            None => self.tools.snapshot(),
        };
        let (entries, next_cursor) =
            paginate(&ordered, params.cursor.as_deref(), self.pagination_limit)?;
        Ok(ListToolsResult {
            tools: entries.into_iter().map(|e| e.tool).collect(),
            next_cursor,
        })
    }

    fn handle_list_prompts(
        &self,
        ctx: &RequestContext,
        params: &ListPromptsParams,
    ) -> Result<ListPromptsResult> {
        let ordered = match ctx.session().and_then(|s| s.as_prompts()) {
            Some(prompts) => self.prompts.snapshot_with_overlay(&prompts.session_prompts()),
            None => self.prompts.snapshot(),
        };
        let (entries, next_cursor) =
            paginate(&ordered, params.cursor.as_deref(), self.pagination_limit)?;
        Ok(ListPromptsResult {
            prompts: entries.into_iter().map(|e| e.prompt).collect(),
            next_cursor,
        })
    }

    fn handle_list_resources(
        &self,
        ctx: &RequestContext,
        params: &ListResourcesParams,
    ) -> Result<ListResourcesResult> {
        let ordered = match ctx.session().and_then(|s| s.as_resources()) {
            Some(resources) => self
                .resources
                .snapshot_with_overlay(&resources.session_resources()),
            None => self.resources.snapshot(),
        };
        let (entries, next_cursor) =
            paginate(&ordered, params.cursor.as_deref(), self.pagination_limit)?;
        Ok(ListResourcesResult {
            resources: entries.into_iter().map(|e| e.resource).collect(),
            next_cursor,
        })
    }

    fn handle_list_templates(
        &self,
        ctx: &RequestContext,
        params: &ListResourceTemplatesParams,
    ) -> Result<ListResourceTemplatesResult> {
        let ordered = match ctx.session().and_then(|s| s.as_resources()) {
            Some(resources) => self
                .templates
                .snapshot_with_overlay(&resources.session_templates()),
            None => self.templates.snapshot(),
        };
        let (entries, next_cursor) =
            paginate(&ordered, params.cursor.as_deref(), self.pagination_limit)?;
        Ok(ListResourceTemplatesResult {
            resource_templates: entries.into_iter().map(|e| e.template).collect(),
            next_cursor,
        })
    }

    async fn handle_read_resource(
        &self,
        ctx: &RequestContext,
        params: ReadResourceParams,
    ) -> Result<Value> {
        // Exact URI wins over any template, session overlay first.
        let overlay = ctx.session().and_then(|s| s.as_resources());
        if let Some(resources) = overlay {
            if let Some(entry) = resources.session_resources().get(&params.uri) {
                return to_value(entry.handler.read(ctx.clone(), params).await?);
            }
        }
        if let Some(entry) = self.exact_resource(&params.uri) {
            return to_value(entry.handler.read(ctx.clone(), params).await?);
        }

        // Template candidates: overlay layer first, then global, each in
        // registration order. Longest literal prefix wins; ties keep the
        // earlier candidate.
        let mut candidates: Vec<TemplateEntry> = Vec::new();
        if let Some(resources) = ctx.session().and_then(|s| s.as_resources()) {
            candidates.extend(resources.session_templates().values().cloned());
        }
        candidates.extend(self.templates.snapshot().into_iter().map(|(_, v)| v));

        match best_template_match(&candidates, &params.uri) {
            Some((entry, values)) => {
                let ctx = ctx.clone().with_template_values(values);
                to_value(entry.handler.read(ctx, params).await?)
            },
            None => Err(Error::ResourceNotFound { uri: params.uri }),
        }
    }

    fn exact_resource(&self, uri: &str) -> Option<super::registry::ResourceEntry> {
        if let Some(entry) = self.resources.get(uri) {
            return Some(entry);
        }
        // Scheme and host case differences should not defeat an exact
        // registration.
        url::Url::parse(uri)
            .ok()
            .and_then(|normalized| self.resources.get(normalized.as_str()))
    }

    async fn handle_call_tool(&self, ctx: &RequestContext, params: CallToolParams) -> Result<Value> {
        let entry = self.lookup_tool(&params.name, ctx).ok_or_else(|| {
            Error::invalid_params(format!("tool not found: {}", params.name))
        })?;

        let support = entry.tool.task_support();
        let task_request = params.task.clone();
        match (task_request, support) {
            (Some(_), TaskSupport::None) => Err(Error::invalid_params(format!(
                "tool '{}' does not support task-augmented execution",
                params.name
            ))),
            (None, TaskSupport::Required) => Err(Error::invalid_params(format!(
                "tool '{}' requires task-augmented invocation",
                params.name
            ))),
            (Some(task_params), _) => {
                to_value(self.start_task_call(ctx, entry, params, &task_params)?)
            },
            (None, _) => {
                let result = entry.handler.handle(ctx.clone(), params).await?;
                to_value(result)
            },
        }
    }

    /// Create the task, launch the handler asynchronously, and return
    /// the synchronous `CreateTaskResult` snapshot.
    fn start_task_call(
        &self,
        ctx: &RequestContext,
        entry: ToolEntry,
        mut params: CallToolParams,
        task_params: &TaskRequestParams,
    ) -> Result<CreateTaskResult> {
        let task = self.task_manager.create_task(&params.name, task_params)?;
        let task = self
            .task_manager
            .update_status(&task.task_id, TaskStatus::Working, None)?;
        let token = self.task_manager.cancellation_token(&task.task_id)?;

        params.task = None;
        let handler = Arc::clone(&entry.handler);
        let task_ctx = ctx
            .clone()
            .without_notifier()
            .with_cancellation(token.clone());
        let manager = Arc::clone(&self.task_manager);
        let task_id = task.task_id.clone();

        // The driver holds no reference to the table; it reports through
        // a per-task channel consumed below.
        let (outcome_tx, outcome_rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = handler.handle(task_ctx, params).await;
            let _ = outcome_tx.send(outcome);
        });
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {
                    // cancel_task already owns the terminal transition;
                    // the handler's eventual return is discarded.
                },
                outcome = outcome_rx => {
                    let outcome = outcome.unwrap_or_else(|_| {
                        Err(Error::internal("task driver dropped before completing"))
                    });
                    manager.complete_task(&task_id, outcome);
                },
            }
        });

        Ok(CreateTaskResult { task })
    }
}
