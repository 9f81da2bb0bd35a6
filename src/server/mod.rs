//! Server-side runtime: registries, sessions, dispatch, tasks, and the
//! streaming HTTP transport.

pub mod dispatcher;
pub mod hooks;
pub mod http;
pub mod notifications;
pub mod registry;
pub mod session;
pub mod session_id;
pub mod sessions;
pub mod tasks;

use async_trait::async_trait;
use ::http::HeaderMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result, SessionCapability};
use crate::types::capabilities::{
    LoggingCapabilities, PromptCapabilities, ResourceCapabilities, ServerCapabilities,
    TaskCapabilities, ToolCapabilities,
};
use crate::types::jsonrpc::{JSONRPCNotification, RequestId};
use crate::types::protocol::{
    methods, CallToolParams, CallToolResult, CreateMessageParams, CreateMessageResult,
    ElicitParams, ElicitResult, GetPromptParams, GetPromptResult, Implementation, ListRootsResult,
    LoggingLevel, LoggingMessageParams, Prompt, ReadResourceParams, ReadResourceResult, Resource,
    ResourceTemplate, TaskSupport, Tool,
};
use crate::uri_template::{TemplateValue, UriTemplate};

use hooks::Hooks;
use notifications::NotificationHub;
use registry::{PromptEntry, Registry, ResourceEntry, TemplateEntry, ToolEntry};
use session::{Session, SessionEvent};
use sessions::SessionManager;
use tasks::{TaskConfig, TaskManager};

/// Handles `tools/call` for one registered tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the tool. Errors become JSON-RPC error envelopes.
    async fn handle(&self, ctx: RequestContext, params: CallToolParams) -> Result<CallToolResult>;
}

/// Handles `resources/read` for a resource or template.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Read the resource. Template captures are on the context.
    async fn read(&self, ctx: RequestContext, params: ReadResourceParams)
        -> Result<ReadResourceResult>;
}

/// Renders `prompts/get` for one registered prompt.
#[async_trait]
pub trait PromptHandler: Send + Sync {
    /// Render the prompt with the given arguments.
    async fn render(&self, ctx: RequestContext, params: GetPromptParams) -> Result<GetPromptResult>;
}

/// Per-request context handed to every handler.
///
/// Carries the resolved session (if any), the transport's request
/// headers as read-only metadata, a cancellation token scoped to the
/// request, and the notification sink handlers write through.
#[derive(Clone)]
pub struct RequestContext {
    request_id: Option<RequestId>,
    headers: HeaderMap,
    session: Option<Arc<dyn Session>>,
    cancellation: CancellationToken,
    notifier: Option<mpsc::UnboundedSender<JSONRPCNotification>>,
    template_values: Arc<HashMap<String, TemplateValue>>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            request_id: None,
            headers: HeaderMap::new(),
            session: None,
            cancellation: CancellationToken::new(),
            notifier: None,
            template_values: Arc::new(HashMap::new()),
        }
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("session", &self.session.as_ref().map(|s| s.id().to_string()))
            .finish_non_exhaustive()
    }
}

impl RequestContext {
    /// An empty context with a fresh cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a session.
    pub fn with_session(mut self, session: Arc<dyn Session>) -> Self {
        self.session = Some(session);
        self
    }

    /// Attach the request id.
    pub fn with_request_id(mut self, id: RequestId) -> Self {
        self.request_id = Some(id);
        self
    }

    /// Attach transport request headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Attach a cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Attach a request-scoped notification sink. Notifications emitted
    /// through this context are captured there instead of the session
    /// channel, which is how the HTTP transport decides between a plain
    /// JSON reply and an SSE stream.
    pub fn with_notifier(mut self, notifier: mpsc::UnboundedSender<JSONRPCNotification>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub(crate) fn without_notifier(mut self) -> Self {
        self.notifier = None;
        self
    }

    pub(crate) fn with_template_values(mut self, values: HashMap<String, TemplateValue>) -> Self {
        self.template_values = Arc::new(values);
        self
    }

    /// The current session, when one is attached.
    pub fn session(&self) -> Option<&Arc<dyn Session>> {
        self.session.as_ref()
    }

    /// The request id, absent for notifications.
    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    /// Read-only transport headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The request-scoped cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the request has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Values captured by the matching resource template, if any.
    pub fn template_values(&self) -> &HashMap<String, TemplateValue> {
        &self.template_values
    }

    /// Emit a server-initiated notification.
    ///
    /// Inside a request this feeds the request's reply stream; otherwise
    /// it goes to the session channel without blocking.
    pub fn notify(&self, method: impl Into<String>, params: Value) -> Result<()> {
        let notification = JSONRPCNotification::new(method, params);
        if let Some(notifier) = &self.notifier {
            if notifier.send(notification.clone()).is_ok() {
                return Ok(());
            }
            // Request stream already closed; fall through to the session.
        }
        match &self.session {
            Some(session) => match session.event_sender() {
                Some(sender) => match sender.try_send(SessionEvent::Notification(notification)) {
                    Ok(()) => Ok(()),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        Err(Error::NotificationChannelFull(session.id().to_string()))
                    },
                    Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::TransportClosed),
                },
                None => Err(Error::TransportClosed),
            },
            None => {
                tracing::debug!(target: "mcp.notify", "notification dropped: no session");
                Ok(())
            },
        }
    }

    /// Emit a `notifications/message` log event, honoring the session's
    /// level floor and per-logger overrides.
    pub fn log(&self, level: LoggingLevel, logger: Option<&str>, data: Value) -> Result<()> {
        if let Some(session) = &self.session {
            if let Some(logging) = session.as_logging() {
                let floor = logger
                    .and_then(|name| logging.logger_level(name))
                    .unwrap_or_else(|| logging.log_level());
                if level < floor {
                    return Ok(());
                }
            }
        }
        let params = LoggingMessageParams {
            level,
            logger: logger.map(str::to_string),
            data,
        };
        self.notify(methods::NOTIF_MESSAGE, serde_json::to_value(params)?)
    }

    fn require_session(&self) -> Result<&Arc<dyn Session>> {
        self.session
            .as_ref()
            .ok_or_else(|| Error::internal("no session attached to request context"))
    }

    /// Ask the client for its filesystem roots.
    pub async fn list_roots(&self) -> Result<ListRootsResult> {
        let session = self.require_session()?;
        let roots = session
            .as_roots()
            .ok_or_else(|| Error::SessionMissingCapability {
                session_id: session.id().to_string(),
                capability: SessionCapability::Roots,
            })?;
        roots.list_roots().await
    }

    /// Ask the client's LLM for a completion.
    pub async fn create_message(&self, params: CreateMessageParams) -> Result<CreateMessageResult> {
        let session = self.require_session()?;
        let sampling = session
            .as_sampling()
            .ok_or_else(|| Error::SessionMissingCapability {
                session_id: session.id().to_string(),
                capability: SessionCapability::Sampling,
            })?;
        sampling.create_message(params).await
    }

    /// Ask the client to solicit user input.
    pub async fn elicit(&self, params: ElicitParams) -> Result<ElicitResult> {
        let session = self.require_session()?;
        let elicitation =
            session
                .as_elicitation()
                .ok_or_else(|| Error::SessionMissingCapability {
                    session_id: session.id().to_string(),
                    capability: SessionCapability::Elicitation,
                })?;
        elicitation.elicit(params).await
    }
}

/// The MCP server: registries, session table, task table, and dispatch.
pub struct Server {
    info: Implementation,
    instructions: Option<String>,
    capabilities: RwLock<ServerCapabilities>,
    pub(crate) tools: Registry<ToolEntry>,
    pub(crate) resources: Registry<ResourceEntry>,
    pub(crate) templates: Registry<TemplateEntry>,
    pub(crate) prompts: Registry<PromptEntry>,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) task_manager: Arc<TaskManager>,
    pub(crate) hooks: Arc<Hooks>,
    pub(crate) hub: NotificationHub,
    pub(crate) recover_panics: bool,
    pub(crate) pagination_limit: Option<usize>,
    pub(crate) event_buffer: usize,
    inflight: RwLock<HashMap<String, CancellationToken>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("info", &self.info)
            .field("tools", &self.tools.len())
            .field("resources", &self.resources.len())
            .field("prompts", &self.prompts.len())
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Start building a server.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Server identity returned from `initialize`.
    pub fn info(&self) -> &Implementation {
        &self.info
    }

    /// Optional instructions returned from `initialize`.
    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    /// Snapshot of the declared capabilities.
    pub fn capabilities(&self) -> ServerCapabilities {
        self.capabilities.read().clone()
    }

    /// The session table.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// The task table.
    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.task_manager
    }

    /// Create a session object sized to this server's event buffer.
    pub fn new_session(&self, id: impl Into<String>) -> Arc<session::ServerSession> {
        Arc::new(session::ServerSession::with_buffer(id, self.event_buffer))
    }

    /// Register a session, firing the register hooks.
    pub fn register_session(&self, session: Arc<dyn Session>) -> Result<()> {
        self.sessions.register(session)
    }

    /// Unregister a session by id, firing the unregister hooks.
    /// Idempotent.
    pub fn unregister_session(&self, id: &str) {
        self.sessions.unregister(id);
    }

    /// Send a notification to one session. Never blocks.
    pub fn notify_one(&self, session_id: &str, method: &str, params: Value) -> Result<()> {
        self.hub.notify_one(session_id, method, params)
    }

    /// Send a notification to all initialized sessions, optionally
    /// filtered. Never blocks.
    pub fn notify_all(
        &self,
        predicate: Option<&dyn Fn(&dyn Session) -> bool>,
        method: &str,
        params: Value,
    ) {
        self.hub.notify_all(predicate, method, params);
    }

    fn tools_list_changed_enabled(&self) -> bool {
        self.capabilities
            .read()
            .tools
            .as_ref()
            .and_then(|c| c.list_changed)
            == Some(true)
    }

    fn resources_list_changed_enabled(&self) -> bool {
        self.capabilities
            .read()
            .resources
            .as_ref()
            .and_then(|c| c.list_changed)
            == Some(true)
    }

    fn prompts_list_changed_enabled(&self) -> bool {
        self.capabilities
            .read()
            .prompts
            .as_ref()
            .and_then(|c| c.list_changed)
            == Some(true)
    }

    /// Register tools at runtime, broadcasting
    /// `notifications/tools/list_changed` when the capability allows.
    pub fn add_tools(&self, entries: Vec<(Tool, Arc<dyn ToolHandler>)>) {
        if entries.is_empty() {
            return;
        }
        {
            let mut capabilities = self.capabilities.write();
            if capabilities.tools.is_none() {
                capabilities.tools = Some(ToolCapabilities {
                    list_changed: Some(true),
                });
            }
            let has_task_tool = entries
                .iter()
                .any(|(tool, _)| tool.task_support() != TaskSupport::None);
            if has_task_tool && capabilities.tasks.is_none() {
                capabilities.tasks = Some(TaskCapabilities::default());
            }
        }
        for (tool, handler) in entries {
            let name = tool.name.clone();
            self.tools.insert(name, ToolEntry { tool, handler });
        }
        if self.tools_list_changed_enabled() {
            self.notify_all(None, methods::NOTIF_TOOLS_LIST_CHANGED, Value::Null);
        }
    }

    /// Register a single tool.
    pub fn add_tool(&self, tool: Tool, handler: Arc<dyn ToolHandler>) {
        self.add_tools(vec![(tool, handler)]);
    }

    /// Remove tools by name, broadcasting a list-changed notification
    /// when anything was removed.
    pub fn delete_tools(&self, names: &[String]) {
        let mut removed = false;
        for name in names {
            removed |= self.tools.remove(name).is_some();
        }
        if removed && self.tools_list_changed_enabled() {
            self.notify_all(None, methods::NOTIF_TOOLS_LIST_CHANGED, Value::Null);
        }
    }

    /// Register resources at runtime.
    pub fn add_resources(&self, entries: Vec<(Resource, Arc<dyn ResourceHandler>)>) {
        if entries.is_empty() {
            return;
        }
        {
            let mut capabilities = self.capabilities.write();
            if capabilities.resources.is_none() {
                capabilities.resources = Some(ResourceCapabilities {
                    list_changed: Some(true),
                });
            }
        }
        for (resource, handler) in entries {
            let uri = resource.uri.clone();
            self.resources.insert(uri, ResourceEntry { resource, handler });
        }
        if self.resources_list_changed_enabled() {
            self.notify_all(None, methods::NOTIF_RESOURCES_LIST_CHANGED, Value::Null);
        }
    }

    /// Register a single resource.
    pub fn add_resource(&self, resource: Resource, handler: Arc<dyn ResourceHandler>) {
        self.add_resources(vec![(resource, handler)]);
    }

    /// Remove resources by URI.
    pub fn delete_resources(&self, uris: &[String]) {
        let mut removed = false;
        for uri in uris {
            removed |= self.resources.remove(uri).is_some();
        }
        if removed && self.resources_list_changed_enabled() {
            self.notify_all(None, methods::NOTIF_RESOURCES_LIST_CHANGED, Value::Null);
        }
    }

    /// Register a resource template. Fails when the pattern does not
    /// compile.
    pub fn add_resource_template(
        &self,
        template: ResourceTemplate,
        handler: Arc<dyn ResourceHandler>,
    ) -> Result<()> {
        let matcher = Arc::new(UriTemplate::parse(&template.uri_template)?);
        {
            let mut capabilities = self.capabilities.write();
            if capabilities.resources.is_none() {
                capabilities.resources = Some(ResourceCapabilities {
                    list_changed: Some(true),
                });
            }
        }
        let key = template.uri_template.clone();
        self.templates.insert(
            key,
            TemplateEntry {
                template,
                matcher,
                handler,
            },
        );
        if self.resources_list_changed_enabled() {
            self.notify_all(None, methods::NOTIF_RESOURCES_LIST_CHANGED, Value::Null);
        }
        Ok(())
    }

    /// Remove resource templates by their URI-template pattern.
    pub fn delete_resource_templates(&self, patterns: &[String]) {
        let mut removed = false;
        for pattern in patterns {
            removed |= self.templates.remove(pattern).is_some();
        }
        if removed && self.resources_list_changed_enabled() {
            self.notify_all(None, methods::NOTIF_RESOURCES_LIST_CHANGED, Value::Null);
        }
    }

    /// Register prompts at runtime.
    pub fn add_prompts(&self, entries: Vec<(Prompt, Arc<dyn PromptHandler>)>) {
        if entries.is_empty() {
            return;
        }
        {
            let mut capabilities = self.capabilities.write();
            if capabilities.prompts.is_none() {
                capabilities.prompts = Some(PromptCapabilities {
                    list_changed: Some(true),
                });
            }
        }
        for (prompt, handler) in entries {
            let name = prompt.name.clone();
            self.prompts.insert(name, PromptEntry { prompt, handler });
        }
        if self.prompts_list_changed_enabled() {
            self.notify_all(None, methods::NOTIF_PROMPTS_LIST_CHANGED, Value::Null);
        }
    }

    /// Register a single prompt.
    pub fn add_prompt(&self, prompt: Prompt, handler: Arc<dyn PromptHandler>) {
        self.add_prompts(vec![(prompt, handler)]);
    }

    /// Remove prompts by name.
    pub fn delete_prompts(&self, names: &[String]) {
        let mut removed = false;
        for name in names {
            removed |= self.prompts.remove(name).is_some();
        }
        if removed && self.prompts_list_changed_enabled() {
            self.notify_all(None, methods::NOTIF_PROMPTS_LIST_CHANGED, Value::Null);
        }
    }

    pub(crate) fn inflight_key(session_id: Option<&str>, request_id: &RequestId) -> String {
        format!("{}:{request_id}", session_id.unwrap_or(""))
    }

    pub(crate) fn register_inflight(&self, key: String, token: CancellationToken) {
        self.inflight.write().insert(key, token);
    }

    pub(crate) fn remove_inflight(&self, key: &str) {
        self.inflight.write().remove(key);
    }

    pub(crate) fn cancel_inflight(&self, key: &str) -> bool {
        match self.inflight.write().remove(key) {
            Some(token) => {
                token.cancel();
                true
            },
            None => false,
        }
    }
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    info: Implementation,
    instructions: Option<String>,
    capabilities: ServerCapabilities,
    tools: Vec<(Tool, Arc<dyn ToolHandler>)>,
    resources: Vec<(Resource, Arc<dyn ResourceHandler>)>,
    templates: Vec<(ResourceTemplate, Arc<dyn ResourceHandler>)>,
    prompts: Vec<(Prompt, Arc<dyn PromptHandler>)>,
    hooks: Hooks,
    recover_panics: bool,
    pagination_limit: Option<usize>,
    event_buffer: usize,
    task_config: TaskConfig,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("info", &self.info)
            .field("tools", &self.tools.len())
            .field("resources", &self.resources.len())
            .field("prompts", &self.prompts.len())
            .finish_non_exhaustive()
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    /// A builder with defaults: panic recovery on, no pagination limit,
    /// unlimited concurrent tasks.
    pub fn new() -> Self {
        Self {
            info: Implementation::new("mcp-runtime", env!("CARGO_PKG_VERSION")),
            instructions: None,
            capabilities: ServerCapabilities::default(),
            tools: Vec::new(),
            resources: Vec::new(),
            templates: Vec::new(),
            prompts: Vec::new(),
            hooks: Hooks::new(),
            recover_panics: true,
            pagination_limit: None,
            event_buffer: session::DEFAULT_EVENT_BUFFER,
            task_config: TaskConfig::default(),
        }
    }

    /// Server name reported in `serverInfo`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.info.name = name.into();
        self
    }

    /// Server version reported in `serverInfo`.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.info.version = version.into();
        self
    }

    /// Instructions surfaced to the model after `initialize`.
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Replace the declared capabilities wholesale. Registrations still
    /// fill in kinds that are absent; an explicit `listChanged: false`
    /// is never flipped.
    pub fn capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Declare the logging capability.
    pub fn with_logging(mut self) -> Self {
        self.capabilities.logging = Some(LoggingCapabilities::default());
        self
    }

    /// Register a tool.
    pub fn tool(mut self, tool: Tool, handler: Arc<dyn ToolHandler>) -> Self {
        self.tools.push((tool, handler));
        self
    }

    /// Register a resource.
    pub fn resource(mut self, resource: Resource, handler: Arc<dyn ResourceHandler>) -> Self {
        self.resources.push((resource, handler));
        self
    }

    /// Register a resource template.
    pub fn resource_template(
        mut self,
        template: ResourceTemplate,
        handler: Arc<dyn ResourceHandler>,
    ) -> Self {
        self.templates.push((template, handler));
        self
    }

    /// Register a prompt.
    pub fn prompt(mut self, prompt: Prompt, handler: Arc<dyn PromptHandler>) -> Self {
        self.prompts.push((prompt, handler));
        self
    }

    /// Install the hook set.
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Toggle panic recovery around handlers and hooks.
    pub fn recover_panics(mut self, recover: bool) -> Self {
        self.recover_panics = recover;
        self
    }

    /// Page size for all list operations. Unset returns full lists.
    pub fn pagination_limit(mut self, limit: usize) -> Self {
        self.pagination_limit = Some(limit);
        self
    }

    /// Capacity of each session's outbound event channel.
    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    /// Ceiling on simultaneously active tasks; `0` means unlimited.
    pub fn max_concurrent_tasks(mut self, limit: usize) -> Self {
        self.task_config.max_concurrent = limit;
        self
    }

    /// Default retention for terminal tasks, in milliseconds.
    pub fn task_ttl_ms(mut self, ttl: u64) -> Self {
        self.task_config.default_ttl_ms = ttl;
        self
    }

    /// Default poll interval suggested to task clients, in milliseconds.
    pub fn task_poll_interval_ms(mut self, interval: u64) -> Self {
        self.task_config.default_poll_interval_ms = Some(interval);
        self
    }

    /// Assemble the server.
    pub fn build(self) -> Arc<Server> {
        let hooks = Arc::new(self.hooks);
        let sessions = Arc::new(SessionManager::new(hooks.clone(), self.recover_panics));
        let hub = NotificationHub::new(sessions.clone(), hooks.clone(), self.recover_panics);
        let task_manager = Arc::new(TaskManager::new(
            self.task_config,
            hooks.clone(),
            self.recover_panics,
        ));

        let server = Arc::new(Server {
            info: self.info,
            instructions: self.instructions,
            capabilities: RwLock::new(self.capabilities),
            tools: Registry::new(),
            resources: Registry::new(),
            templates: Registry::new(),
            prompts: Registry::new(),
            sessions,
            task_manager,
            hooks,
            hub,
            recover_panics: self.recover_panics,
            pagination_limit: self.pagination_limit,
            event_buffer: self.event_buffer,
            inflight: RwLock::new(HashMap::new()),
        });

        // Seed registries through the same paths used at runtime so the
        // implicit capability rules apply uniformly. There are no
        // sessions yet, so no list-changed traffic results.
        server.add_tools(self.tools);
        server.add_resources(self.resources);
        for (template, handler) in self.templates {
            if let Err(e) = server.add_resource_template(template, handler) {
                tracing::warn!(target: "mcp.server", error = %e, "skipping invalid resource template");
            }
        }
        server.add_prompts(self.prompts);
        server
    }
}
