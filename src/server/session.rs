//! Per-connection session state and capability mix-ins.
//!
//! A [`Session`] is the narrow surface the dispatcher sees. Capabilities
//! (tool overlays, logging, server-initiated requests) are modeled as
//! separate traits; handlers ask for the one they need via the `as_*`
//! accessors and get a "not supported" error instead of a downcast when
//! the session lacks it.

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result, SessionCapability};
use crate::types::capabilities::ClientCapabilities;
use crate::types::jsonrpc::{JSONRPCNotification, JSONRPCRequest, JSONRPCResponse, RequestId};
use crate::types::protocol::{
    methods, CreateMessageParams, CreateMessageResult, ElicitParams, ElicitResult, Implementation,
    ListRootsResult, LoggingLevel,
};

use super::registry::{PromptEntry, ResourceEntry, TemplateEntry, ToolEntry};

/// Default capacity of a session's outbound event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// An outbound frame queued on a session's channel.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A server-initiated notification.
    Notification(JSONRPCNotification),
    /// A server-initiated request awaiting a client response.
    Request(JSONRPCRequest),
}

/// Pending server-initiated requests awaiting client responses.
///
/// Ids are allocated from a session-local counter and prefixed so they
/// can never collide with client-chosen ids.
pub struct PendingRequests {
    next: AtomicI64,
    slots: Mutex<HashMap<RequestId, oneshot::Sender<JSONRPCResponse>>>,
}

impl PendingRequests {
    fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate an id and a slot for its eventual response.
    pub fn register(&self) -> (RequestId, oneshot::Receiver<JSONRPCResponse>) {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let id = RequestId::String(format!("srv-{n}"));
        let (tx, rx) = oneshot::channel();
        self.slots.lock().insert(id.clone(), tx);
        (id, rx)
    }

    /// Deliver a response to its slot. Returns false when no slot matches.
    pub fn complete(&self, response: JSONRPCResponse) -> bool {
        let sender = self.slots.lock().remove(&response.id);
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop all slots, failing their waiters with a closed-channel error.
    pub fn abort_all(&self) {
        self.slots.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

impl std::fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("slots", &self.slots.lock().len())
            .finish()
    }
}

/// The base session surface.
pub trait Session: Send + Sync {
    /// Unique id across live sessions.
    fn id(&self) -> &str;

    /// Whether `initialize` has completed for this session. Never
    /// reverts once set.
    fn is_initialized(&self) -> bool;

    /// Mark the handshake complete. Called by the transport after the
    /// `initialize` reply has been accepted.
    fn mark_initialized(&self);

    /// Sender half of the session's outbound event channel, if the
    /// session carries one.
    fn event_sender(&self) -> Option<mpsc::Sender<SessionEvent>>;

    /// Route an inbound response frame to a pending server-initiated
    /// request. Returns false when nothing was waiting for it.
    fn complete_pending(&self, _response: JSONRPCResponse) -> bool {
        false
    }

    /// Tool-overlay capability, when supported.
    fn as_tools(&self) -> Option<&dyn SessionWithTools> {
        None
    }

    /// Resource-overlay capability, when supported.
    fn as_resources(&self) -> Option<&dyn SessionWithResources> {
        None
    }

    /// Prompt-overlay capability, when supported.
    fn as_prompts(&self) -> Option<&dyn SessionWithPrompts> {
        None
    }

    /// Logging capability, when supported.
    fn as_logging(&self) -> Option<&dyn SessionWithLogging> {
        None
    }

    /// Roots round-trip capability, when supported.
    fn as_roots(&self) -> Option<&dyn SessionWithRoots> {
        None
    }

    /// Sampling round-trip capability, when supported.
    fn as_sampling(&self) -> Option<&dyn SessionWithSampling> {
        None
    }

    /// Elicitation round-trip capability, when supported.
    fn as_elicitation(&self) -> Option<&dyn SessionWithElicitation> {
        None
    }

    /// Client-info capability, when supported.
    fn as_client_info(&self) -> Option<&dyn SessionWithClientInfo> {
        None
    }
}

/// Per-session tool overlay.
pub trait SessionWithTools: Session {
    /// Add or replace tools visible only to this session.
    fn add_session_tools(&self, entries: Vec<ToolEntry>);
    /// Remove session tools by name. Unknown names are ignored.
    fn delete_session_tools(&self, names: &[String]);
    /// Snapshot of the overlay in registration order.
    fn session_tools(&self) -> IndexMap<String, ToolEntry>;
}

/// Per-session resource and template overlay.
pub trait SessionWithResources: Session {
    /// Add or replace resources visible only to this session.
    fn add_session_resources(&self, entries: Vec<ResourceEntry>);
    /// Remove session resources by URI. Unknown URIs are ignored.
    fn delete_session_resources(&self, uris: &[String]);
    /// Snapshot of the resource overlay in registration order.
    fn session_resources(&self) -> IndexMap<String, ResourceEntry>;
    /// Add or replace templates visible only to this session.
    fn add_session_templates(&self, entries: Vec<TemplateEntry>);
    /// Snapshot of the template overlay in registration order.
    fn session_templates(&self) -> IndexMap<String, TemplateEntry>;
}

/// Per-session prompt overlay.
pub trait SessionWithPrompts: Session {
    /// Add or replace prompts visible only to this session.
    fn add_session_prompts(&self, entries: Vec<PromptEntry>);
    /// Remove session prompts by name. Unknown names are ignored.
    fn delete_session_prompts(&self, names: &[String]);
    /// Snapshot of the overlay in registration order.
    fn session_prompts(&self) -> IndexMap<String, PromptEntry>;
}

/// Session log-level state.
pub trait SessionWithLogging: Session {
    /// The session's minimum level. Defaults to `info`.
    fn log_level(&self) -> LoggingLevel;
    /// Set the session's minimum level.
    fn set_log_level(&self, level: LoggingLevel);
    /// Per-logger override, if one is set.
    fn logger_level(&self, logger: &str) -> Option<LoggingLevel>;
    /// Set a per-logger override.
    fn set_logger_level(&self, logger: String, level: LoggingLevel);
}

/// Ability to ask the client for its filesystem roots.
#[async_trait]
pub trait SessionWithRoots: Session {
    /// Round-trip `roots/list` to the client.
    async fn list_roots(&self) -> Result<ListRootsResult>;
}

/// Ability to ask the client's LLM for a completion.
#[async_trait]
pub trait SessionWithSampling: Session {
    /// Round-trip `sampling/createMessage` to the client.
    async fn create_message(&self, params: CreateMessageParams) -> Result<CreateMessageResult>;
}

/// Ability to ask the client to solicit user input.
#[async_trait]
pub trait SessionWithElicitation: Session {
    /// Round-trip `elicitation/create` to the client.
    async fn elicit(&self, params: ElicitParams) -> Result<ElicitResult>;
}

/// Declared client identity and capabilities.
pub trait SessionWithClientInfo: Session {
    /// The client's implementation info, once initialized.
    fn client_info(&self) -> Option<Implementation>;
    /// The client's declared capabilities, once initialized.
    fn client_capabilities(&self) -> Option<ClientCapabilities>;
    /// Record handshake data on the session.
    fn set_client_info(
        &self,
        info: Option<Implementation>,
        capabilities: Option<ClientCapabilities>,
    );
    /// The negotiated protocol version.
    fn protocol_version(&self) -> Option<String>;
    /// Record the negotiated protocol version.
    fn set_protocol_version(&self, version: String);
}

/// The full-featured session used by the shipped transports.
///
/// Implements every capability mix-in. Overlays use this session's own
/// locks; the capability fields use theirs, so capability checks never
/// block on overlay mutation.
pub struct ServerSession {
    id: String,
    initialized: AtomicBool,
    log_level: RwLock<LoggingLevel>,
    logger_levels: RwLock<HashMap<String, LoggingLevel>>,
    client_info: RwLock<Option<Implementation>>,
    client_capabilities: RwLock<Option<ClientCapabilities>>,
    protocol_version: RwLock<Option<String>>,
    tool_overlay: RwLock<IndexMap<String, ToolEntry>>,
    resource_overlay: RwLock<IndexMap<String, ResourceEntry>>,
    template_overlay: RwLock<IndexMap<String, TemplateEntry>>,
    prompt_overlay: RwLock<IndexMap<String, PromptEntry>>,
    events: mpsc::Sender<SessionEvent>,
    receiver: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    pending: PendingRequests,
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.id)
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl ServerSession {
    /// Create a session with the default event buffer.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_buffer(id, DEFAULT_EVENT_BUFFER)
    }

    /// Create a session with an explicit event-channel capacity.
    pub fn with_buffer(id: impl Into<String>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            id: id.into(),
            initialized: AtomicBool::new(false),
            log_level: RwLock::new(LoggingLevel::Info),
            logger_levels: RwLock::new(HashMap::new()),
            client_info: RwLock::new(None),
            client_capabilities: RwLock::new(None),
            protocol_version: RwLock::new(None),
            tool_overlay: RwLock::new(IndexMap::new()),
            resource_overlay: RwLock::new(IndexMap::new()),
            template_overlay: RwLock::new(IndexMap::new()),
            prompt_overlay: RwLock::new(IndexMap::new()),
            events: tx,
            receiver: Mutex::new(Some(rx)),
            pending: PendingRequests::new(),
        }
    }

    /// Take the receiving half of the event channel. The transport's
    /// writer owns it; a second take returns `None`.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.receiver.lock().take()
    }

    /// Non-blocking push of a notification onto the event channel.
    pub fn try_notify(&self, notification: JSONRPCNotification) -> Result<()> {
        match self.events.try_send(SessionEvent::Notification(notification)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(Error::NotificationChannelFull(self.id.clone()))
            },
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::TransportClosed),
        }
    }

    /// Abort pending server-initiated requests, failing their waiters.
    pub fn abort_pending(&self) {
        self.pending.abort_all();
    }

    fn require_client_capability(&self, capability: SessionCapability) -> Result<()> {
        let capabilities = self.client_capabilities.read();
        let declared = match capability {
            SessionCapability::Roots => {
                capabilities.as_ref().is_some_and(ClientCapabilities::supports_roots)
            },
            SessionCapability::Sampling => capabilities
                .as_ref()
                .is_some_and(ClientCapabilities::supports_sampling),
            SessionCapability::Elicitation => capabilities
                .as_ref()
                .is_some_and(ClientCapabilities::supports_elicitation),
            _ => true,
        };
        if declared {
            Ok(())
        } else {
            Err(Error::SessionMissingCapability {
                session_id: self.id.clone(),
                capability,
            })
        }
    }

    async fn round_trip(&self, method: &str, params: Value) -> Result<JSONRPCResponse> {
        let (id, rx) = self.pending.register();
        let request = JSONRPCRequest::new(id, method, params);
        self.events
            .try_send(SessionEvent::Request(request))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    Error::NotificationChannelFull(self.id.clone())
                },
                mpsc::error::TrySendError::Closed(_) => Error::TransportClosed,
            })?;
        rx.await.map_err(|_| Error::TransportClosed)
    }

    fn expect_result<T: serde::de::DeserializeOwned>(response: JSONRPCResponse) -> Result<T> {
        match response.payload {
            crate::types::jsonrpc::ResponsePayload::Result(value) => {
                serde_json::from_value(value).map_err(Error::from)
            },
            crate::types::jsonrpc::ResponsePayload::Error(e) => {
                Err(Error::internal(format!("client replied with error: {e}")))
            },
        }
    }
}

impl Session for ServerSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    fn event_sender(&self) -> Option<mpsc::Sender<SessionEvent>> {
        Some(self.events.clone())
    }

    fn complete_pending(&self, response: JSONRPCResponse) -> bool {
        self.pending.complete(response)
    }

    fn as_tools(&self) -> Option<&dyn SessionWithTools> {
        Some(self)
    }

    fn as_resources(&self) -> Option<&dyn SessionWithResources> {
        Some(self)
    }

    fn as_prompts(&self) -> Option<&dyn SessionWithPrompts> {
        Some(self)
    }

    fn as_logging(&self) -> Option<&dyn SessionWithLogging> {
        Some(self)
    }

    fn as_roots(&self) -> Option<&dyn SessionWithRoots> {
        Some(self)
    }

    fn as_sampling(&self) -> Option<&dyn SessionWithSampling> {
        Some(self)
    }

    fn as_elicitation(&self) -> Option<&dyn SessionWithElicitation> {
        Some(self)
    }

    fn as_client_info(&self) -> Option<&dyn SessionWithClientInfo> {
        Some(self)
    }
}

impl SessionWithTools for ServerSession {
    fn add_session_tools(&self, entries: Vec<ToolEntry>) {
        let mut overlay = self.tool_overlay.write();
        for entry in entries {
            overlay.insert(entry.tool.name.clone(), entry);
        }
    }

    fn delete_session_tools(&self, names: &[String]) {
        let mut overlay = self.tool_overlay.write();
        for name in names {
            overlay.shift_remove(name);
        }
    }

    fn session_tools(&self) -> IndexMap<String, ToolEntry> {
        self.tool_overlay.read().clone()
    }
}

impl SessionWithResources for ServerSession {
    fn add_session_resources(&self, entries: Vec<ResourceEntry>) {
        let mut overlay = self.resource_overlay.write();
        for entry in entries {
            overlay.insert(entry.resource.uri.clone(), entry);
        }
    }

    fn delete_session_resources(&self, uris: &[String]) {
        let mut overlay = self.resource_overlay.write();
        for uri in uris {
            overlay.shift_remove(uri);
        }
    }

    fn session_resources(&self) -> IndexMap<String, ResourceEntry> {
        self.resource_overlay.read().clone()
    }

    fn add_session_templates(&self, entries: Vec<TemplateEntry>) {
        let mut overlay = self.template_overlay.write();
        for entry in entries {
            overlay.insert(entry.template.uri_template.clone(), entry);
        }
    }

    fn session_templates(&self) -> IndexMap<String, TemplateEntry> {
        self.template_overlay.read().clone()
    }
}

impl SessionWithPrompts for ServerSession {
    fn add_session_prompts(&self, entries: Vec<PromptEntry>) {
        let mut overlay = self.prompt_overlay.write();
        for entry in entries {
            overlay.insert(entry.prompt.name.clone(), entry);
        }
    }

    fn delete_session_prompts(&self, names: &[String]) {
        let mut overlay = self.prompt_overlay.write();
        for name in names {
            overlay.shift_remove(name);
        }
    }

    fn session_prompts(&self) -> IndexMap<String, PromptEntry> {
        self.prompt_overlay.read().clone()
    }
}

impl SessionWithLogging for ServerSession {
    fn log_level(&self) -> LoggingLevel {
        *self.log_level.read()
    }

    fn set_log_level(&self, level: LoggingLevel) {
        *self.log_level.write() = level;
    }

    fn logger_level(&self, logger: &str) -> Option<LoggingLevel> {
        self.logger_levels.read().get(logger).copied()
    }

    fn set_logger_level(&self, logger: String, level: LoggingLevel) {
        self.logger_levels.write().insert(logger, level);
    }
}

#[async_trait]
impl SessionWithRoots for ServerSession {
    async fn list_roots(&self) -> Result<ListRootsResult> {
        self.require_client_capability(SessionCapability::Roots)?;
        let response = self.round_trip(methods::ROOTS_LIST, Value::Null).await?;
        Self::expect_result(response)
    }
}

#[async_trait]
impl SessionWithSampling for ServerSession {
    async fn create_message(&self, params: CreateMessageParams) -> Result<CreateMessageResult> {
        self.require_client_capability(SessionCapability::Sampling)?;
        let response = self
            .round_trip(
                methods::SAMPLING_CREATE_MESSAGE,
                serde_json::to_value(params)?,
            )
            .await?;
        Self::expect_result(response)
    }
}

#[async_trait]
impl SessionWithElicitation for ServerSession {
    async fn elicit(&self, params: ElicitParams) -> Result<ElicitResult> {
        self.require_client_capability(SessionCapability::Elicitation)?;
        let response = self
            .round_trip(methods::ELICITATION_CREATE, serde_json::to_value(params)?)
            .await?;
        Self::expect_result(response)
    }
}

impl SessionWithClientInfo for ServerSession {
    fn client_info(&self) -> Option<Implementation> {
        self.client_info.read().clone()
    }

    fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.client_capabilities.read().clone()
    }

    fn set_client_info(
        &self,
        info: Option<Implementation>,
        capabilities: Option<ClientCapabilities>,
    ) {
        *self.client_info.write() = info;
        *self.client_capabilities.write() = capabilities;
    }

    fn protocol_version(&self) -> Option<String> {
        self.protocol_version.read().clone()
    }

    fn set_protocol_version(&self, version: String) {
        *self.protocol_version.write() = Some(version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::capabilities::RootsCapabilities;
    use serde_json::json;

    #[test]
    fn initialized_flag_is_sticky() {
        let session = ServerSession::new("s-1");
        assert!(!session.is_initialized());
        session.mark_initialized();
        assert!(session.is_initialized());
    }

    #[test]
    fn receiver_can_only_be_taken_once() {
        let session = ServerSession::new("s-1");
        assert!(session.take_receiver().is_some());
        assert!(session.take_receiver().is_none());
    }

    #[test]
    fn full_channel_reports_without_blocking() {
        let session = ServerSession::with_buffer("s-1", 1);
        session
            .try_notify(JSONRPCNotification::new("test/a", Value::Null))
            .unwrap();
        let err = session
            .try_notify(JSONRPCNotification::new("test/b", Value::Null))
            .unwrap_err();
        assert!(matches!(err, Error::NotificationChannelFull(_)));
    }

    #[test]
    fn log_level_defaults_to_info() {
        let session = ServerSession::new("s-1");
        assert_eq!(session.log_level(), LoggingLevel::Info);
        session.set_log_level(LoggingLevel::Error);
        assert_eq!(session.log_level(), LoggingLevel::Error);
    }

    #[tokio::test]
    async fn round_trip_resolves_on_response() {
        let session = Arc::new(ServerSession::new("s-1"));
        session.set_client_info(
            None,
            Some(ClientCapabilities {
                roots: Some(RootsCapabilities { list_changed: false }),
                ..Default::default()
            }),
        );

        let mut receiver = session.take_receiver().unwrap();
        let responder = session.clone();
        let answer = tokio::spawn(async move {
            let event = receiver.recv().await.unwrap();
            let request = match event {
                SessionEvent::Request(request) => request,
                other => panic!("expected request event, got {other:?}"),
            };
            assert_eq!(request.method, methods::ROOTS_LIST);
            let response = JSONRPCResponse::success(
                request.id,
                json!({"roots": [{"uri": "file:///workspace"}]}),
            );
            assert!(responder.complete_pending(response));
        });

        let roots = session.list_roots().await.unwrap();
        assert_eq!(roots.roots.len(), 1);
        assert_eq!(roots.roots[0].uri, "file:///workspace");
        answer.await.unwrap();
        assert_eq!(session.pending.len(), 0);
    }

    #[tokio::test]
    async fn undeclared_capability_is_rejected() {
        let session = ServerSession::new("s-1");
        session.set_client_info(None, Some(ClientCapabilities::default()));
        let err = session.list_roots().await.unwrap_err();
        assert!(matches!(err, Error::SessionMissingCapability { .. }));
    }

    #[test]
    fn unmatched_response_is_reported() {
        let session = ServerSession::new("s-1");
        let response = JSONRPCResponse::success(RequestId::from(123i64), json!({}));
        assert!(!session.complete_pending(response));
    }

    #[test]
    fn tool_overlay_shadows_by_name() {
        use crate::server::ToolHandler;
        use crate::types::protocol::{CallToolParams, CallToolResult, Tool};

        struct Nop;
        #[async_trait]
        impl ToolHandler for Nop {
            async fn handle(
                &self,
                _ctx: crate::server::RequestContext,
                _params: CallToolParams,
            ) -> Result<CallToolResult> {
                Ok(CallToolResult::text("nop"))
            }
        }

        let session = ServerSession::new("s-1");
        let entry = ToolEntry {
            tool: Tool::new("echo", "overlay echo", json!({})),
            handler: Arc::new(Nop),
        };
        session.add_session_tools(vec![entry]);
        assert!(session.session_tools().contains_key("echo"));

        session.delete_session_tools(&["echo".to_string()]);
        assert!(session.session_tools().is_empty());
    }
}
