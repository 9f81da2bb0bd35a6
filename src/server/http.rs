//! Streaming HTTP transport: one endpoint, three verbs.
//!
//! POST carries JSON-RPC frames in; the reply is plain JSON unless the
//! handler produced server-initiated notifications during execution, in
//! which case the reply upgrades to an SSE stream (notifications in
//! order, then the final reply event). GET opens the long-lived SSE
//! stream fed by the session's event channel. DELETE terminates a
//! stateful session.

use axum::{
    body::Body,
    extract::State,
    response::{sse::Event, IntoResponse, Response, Sse},
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::StreamExt;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::jsonrpc::{parse_frame, Frame, JSONRPCNotification};
use crate::types::protocol::methods;
use crate::LATEST_PROTOCOL_VERSION;

use super::session::{ServerSession, Session, SessionEvent, SessionWithClientInfo};
use super::session_id::{
    InsecureStatefulSessionIdManager, SessionIdManager, StatelessGeneratingSessionIdManager,
    StatelessSessionIdManager,
};
use super::{RequestContext, Server};

/// Request/response header carrying the session id.
pub const MCP_SESSION_ID: &str = "mcp-session-id";
/// Response header carrying the negotiated protocol version.
pub const MCP_PROTOCOL_VERSION: &str = "mcp-protocol-version";

const APPLICATION_JSON: &str = "application/json";
const TEXT_EVENT_STREAM: &str = "text/event-stream";

/// How the transport treats session identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// No ids at all; every request is anonymous and ephemeral.
    Stateless,
    /// Fresh id per initialize, nothing remembered server-side.
    StatelessGenerating,
    /// Ids are tracked and validated; DELETE terminates them.
    Stateful,
}

/// Configuration for [`StreamableHttpServer`].
pub struct StreamableHttpConfig {
    /// Session identity policy.
    pub mode: SessionMode,
    /// Id strategy; pick one matching the mode.
    pub session_id_manager: Arc<dyn SessionIdManager>,
    /// When true, GET always answers 405 and no SSE stream ever opens.
    pub disable_streaming: bool,
}

impl std::fmt::Debug for StreamableHttpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpConfig")
            .field("mode", &self.mode)
            .field("disable_streaming", &self.disable_streaming)
            .finish()
    }
}

impl Default for StreamableHttpConfig {
    fn default() -> Self {
        Self::stateless_generating()
    }
}

impl StreamableHttpConfig {
    /// Anonymous sessions, no ids on the wire.
    pub fn stateless() -> Self {
        Self {
            mode: SessionMode::Stateless,
            session_id_manager: Arc::new(StatelessSessionIdManager),
            disable_streaming: false,
        }
    }

    /// The default: ids are issued but not remembered.
    pub fn stateless_generating() -> Self {
        Self {
            mode: SessionMode::StatelessGenerating,
            session_id_manager: Arc::new(StatelessGeneratingSessionIdManager),
            disable_streaming: false,
        }
    }

    /// Tracked `mcp-session-<uuid>` ids with termination.
    pub fn stateful() -> Self {
        Self {
            mode: SessionMode::Stateful,
            session_id_manager: Arc::new(InsecureStatefulSessionIdManager::new()),
            disable_streaming: false,
        }
    }

    /// Refuse all GET streams.
    pub fn with_disable_streaming(mut self, disable: bool) -> Self {
        self.disable_streaming = disable;
        self
    }
}

#[derive(Clone)]
struct HttpState {
    server: Arc<Server>,
    config: Arc<StreamableHttpConfig>,
    /// Transport-level set of sessions with live channels.
    active: Arc<RwLock<HashMap<String, Arc<ServerSession>>>>,
}

struct Lifecycle {
    started: bool,
    bound: Option<SocketAddr>,
    shutdown: Option<oneshot::Sender<()>>,
}

/// The streaming HTTP front end for a [`Server`].
pub struct StreamableHttpServer {
    addr: SocketAddr,
    state: HttpState,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl std::fmt::Debug for StreamableHttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpServer")
            .field("addr", &self.addr)
            .field("config", &self.state.config)
            .finish_non_exhaustive()
    }
}

impl StreamableHttpServer {
    /// Bind address plus default (stateless-generating) config.
    pub fn new(addr: SocketAddr, server: Arc<Server>) -> Self {
        Self::with_config(addr, server, StreamableHttpConfig::default())
    }

    /// Bind address plus explicit config.
    pub fn with_config(addr: SocketAddr, server: Arc<Server>, config: StreamableHttpConfig) -> Self {
        Self {
            addr,
            state: HttpState {
                server,
                config: Arc::new(config),
                active: Arc::new(RwLock::new(HashMap::new())),
            },
            lifecycle: tokio::sync::Mutex::new(Lifecycle {
                started: false,
                bound: None,
                shutdown: None,
            }),
        }
    }

    /// Start serving. Idempotent: a second call returns the bound
    /// address of the first; a failed bind leaves the server startable.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.started {
            return lifecycle
                .bound
                .ok_or_else(|| Error::internal("started without a bound address"));
        }

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        let bound = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let app = router(self.state.clone());
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                tracing::warn!(target: "mcp.http", error = %e, "http server exited with error");
            }
        });

        lifecycle.started = true;
        lifecycle.bound = Some(bound);
        lifecycle.shutdown = Some(shutdown_tx);
        tracing::debug!(target: "mcp.http", addr = %bound, "streamable http server started");
        Ok(bound)
    }

    /// Stop serving. Idempotent and safe to call concurrently.
    pub async fn close(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(shutdown) = lifecycle.shutdown.take() {
            let _ = shutdown.send(());
        }
        lifecycle.started = false;
        lifecycle.bound = None;
    }

    /// The address the server is bound to, once started.
    pub async fn bound_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().await.bound
    }
}

fn router(state: HttpState) -> Router {
    Router::new()
        .route(
            "/",
            post(handle_post)
                .get(handle_get)
                .delete(handle_delete)
                .options(handle_options),
        )
        .with_state(state)
}

fn add_cors_headers(headers: &mut HeaderMap) {
    headers.insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("Content-Type, Accept, mcp-session-id, mcp-protocol-version"),
    );
    headers.insert(
        "Access-Control-Expose-Headers",
        HeaderValue::from_static("mcp-session-id, mcp-protocol-version"),
    );
}

fn error_response(status: StatusCode, code: i32, message: &str) -> Response {
    let body = json!({
        "jsonrpc": "2.0",
        "error": { "code": code, "message": message },
        "id": null
    });
    let mut response = (status, Json(body)).into_response();
    add_cors_headers(response.headers_mut());
    response
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn event_for(frame_json: String) -> Event {
    Event::default()
        .id(Uuid::new_v4().to_string())
        .event("message")
        .data(frame_json)
}

fn session_event_json(event: &SessionEvent) -> Option<String> {
    let serialized = match event {
        SessionEvent::Notification(n) => serde_json::to_string(n),
        SessionEvent::Request(r) => serde_json::to_string(r),
    };
    match serialized {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::warn!(target: "mcp.http", error = %e, "failed to serialize outbound frame");
            None
        },
    }
}

/// Resolution of the session a POST/GET/DELETE applies to.
enum Resolved {
    /// A live (or synthesized) session, plus the id to echo, if any.
    Session(Arc<ServerSession>, Option<String>),
    /// Terminate the request with this response.
    Reject(Response),
}

fn resolve_session(state: &HttpState, headers: &HeaderMap, is_init: bool) -> Resolved {
    let header_id = header_value(headers, MCP_SESSION_ID);

    match state.config.mode {
        SessionMode::Stateless => {
            // Header ignored entirely; anonymous per-request session.
            let session = ephemeral_session(state, !is_init);
            Resolved::Session(session, None)
        },
        SessionMode::StatelessGenerating => {
            if is_init {
                let id = state.config.session_id_manager.generate();
                let session = register_session(state, id.clone());
                return Resolved::Session(session, Some(id));
            }
            match header_id {
                None => {
                    let session = ephemeral_session(state, true);
                    Resolved::Session(session, None)
                },
                Some(id) => {
                    if let Some(session) = state.active.read().get(&id).cloned() {
                        return Resolved::Session(session, Some(id));
                    }
                    if state.config.session_id_manager.validate(&id).is_err() {
                        return Resolved::Reject(error_response(
                            StatusCode::NOT_FOUND,
                            -32600,
                            "Invalid session ID",
                        ));
                    }
                    // Well-formed but unremembered: adopt it.
                    let session = register_session(state, id.clone());
                    session.mark_initialized();
                    Resolved::Session(session, Some(id))
                },
            }
        },
        SessionMode::Stateful => {
            if is_init {
                if let Some(id) = &header_id {
                    if state.active.read().contains_key(id) {
                        return Resolved::Reject(error_response(
                            StatusCode::BAD_REQUEST,
                            -32600,
                            "Session already initialized",
                        ));
                    }
                }
                let id = state.config.session_id_manager.generate();
                let session = register_session(state, id.clone());
                return Resolved::Session(session, Some(id));
            }

            let Some(id) = header_id else {
                return Resolved::Reject(error_response(
                    StatusCode::NOT_FOUND,
                    -32600,
                    "Invalid session ID",
                ));
            };
            match state.config.session_id_manager.validate(&id) {
                Err(_) => Resolved::Reject(error_response(
                    StatusCode::NOT_FOUND,
                    -32600,
                    "Invalid session ID",
                )),
                Ok(true) => Resolved::Reject(error_response(
                    StatusCode::NOT_FOUND,
                    -32600,
                    "Session terminated",
                )),
                Ok(false) => match state.active.read().get(&id).cloned() {
                    Some(session) => Resolved::Session(session, Some(id)),
                    None => Resolved::Reject(error_response(
                        StatusCode::NOT_FOUND,
                        -32600,
                        "Invalid session ID",
                    )),
                },
            }
        },
    }
}

fn ephemeral_session(state: &HttpState, initialized: bool) -> Arc<ServerSession> {
    let session = state.server.new_session(Uuid::new_v4().to_string());
    if initialized {
        session.mark_initialized();
    }
    session
}

fn register_session(state: &HttpState, id: String) -> Arc<ServerSession> {
    let session = state.server.new_session(id.clone());
    if let Err(e) = state.server.register_session(session.clone()) {
        // Duplicate registration can only race another request adopting
        // the same unremembered id; fall back to the winner.
        tracing::debug!(target: "mcp.http", error = %e, "session registration raced");
        if let Some(existing) = state.active.read().get(&id).cloned() {
            return existing;
        }
    }
    state.active.write().insert(id, session.clone());
    session
}

fn protocol_version_for(session: &Arc<ServerSession>) -> String {
    session
        .protocol_version()
        .unwrap_or_else(|| LATEST_PROTOCOL_VERSION.to_string())
}

fn apply_common_headers(
    response: &mut Response,
    echo_id: Option<&String>,
    protocol_version: &str,
) {
    add_cors_headers(response.headers_mut());
    if let Some(id) = echo_id {
        if let Ok(value) = HeaderValue::from_str(id) {
            response.headers_mut().insert(MCP_SESSION_ID, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(protocol_version) {
        response.headers_mut().insert(MCP_PROTOCOL_VERSION, value);
    }
}

async fn handle_post(State(state): State<HttpState>, request: axum::extract::Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let headers = parts.headers;

    let content_type = header_value(&headers, header::CONTENT_TYPE.as_str()).unwrap_or_default();
    if !content_type.contains(APPLICATION_JSON) {
        return error_response(
            StatusCode::BAD_REQUEST,
            -32700,
            "Content-Type must be application/json",
        );
    }

    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                -32700,
                &format!("failed to read body: {e}"),
            )
        },
    };

    let frame = match parse_frame(&body_bytes) {
        Ok(frame) => frame,
        Err(e) => {
            let wire = e.to_jsonrpc_error();
            return error_response(StatusCode::BAD_REQUEST, wire.code, &wire.message);
        },
    };

    let is_init = matches!(&frame, Frame::Request(r) if r.method == methods::INITIALIZE);

    let (session, echo_id) = match resolve_session(&state, &headers, is_init) {
        Resolved::Session(session, echo_id) => (session, echo_id),
        Resolved::Reject(response) => return response,
    };

    match frame {
        Frame::Notification(notification) => {
            let ctx = RequestContext::new()
                .with_session(session.clone() as Arc<dyn Session>)
                .with_headers(headers);
            state.server.handle_notification(notification, ctx).await;
            let mut response = StatusCode::ACCEPTED.into_response();
            apply_common_headers(&mut response, echo_id.as_ref(), &protocol_version_for(&session));
            response
        },
        Frame::Response(client_response) => {
            let ctx = RequestContext::new()
                .with_session(session.clone() as Arc<dyn Session>)
                .with_headers(headers);
            state.server.route_client_response(client_response, &ctx);
            let mut response = StatusCode::OK.into_response();
            apply_common_headers(&mut response, echo_id.as_ref(), &protocol_version_for(&session));
            response
        },
        Frame::Request(request) => {
            let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<JSONRPCNotification>();
            let ctx = RequestContext::new()
                .with_session(session.clone() as Arc<dyn Session>)
                .with_headers(headers)
                .with_request_id(request.id.clone())
                .with_cancellation(CancellationToken::new())
                .with_notifier(notify_tx);

            let reply = state.server.handle_request(request, ctx).await;

            // The handshake completes when the reply is handed to the
            // transport; only then does the session accept other methods.
            if is_init && reply.result().is_some() {
                session.mark_initialized();
            }

            // Drain notifications the handler produced, plus anything a
            // spawned clone queued between handler return and now.
            let mut notifications = Vec::new();
            while let Ok(notification) = notify_rx.try_recv() {
                notifications.push(notification);
            }

            let protocol_version = protocol_version_for(&session);
            if notifications.is_empty() {
                let mut response = match serde_json::to_value(&reply) {
                    Ok(value) => (StatusCode::OK, Json(value)).into_response(),
                    Err(e) => {
                        return error_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            -32603,
                            &format!("failed to serialize response: {e}"),
                        )
                    },
                };
                apply_common_headers(&mut response, echo_id.as_ref(), &protocol_version);
                response
            } else {
                let mut events: Vec<std::result::Result<Event, Infallible>> = Vec::new();
                for notification in &notifications {
                    match serde_json::to_string(notification) {
                        Ok(json) => events.push(Ok(event_for(json))),
                        Err(e) => {
                            tracing::warn!(target: "mcp.http", error = %e, "dropping unserializable notification");
                        },
                    }
                }
                let reply_json = match serde_json::to_string(&reply) {
                    Ok(json) => json,
                    Err(e) => {
                        return error_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            -32603,
                            &format!("failed to serialize response: {e}"),
                        )
                    },
                };
                events.push(Ok(event_for(reply_json)));

                let mut response =
                    Sse::new(futures_util::stream::iter(events)).into_response();
                apply_common_headers(&mut response, echo_id.as_ref(), &protocol_version);
                response
                    .headers_mut()
                    .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
                response
            }
        },
    }
}

async fn handle_get(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    if state.config.disable_streaming {
        return error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            -32601,
            "Streaming is disabled on this server",
        );
    }
    if state.config.mode == SessionMode::Stateless {
        return error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            -32601,
            "SSE not supported in stateless mode",
        );
    }

    let accept = header_value(&headers, header::ACCEPT.as_str()).unwrap_or_default();
    if !accept.contains(TEXT_EVENT_STREAM) {
        // A client that cannot consume a stream gets a hard refusal and
        // its session is dropped from the active set.
        if let Some(id) = header_value(&headers, MCP_SESSION_ID) {
            state.active.write().remove(&id);
            state.server.unregister_session(&id);
        }
        return error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            -32601,
            "Streaming unsupported",
        );
    }

    let (session, echo_id) = match resolve_session(&state, &headers, false) {
        Resolved::Session(session, echo_id) => (session, echo_id),
        Resolved::Reject(response) => return response,
    };

    let Some(receiver) = session.take_receiver() else {
        return error_response(
            StatusCode::CONFLICT,
            -32600,
            "SSE stream already exists for this session",
        );
    };

    let stream = ReceiverStream::new(receiver).filter_map(|event| async move {
        session_event_json(&event).map(|json| Ok::<_, Infallible>(event_for(json)))
    });

    let mut response = Sse::new(stream).into_response();
    apply_common_headers(&mut response, echo_id.as_ref(), &protocol_version_for(&session));
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    response
}

async fn handle_delete(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    if state.config.mode != SessionMode::Stateful {
        return error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            -32601,
            "Session termination not supported",
        );
    }

    let Some(id) = header_value(&headers, MCP_SESSION_ID) else {
        return error_response(StatusCode::NOT_FOUND, -32600, "Invalid session ID");
    };

    match state.config.session_id_manager.validate(&id) {
        Err(_) => {
            return error_response(StatusCode::NOT_FOUND, -32600, "Invalid session ID");
        },
        Ok(true) => {
            return error_response(StatusCode::NOT_FOUND, -32600, "Session terminated");
        },
        Ok(false) => {},
    }

    // Drop the transport's handle, unregister (firing hooks), and mark
    // the id terminated. The session's channel closes once the SSE
    // writer has drained and released its receiver.
    let removed = state.active.write().remove(&id);
    if let Some(session) = &removed {
        session.abort_pending();
    }
    state.server.unregister_session(&id);
    if let Err(e) = state.config.session_id_manager.terminate(&id) {
        tracing::debug!(target: "mcp.http", error = %e, "terminate after unregister failed");
    }

    let mut response = (StatusCode::OK, Json(json!({"status": "ok"}))).into_response();
    add_cors_headers(response.headers_mut());
    response
}

async fn handle_options() -> Response {
    let mut headers = HeaderMap::new();
    add_cors_headers(&mut headers);
    headers.insert("Access-Control-Max-Age", HeaderValue::from_static("86400"));
    (StatusCode::OK, headers, "").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_constructors_pick_matching_modes() {
        assert_eq!(StreamableHttpConfig::stateless().mode, SessionMode::Stateless);
        assert_eq!(
            StreamableHttpConfig::stateless_generating().mode,
            SessionMode::StatelessGenerating
        );
        assert_eq!(StreamableHttpConfig::stateful().mode, SessionMode::Stateful);
        assert!(
            StreamableHttpConfig::default()
                .with_disable_streaming(true)
                .disable_streaming
        );
    }

    #[test]
    fn stateless_resolution_ignores_headers() {
        let server = Server::builder().build();
        let state = HttpState {
            server,
            config: Arc::new(StreamableHttpConfig::stateless()),
            active: Arc::new(RwLock::new(HashMap::new())),
        };
        let mut headers = HeaderMap::new();
        headers.insert(MCP_SESSION_ID, HeaderValue::from_static("whatever"));

        match resolve_session(&state, &headers, false) {
            Resolved::Session(session, echo) => {
                assert!(echo.is_none());
                assert!(session.is_initialized());
            },
            Resolved::Reject(_) => panic!("stateless must never reject"),
        }
        assert!(state.active.read().is_empty());
    }

    #[test]
    fn stateful_resolution_requires_known_id() {
        let server = Server::builder().build();
        let state = HttpState {
            server,
            config: Arc::new(StreamableHttpConfig::stateful()),
            active: Arc::new(RwLock::new(HashMap::new())),
        };

        // Initialize creates and registers.
        let (id, session) = match resolve_session(&state, &HeaderMap::new(), true) {
            Resolved::Session(session, Some(id)) => (id, session),
            _ => panic!("initialize must yield a session id"),
        };
        assert!(!session.is_initialized());
        assert!(state.active.read().contains_key(&id));

        // Non-init without the header is rejected.
        assert!(matches!(
            resolve_session(&state, &HeaderMap::new(), false),
            Resolved::Reject(_)
        ));

        // With the header it resolves to the same session.
        let mut headers = HeaderMap::new();
        headers.insert(MCP_SESSION_ID, HeaderValue::from_str(&id).unwrap());
        match resolve_session(&state, &headers, false) {
            Resolved::Session(found, echo) => {
                assert_eq!(found.id(), session.id());
                assert_eq!(echo.as_deref(), Some(id.as_str()));
            },
            Resolved::Reject(_) => panic!("known id must resolve"),
        }
    }
}
