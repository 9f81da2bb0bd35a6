//! Error types for the MCP runtime.
//!
//! Errors have two surfaces: wire errors delivered as JSON-RPC `error`
//! envelopes, and internal errors returned through [`Result`] to callers
//! of the session, registry, and task APIs. [`Error::to_jsonrpc_error`]
//! is the single place where the internal taxonomy is mapped onto wire
//! codes.

use serde_json::{json, Value};

use crate::types::jsonrpc::JSONRPCError;
use crate::types::protocol::UrlElicitation;
use crate::types::tasks::TaskStatus;

/// JSON-RPC and MCP-specific wire error codes.
pub mod code {
    /// Malformed JSON.
    pub const PARSE_ERROR: i32 = -32700;
    /// Well-formed JSON that is not a valid JSON-RPC envelope.
    pub const INVALID_REQUEST: i32 = -32600;
    /// Unknown method.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Parameters failed to decode or validate.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Handler failure, hook panic, or anything else unclassified.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Context cancellation observed mid-handler.
    pub const REQUEST_INTERRUPTED: i32 = -32001;
    /// No resource or template matched a read URI.
    pub const RESOURCE_NOT_FOUND: i32 = -32002;
    /// Handler needs out-of-band user interaction before it can proceed.
    pub const URL_ELICITATION_REQUIRED: i32 = -32042;
}

/// A `Result` alias using this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Session capability kinds, used by capability-check failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCapability {
    /// Per-session tool overlay.
    Tools,
    /// Per-session resource and template overlay.
    Resources,
    /// Per-session prompt overlay.
    Prompts,
    /// Log level and message delivery.
    Logging,
    /// `roots/list` round-trips to the client.
    Roots,
    /// `sampling/createMessage` round-trips to the client.
    Sampling,
    /// `elicitation/create` round-trips to the client.
    Elicitation,
    /// Declared client info and capabilities.
    ClientInfo,
}

impl std::fmt::Display for SessionCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Tools => "tools",
            Self::Resources => "resources",
            Self::Prompts => "prompts",
            Self::Logging => "logging",
            Self::Roots => "roots",
            Self::Sampling => "sampling",
            Self::Elicitation => "elicitation",
            Self::ClientInfo => "client info",
        };
        write!(f, "{name}")
    }
}

/// All errors produced by the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed JSON on the wire.
    #[error("{0}")]
    Parse(String),

    /// Structurally invalid JSON-RPC envelope.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown method.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Bad or missing parameters.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Internal failure; also the shape panics recover into.
    #[error("{0}")]
    Internal(String),

    /// The request's context was cancelled mid-flight.
    #[error("request interrupted: {0}")]
    Interrupted(String),

    /// No resource or template matched the URI.
    #[error("resource not found: {uri}")]
    ResourceNotFound {
        /// The URI that failed to resolve.
        uri: String,
    },

    /// The server did not echo the client's requested protocol version.
    /// Raised client-side; the server never treats a mismatch as an error.
    #[error("unsupported protocol version: {version} (latest supported: {latest})")]
    UnsupportedProtocolVersion {
        /// The version the peer offered.
        version: String,
        /// The newest version this build supports.
        latest: String,
    },

    /// A session with this id is already registered.
    #[error("session already exists: {0}")]
    SessionExists(String),

    /// No live session with this id.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The session does not implement the required capability mix-in.
    #[error("session {session_id} does not support {capability}")]
    SessionMissingCapability {
        /// Id of the offending session.
        session_id: String,
        /// The capability the operation needed.
        capability: SessionCapability,
    },

    /// Malformed session id presented to the id manager.
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    /// No task with this id (possibly expired).
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Rejected task state machine transition.
    #[error("invalid task transition from {from} to {to} for task {task_id}")]
    InvalidTaskTransition {
        /// The task being transitioned.
        task_id: String,
        /// Current status.
        from: TaskStatus,
        /// Rejected target status.
        to: TaskStatus,
    },

    /// `tasks/result` on a task that has not reached a terminal state.
    #[error("task not in terminal state: {task_id} (status: {status})")]
    TaskNotReady {
        /// The task id.
        task_id: String,
        /// Its current, non-terminal status.
        status: TaskStatus,
    },

    /// The active-task ceiling was hit.
    #[error("max concurrent tasks limit reached ({0})")]
    MaxConcurrentTasks(usize),

    /// A non-blocking send found the session's notification channel full.
    #[error("notification channel full for session {0}")]
    NotificationChannelFull(String),

    /// The handler needs the user to visit a URL before it can continue.
    #[error("URL elicitation required")]
    UrlElicitationRequired {
        /// Descriptors for the interactions the client must perform.
        elicitations: Vec<UrlElicitation>,
    },

    /// The transport closed while a reply was still pending.
    #[error("transport closed")]
    TransportClosed,

    /// JSON encode/decode failure outside frame parsing.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O failure (socket bind, read, write).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for [`Error::InvalidParams`].
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }

    /// Shorthand for [`Error::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// The wire code this error maps to.
    pub fn code(&self) -> i32 {
        match self {
            Self::Parse(_) => code::PARSE_ERROR,
            Self::InvalidRequest(_) => code::INVALID_REQUEST,
            Self::MethodNotFound(_) => code::METHOD_NOT_FOUND,
            Self::InvalidParams(_) | Self::TaskNotReady { .. } | Self::InvalidSessionId(_) => {
                code::INVALID_PARAMS
            },
            Self::TaskNotFound(_) | Self::InvalidTaskTransition { .. } => code::INVALID_PARAMS,
            Self::Interrupted(_) => code::REQUEST_INTERRUPTED,
            Self::ResourceNotFound { .. } => code::RESOURCE_NOT_FOUND,
            Self::UrlElicitationRequired { .. } => code::URL_ELICITATION_REQUIRED,
            // Session and task-limit failures are internal-surface errors;
            // when one does escape to the wire it reads as -32603.
            Self::Internal(_)
            | Self::UnsupportedProtocolVersion { .. }
            | Self::SessionExists(_)
            | Self::SessionNotFound(_)
            | Self::SessionMissingCapability { .. }
            | Self::MaxConcurrentTasks(_)
            | Self::NotificationChannelFull(_)
            | Self::TransportClosed
            | Self::Serialization(_)
            | Self::Io(_) => code::INTERNAL_ERROR,
        }
    }

    /// Structured `data` payload for the wire, when the variant carries one.
    fn wire_data(&self) -> Option<Value> {
        match self {
            Self::UrlElicitationRequired { elicitations } => {
                Some(json!({ "elicitations": elicitations }))
            },
            _ => None,
        }
    }

    /// Convert into the wire error shape.
    pub fn to_jsonrpc_error(&self) -> JSONRPCError {
        JSONRPCError {
            code: self.code(),
            message: self.to_string(),
            data: self.wire_data(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes() {
        assert_eq!(Error::Parse("x".into()).code(), -32700);
        assert_eq!(Error::InvalidRequest("x".into()).code(), -32600);
        assert_eq!(Error::MethodNotFound("x".into()).code(), -32601);
        assert_eq!(Error::invalid_params("x").code(), -32602);
        assert_eq!(Error::internal("x").code(), -32603);
        assert_eq!(Error::Interrupted("x".into()).code(), -32001);
        assert_eq!(
            Error::ResourceNotFound { uri: "a://b".into() }.code(),
            -32002
        );
        assert_eq!(Error::MaxConcurrentTasks(4).code(), -32603);
    }

    #[test]
    fn max_concurrent_message_names_the_limit() {
        let err = Error::MaxConcurrentTasks(8);
        assert_eq!(err.to_string(), "max concurrent tasks limit reached (8)");
    }

    #[test]
    fn session_errors_stay_descriptive() {
        let err = Error::SessionNotFound("s-1".into());
        assert!(err.to_string().contains("session not found"));

        let err = Error::SessionMissingCapability {
            session_id: "s-1".into(),
            capability: SessionCapability::Logging,
        };
        assert!(err.to_string().contains("does not support logging"));
    }

    #[test]
    fn url_elicitation_carries_descriptors() {
        let err = Error::UrlElicitationRequired {
            elicitations: vec![UrlElicitation {
                url: "https://example.com/grant".into(),
                message: Some("grant access".into()),
                elicitation_id: None,
            }],
        };
        let wire = err.to_jsonrpc_error();
        assert_eq!(wire.code, code::URL_ELICITATION_REQUIRED);
        let data = wire.data.unwrap();
        assert_eq!(data["elicitations"][0]["url"], "https://example.com/grant");
    }
}
