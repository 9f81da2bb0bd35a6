//! JSON-RPC 2.0 envelope types.
//!
//! Everything that crosses the wire is one of three envelope kinds:
//! [`JSONRPCRequest`], [`JSONRPCNotification`], or [`JSONRPCResponse`].
//! [`parse_frame`] discriminates a raw byte frame into one of them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// The JSON-RPC protocol version string carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// A request identifier: an integer or a string.
///
/// Equality is structural; `1` and `"1"` are distinct ids. `Null` appears
/// only on error replies to frames whose id could not be recovered (e.g.
/// a parse error), matching the JSON-RPC convention of `"id": null`.
///
/// # Examples
///
/// ```rust
/// use mcp_runtime::types::RequestId;
///
/// let a = RequestId::from(7i64);
/// let b = RequestId::from("7");
/// assert_ne!(a, b);
/// assert_eq!(serde_json::to_value(&a).unwrap(), serde_json::json!(7));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id.
    Number(i64),
    /// String id.
    String(String),
    /// Absent id, serialized as JSON `null`.
    Null,
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Null => write!(f, "null"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// A JSON-RPC request: carries an id and expects exactly one reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCRequest {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Request id, echoed verbatim on the reply.
    pub id: RequestId,
    /// Method name, e.g. `tools/call`.
    pub method: String,
    /// Method parameters. `Null` when the method takes none.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl JSONRPCRequest {
    /// Build a request envelope.
    pub fn new(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC notification: a method call with no id and no reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCNotification {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Method name, e.g. `notifications/message`.
    pub method: String,
    /// Notification parameters.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl JSONRPCNotification {
    /// Build a notification envelope.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Error details carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCError {
    /// JSON-RPC error code.
    pub code: i32,
    /// Human-readable message.
    pub message: String,
    /// Optional structured data (e.g. elicitation descriptors).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JSONRPCError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// The mutually exclusive `result` / `error` half of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// Successful result value.
    #[serde(rename = "result")]
    Result(Value),
    /// Error details.
    #[serde(rename = "error")]
    Error(JSONRPCError),
}

/// A JSON-RPC response, successful or failed.
///
/// The payload flattens into the envelope, so a success serializes with a
/// top-level `result` key and a failure with a top-level `error` key,
/// never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCResponse {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Id of the request this responds to.
    pub id: RequestId,
    /// Result or error.
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

impl JSONRPCResponse {
    /// Build a successful response.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            payload: ResponsePayload::Result(result),
        }
    }

    /// Build an error response.
    pub fn error(id: RequestId, error: JSONRPCError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            payload: ResponsePayload::Error(error),
        }
    }

    /// The result value, if this is a success.
    pub fn result(&self) -> Option<&Value> {
        match &self.payload {
            ResponsePayload::Result(v) => Some(v),
            ResponsePayload::Error(_) => None,
        }
    }

    /// The error details, if this is a failure.
    pub fn error_details(&self) -> Option<&JSONRPCError> {
        match &self.payload {
            ResponsePayload::Result(_) => None,
            ResponsePayload::Error(e) => Some(e),
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Request: has `method` and `id`.
    Request(JSONRPCRequest),
    /// Notification: has `method` but no `id`.
    Notification(JSONRPCNotification),
    /// Response: has `result` or `error`. Any such frame -- including an
    /// empty `result: {}` pong -- is a response-routing candidate and is
    /// never dispatched as a method call.
    Response(JSONRPCResponse),
}

/// Decode a raw byte frame into a [`Frame`].
///
/// Returns [`Error::Parse`] for malformed JSON and
/// [`Error::InvalidRequest`] for well-formed JSON that is not a JSON-RPC
/// 2.0 envelope.
pub fn parse_frame(raw: &[u8]) -> Result<Frame> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| Error::Parse(format!("parse error: {e}")))?;

    let obj = value
        .as_object()
        .ok_or_else(|| Error::InvalidRequest("envelope must be a JSON object".to_string()))?;

    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {},
        Some(other) => {
            return Err(Error::InvalidRequest(format!(
                "unsupported jsonrpc version: {other}"
            )))
        },
        None => {
            return Err(Error::InvalidRequest(
                "missing jsonrpc version".to_string(),
            ))
        },
    }

    if obj.contains_key("method") {
        if obj.contains_key("id") {
            let request: JSONRPCRequest = serde_json::from_value(value)
                .map_err(|e| Error::InvalidRequest(format!("malformed request: {e}")))?;
            return Ok(Frame::Request(request));
        }
        let notification: JSONRPCNotification = serde_json::from_value(value)
            .map_err(|e| Error::InvalidRequest(format!("malformed notification: {e}")))?;
        return Ok(Frame::Notification(notification));
    }

    if obj.contains_key("result") || obj.contains_key("error") {
        let response: JSONRPCResponse = serde_json::from_value(value)
            .map_err(|e| Error::InvalidRequest(format!("malformed response: {e}")))?;
        return Ok(Frame::Response(response));
    }

    Err(Error::InvalidRequest(
        "envelope has neither method nor result/error".to_string(),
    ))
}
