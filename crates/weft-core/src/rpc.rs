//! JSON-RPC 2.0 frames as they cross weft channels.
//!
//! A frame is one JSON value. Classification looks only at the `id`,
//! `method`, `result`, and `error` members; everything else rides along
//! untouched so that relays never strip fields they do not understand.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// The protocol version stamped on every frame weft originates.
pub const JSONRPC_VERSION: &str = "2.0";

/// Methods recognized on the hub surface. Anything else is answered with
/// [`code::METHOD_NOT_FOUND`] and never forwarded.
pub mod method {
    /// Client/server capability handshake.
    pub const INITIALIZE: &str = "initialize";
    /// Post-handshake acknowledgement notification.
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Catalog listing.
    pub const TOOLS_LIST: &str = "tools/list";
    /// Tool invocation.
    pub const TOOLS_CALL: &str = "tools/call";
    /// Server-side notification that its tool list changed.
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
}

/// JSON-RPC error codes produced on the hub surface.
pub mod code {
    /// A frame was not valid JSON.
    pub const PARSE_ERROR: i64 = -32700;
    /// Unknown or disabled method/tool.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Router-side invariant failure.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// A pending request exceeded its deadline.
    pub const REQUEST_TIMEOUT: i64 = -32001;
    /// The tool server backing a pending request disconnected.
    pub const BACKEND_CLOSED: i64 = -32002;
}

/// Reserved integer id spaces.
///
/// Requesters choose their own ids, so weft-originated requests live in
/// ranges no sane client reaches: the hub router rewrites browser ids
/// into the router space to avoid collisions across browsers, and the
/// bridge injects discovery requests in its own space so their responses
/// can be intercepted instead of forwarded.
pub mod reserved {
    use super::RpcId;

    /// First id the hub router assigns when rewriting a browser request.
    pub const ROUTER_ID_BASE: i64 = 1_000_000_000;
    /// First id the bridge uses for injected `tools/list` discovery.
    pub const DISCOVERY_ID_BASE: i64 = 2_000_000_000;

    /// Whether `id` falls in the bridge discovery space.
    #[must_use]
    pub fn is_discovery(id: &RpcId) -> bool {
        matches!(id, RpcId::Int(n) if *n >= DISCOVERY_ID_BASE)
    }

    /// Whether `id` falls in the hub router space.
    #[must_use]
    pub fn is_router(id: &RpcId) -> bool {
        matches!(id, RpcId::Int(n) if *n >= ROUTER_ID_BASE && *n < DISCOVERY_ID_BASE)
    }
}

/// A request/response identifier: an integer or a string, chosen by the
/// requester and echoed verbatim by the responder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    /// Integer identifier.
    Int(i64),
    /// String identifier.
    Str(String),
}

impl RpcId {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Int),
            Value::String(s) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }

    /// The raw JSON value for this id.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(n) => Value::from(*n),
            Self::Str(s) => Value::from(s.clone()),
        }
    }
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RpcId {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<&str> for RpcId {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

/// What kind of frame a JSON value is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// Request: has `method` and `id`.
    Request {
        /// Requester-chosen identifier.
        id: RpcId,
        /// Method name.
        method: String,
    },
    /// Notification: has `method`, no `id`.
    Notification {
        /// Method name.
        method: String,
    },
    /// Response: has `id` and `result` or `error`.
    Response {
        /// Identifier echoed from the request.
        id: RpcId,
        /// Whether the response carries an `error` member.
        is_error: bool,
    },
}

/// Frame shape violations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    /// The frame was not a JSON object.
    #[error("frame is not a JSON object")]
    NotAnObject,
    /// The `id` member was present but neither integer nor string.
    #[error("frame id is neither an integer nor a string")]
    BadId,
    /// The object carried neither a request nor a response shape.
    #[error("frame is not a JSON-RPC request, response, or notification")]
    UnknownShape,
}

/// Classify a frame without consuming it.
///
/// # Errors
///
/// Returns [`FrameError`] when the value is not a JSON-RPC frame.
pub fn classify(frame: &Value) -> Result<FrameKind, FrameError> {
    let obj = frame.as_object().ok_or(FrameError::NotAnObject)?;

    let id = match obj.get("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(RpcId::from_value(raw).ok_or(FrameError::BadId)?),
    };

    if let Some(Value::String(m)) = obj.get("method") {
        return Ok(match id {
            Some(id) => FrameKind::Request {
                id,
                method: m.clone(),
            },
            None => FrameKind::Notification { method: m.clone() },
        });
    }

    if obj.contains_key("result") || obj.contains_key("error") {
        let id = id.ok_or(FrameError::UnknownShape)?;
        return Ok(FrameKind::Response {
            id,
            is_error: obj.contains_key("error"),
        });
    }

    Err(FrameError::UnknownShape)
}

/// Replace a frame's `id` in place, leaving every other member intact.
pub fn set_id(frame: &mut Value, id: &RpcId) {
    if let Some(obj) = frame.as_object_mut() {
        obj.insert("id".to_string(), id.to_value());
    }
}

/// Build a request frame.
#[must_use]
pub fn request(id: impl Into<RpcId>, method: &str, params: Option<Value>) -> Value {
    let mut frame = json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id.into().to_value(),
        "method": method,
    });
    if let (Some(obj), Some(params)) = (frame.as_object_mut(), params) {
        obj.insert("params".to_string(), params);
    }
    frame
}

/// Build a notification frame.
#[must_use]
pub fn notification(method: &str, params: Option<Value>) -> Value {
    let mut frame = json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
    });
    if let (Some(obj), Some(params)) = (frame.as_object_mut(), params) {
        obj.insert("params".to_string(), params);
    }
    frame
}

/// Build a success response frame.
#[must_use]
pub fn response(id: &RpcId, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id.to_value(),
        "result": result,
    })
}

/// Build an error response frame.
#[must_use]
pub fn error_response(id: &RpcId, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id.to_value(),
        "error": { "code": code, "message": message },
    })
}
