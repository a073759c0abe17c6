//! JSON-RPC 2.0 envelope types.
//!
//! The same envelope shape is used at the HTTP boundary and on the worker's
//! stdio. Inbound worker messages keep the exact bytes they were parsed from,
//! so a response can be relayed to the HTTP caller verbatim.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use serde_json::Value;
use tokio_util::bytes::Bytes;

pub const JSONRPC_VERSION: &str = "2.0";

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// Internal JSON-RPC error.
pub const INTERNAL_ERROR: i64 = -32603;

/// The literal `"2.0"` protocol marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version;

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
        if version == JSONRPC_VERSION {
            Ok(Version)
        } else {
            Err(de::Error::invalid_value(
                de::Unexpected::Str(&version),
                &"\"2.0\"",
            ))
        }
    }
}

/// Request identifier. `null` and absent ids are represented as `None` by callers.
///
/// Numbers keep their JSON form, so fractional and `u64` ids match the
/// worker's echo exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(serde_json::Number),
    String(String),
}

impl RequestId {
    /// Fresh identifier for requests that arrive without one.
    pub fn generate() -> Self {
        Self::String(uuid::Uuid::new_v4().to_string())
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self::Number(id.into())
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::String(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self::String(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => write!(f, "{:?}", s),
        }
    }
}

/// Outbound request (or notification when `id` is `None`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: Option<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Version,
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse error")
    }

    pub fn request_timeout() -> Self {
        Self::new(INTERNAL_ERROR, "Request timeout")
    }

    pub fn worker_unavailable() -> Self {
        Self::new(INTERNAL_ERROR, "Worker unavailable")
    }

    pub fn duplicate_id() -> Self {
        Self::new(INVALID_REQUEST, "Duplicate request id")
    }

    pub fn request_too_large() -> Self {
        Self::new(INVALID_REQUEST, "Request body too large")
    }
}

/// Error envelope. `id` serializes as `null` when unknown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorResponse {
    pub jsonrpc: Version,
    pub error: ErrorObject,
    pub id: Option<RequestId>,
}

impl ErrorResponse {
    pub fn new(id: Option<RequestId>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: Version,
            error,
            id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing or unsupported jsonrpc version")]
    Version,
    #[error("invalid id: {0}")]
    Id(serde_json::Error),
    #[error("not a request, notification, or response")]
    Shape,
}

/// What a framed message is.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    Request { method: String },
    Notification { method: String },
    Result,
    Error(ErrorObject),
}

/// One parsed protocol message from the worker.
#[derive(Debug, Clone)]
pub struct Message {
    id: Option<RequestId>,
    kind: MessageKind,
    raw: Bytes,
}

impl Message {
    pub fn parse(raw: Bytes) -> Result<Self, MessageError> {
        let object: serde_json::Map<String, Value> = serde_json::from_slice(&raw)?;

        if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(MessageError::Version);
        }

        let id = match object.get("id") {
            None | Some(Value::Null) => None,
            Some(value) => Some(RequestId::deserialize(value).map_err(MessageError::Id)?),
        };

        let kind = if let Some(method) = object.get("method") {
            let method = method.as_str().ok_or(MessageError::Shape)?.to_string();
            if id.is_some() {
                MessageKind::Request { method }
            } else {
                MessageKind::Notification { method }
            }
        } else if let Some(error) = object.get("error") {
            MessageKind::Error(ErrorObject::deserialize(error)?)
        } else if object.contains_key("result") && id.is_some() {
            MessageKind::Result
        } else {
            return Err(MessageError::Shape);
        };

        Ok(Self { id, kind, raw })
    }

    pub fn id(&self) -> Option<&RequestId> {
        self.id.as_ref()
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn is_response(&self) -> bool {
        matches!(self.kind, MessageKind::Result | MessageKind::Error(_))
    }

    /// The bytes this message was parsed from, without the line terminator.
    pub fn as_bytes(&self) -> &Bytes {
        &self.raw
    }

    pub fn into_bytes(self) -> Bytes {
        self.raw
    }
}
