//! Core JSON-RPC wire support.
//!
//! The envelope layer classifies raw messages as requests, notifications,
//! or responses, and enforces the wire invariants: the `jsonrpc` version
//! field must be the literal protocol version, a response carries exactly
//! one of `result`/`error`, and ids decode only from integers or strings.
//! Violations fail the decode; nothing is silently defaulted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod connection;
pub mod correlator;
pub mod framing;

/// The literal version string every envelope must carry.
pub const PROTOCOL_VERSION: &str = "2.0";

/// A request id: an integer or a string.
///
/// Equality is variant-sensitive: `Int(7)` and `Str("7")` are different
/// ids. The cancellation subsystem matches ids by [`RequestId::canonical_key`]
/// instead, where the two forms are deliberately equivalent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Int(i64),
    Str(String),
}

impl RequestId {
    /// Textual key under which int and string forms of the same id collide.
    pub fn canonical_key(&self) -> String {
        match self {
            RequestId::Int(n) => n.to_string(),
            RequestId::Str(s) => s.clone(),
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Int(n) => write!(f, "{n}"),
            RequestId::Str(s) => write!(f, "{s}"),
        }
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const REQUEST_CANCELLED: i64 = -32800;
    pub const COMMUNICATION_FAILURE: i64 = -32000;

    // Runtime collaborator code space: these are surfaced through this
    // core, never generated by it.
    pub const PERMISSION_DENIED: i64 = -32010;
    pub const UNKNOWN_TERMINAL: i64 = -32011;
    pub const COMMAND_DENIED: i64 = -32012;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error() -> Self {
        Self::new(Self::PARSE_ERROR, "parse error")
    }

    pub fn invalid_request() -> Self {
        Self::new(Self::INVALID_REQUEST, "invalid request")
    }

    pub fn method_not_found() -> Self {
        Self::new(Self::METHOD_NOT_FOUND, "method not found")
    }

    pub fn invalid_params() -> Self {
        Self::new(Self::INVALID_PARAMS, "invalid params")
    }

    pub fn internal_error() -> Self {
        Self::new(Self::INTERNAL_ERROR, "internal error")
    }

    pub fn request_cancelled() -> Self {
        Self::new(Self::REQUEST_CANCELLED, "request cancelled")
    }

    /// Attach human-readable detail in the `data` field.
    pub fn with_detail(mut self, detail: impl std::fmt::Display) -> Self {
        self.data = Some(Value::String(detail.to_string()));
        self
    }
}

/// Why a raw message failed to decode.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("jsonrpc version field missing or not \"{PROTOCOL_VERSION}\"")]
    Version,

    #[error("request id must be an integer or a string")]
    IdType,

    #[error("method must be a string")]
    MethodType,

    #[error("response must carry exactly one of result/error")]
    ResponseShape,

    #[error("blank message line")]
    BlankLine,
}

/// An incoming request: has an id, expects a response.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

/// A notification: no id, no response expected.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// A response to an earlier request, routed by id.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub payload: Result<Value, RpcError>,
}

/// The three message shapes that travel over a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Envelope {
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Envelope::Request(Request {
            id,
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Envelope::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    pub fn result(id: RequestId, result: Value) -> Self {
        Envelope::Response(Response {
            id,
            payload: Ok(result),
        })
    }

    pub fn error_response(id: RequestId, error: RpcError) -> Self {
        Envelope::Response(Response {
            id,
            payload: Err(error),
        })
    }

    /// Decode one message from its serialized form.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Classify an already-parsed JSON value as one of the three shapes.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let Value::Object(map) = value else {
            return Err(DecodeError::NotAnObject);
        };

        match map.get("jsonrpc") {
            Some(Value::String(version)) if version == PROTOCOL_VERSION => {}
            _ => return Err(DecodeError::Version),
        }

        let id = match map.get("id") {
            None => None,
            Some(Value::Number(n)) => Some(RequestId::Int(n.as_i64().ok_or(DecodeError::IdType)?)),
            Some(Value::String(s)) => Some(RequestId::Str(s.clone())),
            Some(_) => return Err(DecodeError::IdType),
        };

        if let Some(method) = map.get("method") {
            let Value::String(method) = method else {
                return Err(DecodeError::MethodType);
            };
            let method = method.clone();
            let params = map.get("params").cloned();
            return Ok(match id {
                Some(id) => Envelope::Request(Request { id, method, params }),
                None => Envelope::Notification(Notification { method, params }),
            });
        }

        // No method: this must be a response, and a response must have an id.
        let id = id.ok_or(DecodeError::ResponseShape)?;
        match (map.contains_key("result"), map.contains_key("error")) {
            (true, false) => Ok(Envelope::Response(Response {
                id,
                payload: Ok(map.get("result").cloned().unwrap_or(Value::Null)),
            })),
            (false, true) => {
                let error = map.get("error").cloned().unwrap_or(Value::Null);
                let error: RpcError = serde_json::from_value(error)?;
                Ok(Envelope::Response(Response {
                    id,
                    payload: Err(error),
                }))
            }
            _ => Err(DecodeError::ResponseShape),
        }
    }

    /// Serialize for the wire. Method names containing `/` are emitted
    /// unescaped (serde_json never escapes forward slashes).
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// Wire shapes with deterministic field order, so that
// `encode(decode(x)) == x` holds on canonical fixtures.

#[derive(Serialize)]
struct WireRequest<'a> {
    jsonrpc: &'static str,
    id: &'a RequestId,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

#[derive(Serialize)]
struct WireNotification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

#[derive(Serialize)]
struct WireResult<'a> {
    jsonrpc: &'static str,
    id: &'a RequestId,
    result: &'a Value,
}

#[derive(Serialize)]
struct WireError<'a> {
    jsonrpc: &'static str,
    id: &'a RequestId,
    error: &'a RpcError,
}

impl Serialize for Envelope {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Envelope::Request(r) => WireRequest {
                jsonrpc: PROTOCOL_VERSION,
                id: &r.id,
                method: &r.method,
                params: r.params.as_ref(),
            }
            .serialize(serializer),
            Envelope::Notification(n) => WireNotification {
                jsonrpc: PROTOCOL_VERSION,
                method: &n.method,
                params: n.params.as_ref(),
            }
            .serialize(serializer),
            Envelope::Response(resp) => match &resp.payload {
                Ok(result) => WireResult {
                    jsonrpc: PROTOCOL_VERSION,
                    id: &resp.id,
                    result,
                }
                .serialize(serializer),
                Err(error) => WireError {
                    jsonrpc: PROTOCOL_VERSION,
                    id: &resp.id,
                    error,
                }
                .serialize(serializer),
            },
        }
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Envelope::from_value(value).map_err(serde::de::Error::custom)
    }
}
