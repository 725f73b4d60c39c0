//! Error taxonomy shared across the runtime.
//!
//! Everything here is a structured failure returned to the immediate
//! caller. The exit-code mapping at the bottom is a contract consumed by
//! the CLI collaborator that embeds this crate.

use crate::rpc::{DecodeError, RpcError};

/// Failures produced (or surfaced) by the runtime core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport was never opened, or has already been closed.
    #[error("not connected")]
    NotConnected,

    /// The peer closed the transport while we still had work in flight.
    #[error("end of stream")]
    EndOfStream,

    /// The requested transport is not available on this platform.
    #[error("unsupported on this platform: {0}")]
    Unsupported(String),

    /// An outgoing request did not receive a response within its deadline.
    #[error("request timed out: {method}")]
    RequestTimeout { method: String },

    /// A permission request did not receive a response within its deadline.
    #[error("permission request timed out")]
    PermissionTimeout,

    /// The peer answered a request with a JSON-RPC error object.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The caller supplied parameters the runtime cannot act on.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// The method is unknown, or the capability it belongs to is not enabled.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Something went wrong inside the runtime itself.
    #[error("internal error: {0}")]
    Internal(String),

    /// The request was cancelled at the protocol level before it settled.
    #[error("request cancelled")]
    RequestCancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl Error {
    /// Map this error onto the process exit-code contract:
    /// 2 = invalid input, 4 = upstream/transport failure, 5 = internal error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidParams(_)
            | Error::MethodNotFound(_)
            | Error::RequestCancelled
            | Error::Decode(_) => 2,
            Error::NotConnected
            | Error::EndOfStream
            | Error::RequestTimeout { .. }
            | Error::PermissionTimeout
            | Error::Rpc(_)
            | Error::Io(_) => 4,
            Error::Unsupported(_) | Error::Internal(_) => 5,
        }
    }

    /// Render this error as the JSON-RPC error object a peer should see.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            Error::Rpc(err) => err.clone(),
            Error::InvalidParams(msg) => RpcError::invalid_params().with_detail(msg),
            Error::MethodNotFound(method) => RpcError::method_not_found().with_detail(method),
            Error::RequestCancelled => RpcError::request_cancelled(),
            Error::Internal(msg) => RpcError::internal_error().with_detail(msg),
            other => RpcError::new(RpcError::COMMUNICATION_FAILURE, other.to_string()),
        }
    }
}
