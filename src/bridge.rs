//! Reverse-channel permission bridge.
//!
//! The agent initiates `session/request_permission` requests toward the
//! client (the inverse of the normal request direction), and this bridge
//! correlates each one with its eventual response. Waiters are keyed by
//! the request's id; `fail_all` drains every waiter on transport teardown
//! so no permission request blocks forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::Error;
use crate::methods;
use crate::permission::{PermissionOutcome, PermissionRequestParams, PermissionRequester};
use crate::rpc::{Request, RequestId, RpcError};

/// Wire shape of the client's answer.
#[derive(Debug, Deserialize)]
struct PermissionResponse {
    outcome: PermissionOutcome,
}

pub struct PermissionBridge {
    timeout: Duration,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value, RpcError>>>>,
}

impl PermissionBridge {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Frame and send a permission request via `send`, then suspend until
    /// the matching response arrives or the timeout fires.
    pub async fn request_permission(
        &self,
        params: PermissionRequestParams,
        send: impl FnOnce(Request) -> Result<(), Error>,
    ) -> Result<PermissionOutcome, Error> {
        let params_value = serde_json::to_value(&params)
            .map_err(|e| Error::Internal(format!("failed to encode permission request: {e}")))?;

        let id = RequestId::Str(Uuid::new_v4().to_string());
        let key = id.canonical_key();
        let (tx, rx) = oneshot::channel();
        self.pending_mut().insert(key.clone(), tx);

        let request = Request {
            id,
            method: methods::SESSION_REQUEST_PERMISSION.to_string(),
            params: Some(params_value),
        };

        if let Err(error) = send(request) {
            self.pending_mut().remove(&key);
            return Err(error);
        }

        let verdict = match tokio::time::timeout(self.timeout, rx).await {
            Err(_) => {
                self.pending_mut().remove(&key);
                return Err(Error::PermissionTimeout);
            }
            Ok(Err(_)) => return Err(Error::EndOfStream),
            Ok(Ok(verdict)) => verdict,
        };

        match verdict {
            Ok(value) => {
                let response: PermissionResponse = serde_json::from_value(value)
                    .map_err(|e| Error::Internal(format!("malformed permission response: {e}")))?;
                Ok(response.outcome)
            }
            Err(rpc_error) => Err(Error::Rpc(rpc_error)),
        }
    }

    /// Deliver an incoming response to its waiter. Returns false when no
    /// waiter matches (stale or foreign id).
    pub fn handle_incoming_response(
        &self,
        id: &RequestId,
        payload: Result<Value, RpcError>,
    ) -> bool {
        let waiter = self.pending_mut().remove(&id.canonical_key());
        match waiter {
            Some(tx) => {
                let _ = tx.send(payload);
                true
            }
            None => {
                tracing::debug!(%id, "permission response with no waiter");
                false
            }
        }
    }

    /// Resolve every outstanding waiter with the given failure. Used on
    /// transport teardown.
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<_> = {
            let mut pending = self.pending_mut();
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(RpcError::new(RpcError::COMMUNICATION_FAILURE, reason)));
        }
    }

    /// Outstanding waiter count; used by leak checks.
    pub fn pending_count(&self) -> usize {
        self.pending_mut().len()
    }

    fn pending_mut(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Result<Value, RpcError>>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// [`PermissionRequester`] backed by the bridge and an injected send
/// function.
pub struct BridgeRequester<F> {
    bridge: Arc<PermissionBridge>,
    send: F,
}

impl<F> BridgeRequester<F>
where
    F: Fn(Request) -> Result<(), Error> + Send + Sync,
{
    pub fn new(bridge: Arc<PermissionBridge>, send: F) -> Self {
        Self { bridge, send }
    }
}

#[async_trait]
impl<F> PermissionRequester for BridgeRequester<F>
where
    F: Fn(Request) -> Result<(), Error> + Send + Sync,
{
    async fn request(&self, params: PermissionRequestParams) -> Result<PermissionOutcome, Error> {
        self.bridge.request_permission(params, &self.send).await
    }
}
