//! Client-side request/response correlation.
//!
//! The correlator owns every pending outgoing request: it allocates wire
//! ids, keeps one waiter per id, and routes incoming responses strictly by
//! id, in whatever order they arrive. Ids are allocated under the state
//! lock, so N concurrent issuances observe exactly the id set `{1..N}`.
//!
//! Lifecycle rules:
//! - a response with no pending waiter is dropped silently;
//! - a request whose deadline expires fails with a timeout tagged with the
//!   original method name;
//! - `close` fails every pending waiter with end-of-stream, beats any
//!   scheduled-but-unfired timeout, and is idempotent;
//! - requests issued after close fail immediately without allocating a
//!   pending slot.
//!
//! After close or full drain both `pending_count` and `timer_count` drain
//! to zero; tests rely on this to detect leaks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::rpc::{Request, RequestId, Response};

/// Correlates outgoing requests with their eventual responses.
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

struct Inner {
    default_timeout: Duration,
    state: Mutex<State>,
    timer_count: AtomicUsize,
}

struct State {
    next_id: i64,
    closed: bool,
    pending: HashMap<i64, Pending>,
}

struct Pending {
    method: String,
    #[allow(dead_code)]
    issued_at: Instant,
    tx: oneshot::Sender<Result<Value, Error>>,
    timer: tokio::task::AbortHandle,
}

/// A request that has been issued but not yet resolved.
#[derive(Debug)]
pub struct PendingResponse {
    rx: oneshot::Receiver<Result<Value, Error>>,
}

impl PendingResponse {
    /// Suspend until the response arrives, the deadline expires, or the
    /// correlator closes.
    pub async fn wait(self) -> Result<Value, Error> {
        match self.rx.await {
            Ok(result) => result,
            // The waiter slot was dropped without a verdict; treat it the
            // same as the transport going away.
            Err(_) => Err(Error::EndOfStream),
        }
    }
}

impl Correlator {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                default_timeout,
                state: Mutex::new(State {
                    next_id: 1,
                    closed: false,
                    pending: HashMap::new(),
                }),
                timer_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Issue a request with the default deadline.
    pub fn issue(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(Request, PendingResponse), Error> {
        self.issue_with_timeout(method, params, self.inner.default_timeout)
    }

    /// Issue a request with an explicit deadline.
    pub fn issue_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<(Request, PendingResponse), Error> {
        let mut state = self.inner.state();
        if state.closed {
            return Err(Error::NotConnected);
        }

        let id = state.next_id;
        state.next_id += 1;

        let (tx, rx) = oneshot::channel();

        self.inner.timer_count.fetch_add(1, Ordering::SeqCst);
        let guard = TimerGuard(Arc::clone(&self.inner));
        let inner = Arc::clone(&self.inner);
        let timer = tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(timeout).await;
            inner.expire(id);
        })
        .abort_handle();

        state.pending.insert(
            id,
            Pending {
                method: method.to_string(),
                issued_at: Instant::now(),
                tx,
                timer,
            },
        );

        let request = Request {
            id: RequestId::Int(id),
            method: method.to_string(),
            params,
        };
        Ok((request, PendingResponse { rx }))
    }

    /// Route an incoming response to its waiter. Responses with no pending
    /// waiter (already resolved, never sent, or string-keyed) are dropped.
    pub fn handle_response(&self, response: Response) {
        let removed = {
            let mut state = self.inner.state();
            match &response.id {
                RequestId::Int(id) => state.pending.remove(id),
                RequestId::Str(_) => None,
            }
        };

        match removed {
            Some(pending) => {
                pending.timer.abort();
                let value = response.payload.map_err(Error::Rpc);
                let _ = pending.tx.send(value);
            }
            None => {
                tracing::debug!(id = %response.id, "dropping response with no pending waiter");
            }
        }
    }

    /// Fail every pending request with end-of-stream. Closing again is a
    /// no-op; a timeout that has not yet fired loses to close.
    pub fn close(&self) {
        let drained: Vec<Pending> = {
            let mut state = self.inner.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.pending.drain().map(|(_, p)| p).collect()
        };

        for pending in drained {
            pending.timer.abort();
            let _ = pending.tx.send(Err(Error::EndOfStream));
        }
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.state().pending.len()
    }

    /// Number of timeout timers still alive.
    pub fn timer_count(&self) -> usize {
        self.inner.timer_count.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Called from a timer task when a deadline elapses. If close got
    /// there first, or the response already arrived, this does nothing.
    fn expire(&self, id: i64) {
        let removed = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.pending.remove(&id)
        };

        if let Some(pending) = removed {
            tracing::debug!(id, method = %pending.method, "request timed out");
            let method = pending.method;
            let _ = pending.tx.send(Err(Error::RequestTimeout { method }));
        }
    }
}

/// Decrements the live-timer count when a timer future is dropped,
/// whether it fired or was aborted.
struct TimerGuard(Arc<Inner>);

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.0.timer_count.fetch_sub(1, Ordering::SeqCst);
    }
}
