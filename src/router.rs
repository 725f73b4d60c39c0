//! Multi-client request-id router.
//!
//! One shared service instance can serve many concurrently connected
//! sockets, and two clients are free to pick the same request ids. The
//! router therefore re-keys every inbound request with a fresh internal
//! string id (`s2c:<n>`) before it reaches the service, and remembers the
//! client-id → internal-id mapping for the life of that request. Cancel
//! notifications referencing a client-visible id are rewritten to the
//! internal id when a mapping exists, and pass through untouched when it
//! does not. Service notifications broadcast to every connected client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::bridge::PermissionBridge;
use crate::methods;
use crate::prompt::NotificationItem;
use crate::rpc::{Envelope, RequestId};
use crate::service::RpcService;

#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    service: Arc<dyn RpcService>,
    /// Receives client answers to service-initiated requests (permission
    /// prompts travel the reverse direction).
    bridge: Option<Arc<PermissionBridge>>,
    next_client: AtomicU64,
    next_internal: AtomicU64,
    state: Mutex<RouterState>,
}

#[derive(Default)]
struct RouterState {
    clients: HashMap<u64, mpsc::UnboundedSender<Envelope>>,
    /// internal id → where the response must go.
    routes: HashMap<String, RouteEntry>,
    /// (client, canonical client id) → internal id, for cancel rewriting.
    by_client: HashMap<(u64, String), String>,
}

struct RouteEntry {
    client: u64,
    client_id: RequestId,
}

/// One attached client socket: the router delivers outbound envelopes
/// through `rx`.
pub struct ClientHandle {
    pub id: u64,
    pub rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Router {
    pub fn new(service: Arc<dyn RpcService>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                service,
                bridge: None,
                next_client: AtomicU64::new(1),
                next_internal: AtomicU64::new(1),
                state: Mutex::new(RouterState::default()),
            }),
        }
    }

    pub fn with_bridge(service: Arc<dyn RpcService>, bridge: Arc<PermissionBridge>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                service,
                bridge: Some(bridge),
                next_client: AtomicU64::new(1),
                next_internal: AtomicU64::new(1),
                state: Mutex::new(RouterState::default()),
            }),
        }
    }

    /// Register a new client socket.
    pub fn attach(&self) -> ClientHandle {
        let id = self.inner.next_client.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().clients.insert(id, tx);
        tracing::info!(connection_id = id, "client attached");
        ClientHandle { id, rx }
    }

    /// Drop a client and its cancel-rewrite mappings. In-flight requests
    /// finish at the service; their responses are discarded.
    pub fn detach(&self, client: u64) {
        let mut state = self.lock();
        state.clients.remove(&client);
        state.by_client.retain(|(owner, _), _| *owner != client);
        tracing::info!(connection_id = client, "client detached");
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    /// Feed one decoded envelope from a client socket.
    pub async fn handle_from_client(&self, client: u64, envelope: Envelope) {
        match envelope {
            Envelope::Request(request) => {
                let internal = format!(
                    "s2c:{}",
                    self.inner.next_internal.fetch_add(1, Ordering::SeqCst)
                );
                {
                    let mut state = self.lock();
                    state.routes.insert(
                        internal.clone(),
                        RouteEntry {
                            client,
                            client_id: request.id.clone(),
                        },
                    );
                    state
                        .by_client
                        .insert((client, request.id.canonical_key()), internal.clone());
                }

                // Requests run concurrently; a slow prompt from one client
                // must not stall the others.
                let router = self.clone();
                tokio::spawn(async move {
                    let result = router
                        .inner
                        .service
                        .handle_request(
                            &RequestId::Str(internal.clone()),
                            &request.method,
                            request.params,
                        )
                        .await;
                    router.complete(&internal, result);
                });
            }
            Envelope::Notification(notification) => {
                let params = if notification.method == methods::CANCEL_REQUEST {
                    self.rewrite_cancel(client, notification.params)
                } else {
                    notification.params
                };
                self.inner
                    .service
                    .handle_notification(&notification.method, params)
                    .await;
            }
            Envelope::Response(response) => {
                // A client answering a reverse-channel request.
                if let Some(bridge) = &self.inner.bridge {
                    bridge.handle_incoming_response(&response.id, response.payload);
                } else {
                    tracing::debug!(id = %response.id, "dropping client response: no bridge");
                }
            }
        }
    }

    /// Broadcast an envelope to every connected client.
    pub fn broadcast(&self, envelope: Envelope) {
        let mut state = self.lock();
        state.clients.retain(|_, tx| !tx.is_closed());
        for tx in state.clients.values() {
            let _ = tx.send(envelope.clone());
        }
    }

    /// Forward session notifications from the service to every client,
    /// acknowledging each only after it has been handed to the sockets.
    pub fn spawn_notification_pump(&self, mut rx: mpsc::UnboundedReceiver<NotificationItem>) {
        let router = self.clone();
        tokio::spawn(async move {
            while let Some((notification, ack)) = rx.recv().await {
                match serde_json::to_value(&notification) {
                    Ok(params) => {
                        router.broadcast(Envelope::notification(
                            methods::SESSION_UPDATE,
                            Some(params),
                        ));
                    }
                    Err(error) => {
                        tracing::error!(%error, "failed to serialize session notification");
                    }
                }
                let _ = ack.send(());
            }
        });
    }

    /// Route a finished request back to its originating client, restoring
    /// the id the client knows.
    fn complete(&self, internal: &str, result: Result<Value, crate::rpc::RpcError>) {
        let (entry, tx) = {
            let mut state = self.lock();
            let Some(entry) = state.routes.remove(internal) else {
                tracing::debug!(internal, "response for unknown route");
                return;
            };
            state
                .by_client
                .remove(&(entry.client, entry.client_id.canonical_key()));
            let tx = state.clients.get(&entry.client).cloned();
            (entry, tx)
        };

        let Some(tx) = tx else {
            tracing::debug!(connection_id = entry.client, "client gone, dropping response");
            return;
        };

        let envelope = match result {
            Ok(value) => Envelope::result(entry.client_id, value),
            Err(error) => Envelope::error_response(entry.client_id, error),
        };
        let _ = tx.send(envelope);
    }

    /// Rewrite a `request/cancel` payload from the client-visible id to
    /// the internal id. Unknown or stale ids pass through unmodified.
    fn rewrite_cancel(&self, client: u64, params: Option<Value>) -> Option<Value> {
        let mut map = match params {
            Some(Value::Object(map)) => map,
            other => return other,
        };
        let Some(raw_id) = map.get("requestId") else {
            return Some(Value::Object(map));
        };
        let Ok(request_id) = serde_json::from_value::<RequestId>(raw_id.clone()) else {
            return Some(Value::Object(map));
        };

        let internal = self
            .lock()
            .by_client
            .get(&(client, request_id.canonical_key()))
            .cloned();
        if let Some(internal) = internal {
            map.insert("requestId".into(), Value::String(internal));
        }
        Some(Value::Object(map))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RouterState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(router): State<Router>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, router))
}

/// Serve one client socket: an outbound forwarding task plus the inbound
/// read loop.
async fn handle_socket(socket: WebSocket, router: Router) {
    let ClientHandle { id, mut rx } = router.attach();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            match envelope.encode() {
                Ok(text) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(error) => {
                    tracing::error!(%error, "failed to serialize outbound frame");
                }
            }
        }
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => match Envelope::decode(&text) {
                Ok(envelope) => router.handle_from_client(id, envelope).await,
                Err(error) => {
                    tracing::warn!(%error, connection_id = id, "dropping undecodable frame");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(%error, connection_id = id, "socket read failed");
                break;
            }
        }
    }

    router.detach(id);
    send_task.abort();
}
