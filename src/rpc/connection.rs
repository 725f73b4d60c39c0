//! Client connection: actor loops tying a byte transport to the
//! correlator.
//!
//! Two tasks serve a connection: the outgoing actor serializes envelopes
//! onto the writer (throttled by the send gate), and the incoming actor
//! parses frames and dispatches them: responses to the correlator,
//! requests and notifications to the injected handler. End of stream
//! closes the correlator, which fails every pending request.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::gate::SendGate;
use crate::rpc::correlator::Correlator;
use crate::rpc::framing::{self, FramingError};
use crate::rpc::{Envelope, Notification, Request, RequestId, RpcError};

/// Tunables for a connection.
pub struct ConnectionOptions {
    /// Default deadline applied to outgoing requests.
    pub request_timeout: Duration,
    /// Maximum simultaneously in-flight outbound sends.
    pub max_in_flight_sends: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            max_in_flight_sends: 32,
        }
    }
}

/// Invoked for messages the peer initiates: reverse-channel requests
/// (e.g. permission prompts) and notifications.
#[async_trait]
pub trait IncomingHandler: Send {
    async fn handle_request(&mut self, request: Request, reply: ReplySink) {
        let _ = request;
        let _ = reply.respond(Err(RpcError::method_not_found()));
    }

    async fn handle_notification(&mut self, notification: Notification) {
        tracing::debug!(method = %notification.method, "ignoring notification");
    }
}

/// Handler that claims nothing.
#[derive(Default)]
pub struct NullHandler;

#[async_trait]
impl IncomingHandler for NullHandler {}

/// One-shot reply slot for an incoming request.
pub struct ReplySink {
    id: RequestId,
    outgoing: mpsc::UnboundedSender<Envelope>,
}

impl ReplySink {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Send the response for this request.
    pub fn respond(self, result: Result<Value, RpcError>) -> Result<(), Error> {
        let envelope = match result {
            Ok(value) => Envelope::result(self.id, value),
            Err(error) => Envelope::error_response(self.id, error),
        };
        self.outgoing
            .send(envelope)
            .map_err(|_| Error::NotConnected)
    }
}

/// A served client connection.
pub struct Connection {
    correlator: Correlator,
    outgoing_tx: mpsc::UnboundedSender<Envelope>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Spawn the actor loops over the given byte streams.
    pub fn spawn<R, W, H>(reader: R, writer: W, handler: H, options: ConnectionOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        H: IncomingHandler + 'static,
    {
        let correlator = Correlator::new(options.request_timeout);
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let gate = SendGate::new(options.max_in_flight_sends);
        let shutdown = CancellationToken::new();

        tokio::spawn(outgoing_actor(
            outgoing_rx,
            writer,
            gate,
            shutdown.clone(),
        ));
        tokio::spawn(incoming_actor(
            reader,
            correlator.clone(),
            handler,
            outgoing_tx.clone(),
            shutdown.clone(),
        ));

        Self {
            correlator,
            outgoing_tx,
            shutdown,
        }
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, Error> {
        let (request, pending) = self.correlator.issue(method, params)?;
        if self.outgoing_tx.send(Envelope::Request(request)).is_err() {
            self.correlator.close();
        }
        pending.wait().await
    }

    /// Send a request with an explicit deadline.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, Error> {
        let (request, pending) = self.correlator.issue_with_timeout(method, params, timeout)?;
        if self.outgoing_tx.send(Envelope::Request(request)).is_err() {
            self.correlator.close();
        }
        pending.wait().await
    }

    /// Send a notification (no reply expected).
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        self.outgoing_tx
            .send(Envelope::notification(method, params))
            .map_err(|_| Error::NotConnected)
    }

    /// Tear the connection down, failing all pending requests with
    /// end-of-stream. Safe to call more than once.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.correlator.close();
    }

    /// The correlator backing this connection. Exposed for leak checks.
    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }
}

async fn outgoing_actor<W>(
    mut outgoing_rx: mpsc::UnboundedReceiver<Envelope>,
    mut writer: W,
    gate: SendGate,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let envelope = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = outgoing_rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let Ok(_permit) = gate.acquire().await else {
            break;
        };
        if let Err(error) = framing::write_message(&mut writer, &envelope).await {
            tracing::warn!(%error, "failed to write outgoing message");
            break;
        }
    }
}

async fn incoming_actor<R, H>(
    reader: R,
    correlator: Correlator,
    mut handler: H,
    outgoing_tx: mpsc::UnboundedSender<Envelope>,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Send + Unpin + 'static,
    H: IncomingHandler + 'static,
{
    let mut reader = BufReader::new(reader);
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = framing::read_message(&mut reader) => next,
        };

        match next {
            Ok(Some(Envelope::Response(response))) => correlator.handle_response(response),
            Ok(Some(Envelope::Request(request))) => {
                let reply = ReplySink {
                    id: request.id.clone(),
                    outgoing: outgoing_tx.clone(),
                };
                handler.handle_request(request, reply).await;
            }
            Ok(Some(Envelope::Notification(notification))) => {
                handler.handle_notification(notification).await;
            }
            Ok(None) => break,
            Err(FramingError::Io(error)) => {
                tracing::warn!(%error, "transport read failed");
                break;
            }
            Err(FramingError::Decode(error)) => {
                // A malformed frame poisons only itself; keep serving.
                tracing::warn!(%error, "dropping undecodable message");
            }
        }
    }
    correlator.close();
}
