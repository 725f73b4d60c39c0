//! Multi-client router: internal re-keying, cancel rewriting, response
//! restoration, and notification broadcast.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use agora::bridge::PermissionBridge;
use agora::methods;
use agora::permission::{PermissionOutcome, PermissionRequestParams, ToolCallDescriptor};
use agora::prompt::Notifier;
use agora::router::Router;
use agora::rpc::{Envelope, RequestId, Response, RpcError};
use agora::service::RpcService;
use agora::session::{ContentBlock, SessionId, SessionNotification, SessionUpdate};
use assert_matches::assert_matches;
use async_trait::async_trait;
use serde_json::{Value, json};

/// Records everything it is asked to do and answers with the internal id
/// it saw, so tests can observe the router's re-keying.
#[derive(Default)]
struct MockService {
    delay: Option<Duration>,
    requests: Mutex<Vec<(String, String)>>,
    notifications: Mutex<Vec<(String, Option<Value>)>>,
}

impl MockService {
    fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn seen_requests(&self) -> Vec<(String, String)> {
        self.requests.lock().unwrap().clone()
    }

    fn seen_notifications(&self) -> Vec<(String, Option<Value>)> {
        self.notifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl RpcService for MockService {
    async fn handle_request(
        &self,
        id: &RequestId,
        method: &str,
        _params: Option<Value>,
    ) -> Result<Value, RpcError> {
        self.requests
            .lock()
            .unwrap()
            .push((id.canonical_key(), method.to_string()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(json!({"handledBy": id.canonical_key()}))
    }

    async fn handle_notification(&self, method: &str, params: Option<Value>) {
        self.notifications
            .lock()
            .unwrap()
            .push((method.to_string(), params));
    }
}

fn request(id: RequestId, method: &str) -> Envelope {
    Envelope::request(id, method, Some(json!({})))
}

#[tokio::test]
async fn client_requests_are_rekeyed_and_responses_restored() {
    let service = Arc::new(MockService::default());
    let router = Router::new(service.clone());

    let mut first = router.attach();
    let mut second = router.attach();

    // Both clients pick the same request id; the service must still see
    // two distinct requests.
    router
        .handle_from_client(first.id, request(RequestId::Int(1), methods::SESSION_NEW))
        .await;
    router
        .handle_from_client(second.id, request(RequestId::Int(1), methods::SESSION_LIST))
        .await;

    let first_reply = first.rx.recv().await.unwrap();
    let second_reply = second.rx.recv().await.unwrap();

    let Envelope::Response(first_reply) = first_reply else {
        panic!("expected a response");
    };
    let Envelope::Response(second_reply) = second_reply else {
        panic!("expected a response");
    };

    // Each client gets back the id it sent.
    assert_eq!(first_reply.id, RequestId::Int(1));
    assert_eq!(second_reply.id, RequestId::Int(1));

    let seen = service.seen_requests();
    assert_eq!(seen.len(), 2);
    for (internal, _) in &seen {
        assert!(internal.starts_with("s2c:"), "not rekeyed: {internal}");
    }
    assert_ne!(seen[0].0, seen[1].0);
}

#[tokio::test]
async fn cancel_is_rewritten_to_the_internal_id_while_the_request_lives() {
    let service = Arc::new(MockService::delayed(Duration::from_millis(200)));
    let router = Router::new(service.clone());
    let client = router.attach();

    router
        .handle_from_client(client.id, request(RequestId::Int(3), methods::SESSION_PROMPT))
        .await;
    let internal = loop {
        if let Some((internal, _)) = service.seen_requests().first().cloned() {
            break internal;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    // Cancel referencing the client-visible id, in the *other* variant
    // form, still matches the mapping.
    router
        .handle_from_client(
            client.id,
            Envelope::notification(methods::CANCEL_REQUEST, Some(json!({"requestId": "3"}))),
        )
        .await;

    let notifications = service.seen_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].0, methods::CANCEL_REQUEST);
    assert_eq!(
        notifications[0].1.as_ref().unwrap()["requestId"],
        json!(internal)
    );
}

#[tokio::test]
async fn cancel_with_no_mapping_passes_through_unmodified() {
    let service = Arc::new(MockService::default());
    let router = Router::new(service.clone());
    let client = router.attach();

    router
        .handle_from_client(
            client.id,
            Envelope::notification(methods::CANCEL_REQUEST, Some(json!({"requestId": 42}))),
        )
        .await;

    let notifications = service.seen_notifications();
    assert_eq!(
        notifications[0].1.as_ref().unwrap()["requestId"],
        json!(42)
    );
}

#[tokio::test]
async fn the_mapping_dies_with_the_request() {
    let service = Arc::new(MockService::default());
    let router = Router::new(service.clone());
    let mut client = router.attach();

    router
        .handle_from_client(client.id, request(RequestId::Int(1), methods::SESSION_NEW))
        .await;
    let reply = client.rx.recv().await.unwrap();
    assert_matches!(reply, Envelope::Response(_));

    // The request settled, so its mapping is gone: stale cancels pass
    // through rather than being rewritten or dropped.
    router
        .handle_from_client(
            client.id,
            Envelope::notification(methods::CANCEL_REQUEST, Some(json!({"requestId": 1}))),
        )
        .await;
    let notifications = service.seen_notifications();
    assert_eq!(notifications[0].1.as_ref().unwrap()["requestId"], json!(1));
}

#[tokio::test]
async fn notifications_broadcast_to_every_connected_client() {
    let service = Arc::new(MockService::default());
    let router = Router::new(service.clone());

    let mut first = router.attach();
    let mut second = router.attach();

    let (notifier, rx) = Notifier::channel();
    router.spawn_notification_pump(rx);

    notifier
        .send(SessionNotification {
            session_id: SessionId::new("s1"),
            update: SessionUpdate::AgentMessageChunk {
                content: ContentBlock::text("hello"),
            },
        })
        .await
        .unwrap();

    for client in [&mut first, &mut second] {
        let envelope = client.rx.recv().await.unwrap();
        let Envelope::Notification(notification) = envelope else {
            panic!("expected a notification");
        };
        assert_eq!(notification.method, methods::SESSION_UPDATE);
        assert_eq!(notification.params.as_ref().unwrap()["sessionId"], json!("s1"));
    }
}

#[tokio::test]
async fn detached_clients_stop_receiving_broadcasts() {
    let service = Arc::new(MockService::default());
    let router = Router::new(service.clone());

    let mut kept = router.attach();
    let dropped = router.attach();
    router.detach(dropped.id);
    assert_eq!(router.client_count(), 1);

    router.broadcast(Envelope::notification(methods::SESSION_UPDATE, None));
    let envelope = kept.rx.recv().await.unwrap();
    assert_matches!(envelope, Envelope::Notification(_));
}

#[tokio::test]
async fn client_responses_route_to_the_permission_bridge() {
    let service = Arc::new(MockService::default());
    let bridge = Arc::new(PermissionBridge::new(Duration::from_secs(1)));
    let router = Router::with_bridge(service, Arc::clone(&bridge));
    let mut client = router.attach();

    let params = PermissionRequestParams::for_call(
        &SessionId::new("s1"),
        &ToolCallDescriptor {
            kind: "execute".into(),
            title: "run build".into(),
            locations: vec![],
            raw_input: json!({"command": "make"}),
        },
    );

    let waiter = {
        let bridge = Arc::clone(&bridge);
        let router = router.clone();
        tokio::spawn(async move {
            bridge
                .request_permission(params, |request| {
                    router.broadcast(Envelope::Request(request));
                    Ok(())
                })
                .await
        })
    };

    let envelope = client.rx.recv().await.unwrap();
    let Envelope::Request(permission_request) = envelope else {
        panic!("expected the reverse-channel request");
    };
    assert_eq!(permission_request.method, methods::SESSION_REQUEST_PERMISSION);

    router
        .handle_from_client(
            client.id,
            Envelope::Response(Response {
                id: permission_request.id,
                payload: Ok(json!({"outcome": {"outcome": "selected", "optionId": "allow_once"}})),
            }),
        )
        .await;

    let outcome = waiter.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        PermissionOutcome::Selected {
            option_id: "allow_once".into()
        }
    );
}
