//! Integration tests for the full sync pipeline.
//!
//! These tests start a real WebSocket push server and a mock REST backend,
//! then drive sessions and caches against both.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use ledger_sync::{
    CacheConfig, ChannelKey, ConnectResult, ConnectionRegistry, DeferReason, Envelope,
    FetchParams, HttpConfig, HttpResourceApi, NotificationProjector, ReconnectPolicy,
    RegistryConfig, ResourceCache, SessionState, Severity,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Clone)]
enum Command {
    Push(String),
    Kick,
}

/// Push server handle: broadcast frames to every connected client.
struct PushServer {
    port: u16,
    commands: broadcast::Sender<Command>,
    paths: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
}

impl PushServer {
    fn ws_base(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    fn push(&self, envelope: &Envelope) {
        let _ = self.commands.send(Command::Push(envelope.encode()));
    }

    fn kick(&self) {
        let _ = self.commands.send(Command::Kick);
    }

    fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a push server on a free port.
async fn start_test_server() -> PushServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (commands, _) = broadcast::channel::<Command>(64);
    let paths = Arc::new(Mutex::new(Vec::new()));
    let connections = Arc::new(AtomicUsize::new(0));

    let server = PushServer {
        port,
        commands: commands.clone(),
        paths: paths.clone(),
        connections: connections.clone(),
    };

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            // Subscribe before the handshake so no frame sent after the
            // client sees Open can be missed.
            let mut rx = commands.subscribe();
            let paths = paths.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                let record = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    paths.lock().unwrap().push(req.uri().path().to_string());
                    Ok(resp)
                };
                let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, record).await else {
                    return;
                };
                connections.fetch_add(1, Ordering::SeqCst);
                let (mut sink, mut source) = ws.split();
                loop {
                    tokio::select! {
                        command = rx.recv() => match command {
                            Ok(Command::Push(frame)) => {
                                if sink.send(Message::Text(frame.into())).await.is_err() {
                                    break;
                                }
                            }
                            Ok(Command::Kick) | Err(_) => {
                                let _ = sink.send(Message::Close(None)).await;
                                break;
                            }
                        },
                        incoming = source.next() => match incoming {
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => {}
                        },
                    }
                }
            });
        }
    });

    server
}

fn registry_for(server: &PushServer, policy: ReconnectPolicy) -> ConnectionRegistry {
    ConnectionRegistry::with_websockets(RegistryConfig {
        ws_base_url: server.ws_base(),
        reconnect: policy,
    })
}

fn api_for(rest: &MockServer) -> Arc<HttpResourceApi> {
    Arc::new(
        HttpResourceApi::new(HttpConfig {
            base_url: format!("{}/api", rest.uri()),
            timeout_secs: 5,
        })
        .unwrap(),
    )
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached within timeout");
}

fn ids(cache: &ResourceCache) -> Vec<Value> {
    cache.items().iter().map(|item| item["id"].clone()).collect()
}

#[tokio::test]
async fn test_session_connects_to_channel_path() {
    let server = start_test_server().await;
    let registry = registry_for(&server, ReconnectPolicy::default());

    let session = registry.get_or_create(&ChannelKey::all("customers")).await;
    assert_eq!(session.connect().await, ConnectResult::Connected);
    assert_eq!(session.state(), SessionState::Open);
    assert_eq!(server.paths(), vec!["/ws/customers/all"]);

    let again = registry.get_or_create(&ChannelKey::all("customers")).await;
    assert!(again.ptr_eq(&session));
    assert_eq!(again.connect().await, ConnectResult::Connected);
    assert_eq!(server.connections(), 1);

    registry.close_all().await;
}

#[tokio::test]
async fn test_pushed_frames_reach_listeners() {
    let server = start_test_server().await;
    let registry = registry_for(&server, ReconnectPolicy::default());
    let session = registry.get_or_create(&ChannelKey::new("invoices", 7)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let exact = tx.clone();
    let _paid = session.subscribe("invoice_paid", move |payload: &Value| {
        let _ = exact.send(("exact", payload.clone()));
    });
    let _all = session.subscribe_all(move |frame: &Value| {
        let _ = tx.send(("all", frame.clone()));
    });
    session.connect().await;

    server.push(&Envelope::with_data("invoice_paid", json!({"id": 7})));

    let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, ("exact", json!({"data": {"id": 7}})));
    assert_eq!(second, ("all", json!({"type": "invoice_paid", "data": {"id": 7}})));

    registry.close_all().await;
}

#[tokio::test]
async fn test_reconnects_after_server_closes() {
    let server = start_test_server().await;
    let registry = registry_for(&server, ReconnectPolicy::new(Duration::from_millis(50), 5));
    let session = registry.get_or_create(&ChannelKey::all("stock")).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = session.subscribe("stock_adjusted", move |payload: &Value| {
        let _ = tx.send(payload.clone());
    });
    session.connect().await;

    server.kick();
    eventually(|| server.connections() == 2 && session.is_open()).await;
    assert_eq!(session.reconnect_attempts(), 0);

    server.push(&Envelope::with_data("stock_adjusted", json!({"product_id": 3})));
    let payload = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(payload["data"]["product_id"], json!(3));

    registry.close_all().await;
}

#[tokio::test]
async fn test_unreachable_server_gives_up() {
    let port = free_port().await;
    let registry = ConnectionRegistry::with_websockets(RegistryConfig {
        ws_base_url: format!("ws://127.0.0.1:{port}/ws"),
        reconnect: ReconnectPolicy::new(Duration::from_millis(10), 2),
    });
    let session = registry.get_or_create(&ChannelKey::all("reports")).await;

    match session.connect().await {
        ConnectResult::Deferred(DeferReason::Transport(_)) => {}
        other => panic!("Expected a transport deferral, got {other:?}"),
    }
    eventually(|| session.reconnect_attempts() == 2 && !session.reconnect_pending()).await;
    assert_eq!(session.state(), SessionState::Idle);

    // The registry still hands out the same session.
    let again = registry.get_or_create(&ChannelKey::all("reports")).await;
    assert!(again.ptr_eq(&session));
}

#[tokio::test]
async fn test_close_all_disconnects_every_channel() {
    let server = start_test_server().await;
    let registry = registry_for(&server, ReconnectPolicy::new(Duration::from_millis(20), 5));
    let a = registry.get_or_create(&ChannelKey::all("suppliers")).await;
    let b = registry.get_or_create(&ChannelKey::all("purchases")).await;
    a.connect().await;
    b.connect().await;

    assert_eq!(registry.close_all().await, 2);
    assert!(registry.is_empty().await);
    assert_eq!(a.state(), SessionState::Closed);
    assert_eq!(b.state(), SessionState::Closed);

    // A manual close never triggers a reconnect.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connections(), 2);
    assert!(!a.reconnect_pending());
}

#[tokio::test]
async fn test_cache_reconciles_fetch_push_and_mutations() {
    let server = start_test_server().await;
    let rest = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/customers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": 1, "name": "A", "city": "Oslo"}, {"id": 2, "name": "B"}],
            "pagination": {"page": 1, "per_page": 20, "total": 2, "total_pages": 1}
        })))
        .mount(&rest)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/customers/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1, "name": "A2"})))
        .mount(&rest)
        .await;

    let registry = registry_for(&server, ReconnectPolicy::default());
    let key = ChannelKey::all("customers");
    let cache = ResourceCache::open(
        CacheConfig::new("customers").channel(key.clone()),
        api_for(&rest),
        Some(registry.clone()),
    )
    .await;
    assert_eq!(ids(&cache), vec![json!(1), json!(2)]);
    assert_eq!(cache.pagination().and_then(|p| p.total), Some(2));

    let session = registry.get(&key).await.unwrap();
    session.connect().await;

    server.push(&Envelope::with_data("customer_created", json!({"id": 3, "name": "C"})));
    server.push(&Envelope::with_data("customer_deleted", json!({"id": 2})));
    eventually(|| ids(&cache) == vec![json!(3), json!(1)]).await;

    let merged = cache.update(1, json!({"name": "A2"})).await.unwrap();
    assert_eq!(merged, json!({"id": 1, "name": "A2", "city": "Oslo"}));
    assert_eq!(
        cache.items(),
        vec![
            json!({"id": 3, "name": "C"}),
            json!({"id": 1, "name": "A2", "city": "Oslo"})
        ]
    );

    cache.dispose().await;
    assert!(!registry.contains(&key).await);
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_unrecognized_push_triggers_refetch() {
    let server = start_test_server().await;
    let rest = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/products"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1, "stock": 5}])))
        .up_to_n_times(1)
        .mount(&rest)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/products"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1, "stock": 2}])))
        .mount(&rest)
        .await;

    let registry = registry_for(&server, ReconnectPolicy::default());
    let key = ChannelKey::all("products");
    let cache = ResourceCache::open(
        CacheConfig::new("products")
            .channel(key.clone())
            .params(FetchParams::new().per_page(50)),
        api_for(&rest),
        Some(registry.clone()),
    )
    .await;
    assert_eq!(cache.items()[0]["stock"], json!(5));
    registry.get(&key).await.unwrap().connect().await;

    server.push(&Envelope::with_data("stock_adjusted", json!({"product_id": 1, "delta": -3})));
    eventually(|| cache.items().first().map(|item| item["stock"].clone()) == Some(json!(2))).await;

    let requests = rest.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].url.query(), Some("per_page=50"));

    registry.close_all().await;
}

#[tokio::test]
async fn test_fetch_error_is_surfaced_not_thrown() {
    let rest = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/orders"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&rest)
        .await;

    let cache = ResourceCache::open(CacheConfig::new("orders"), api_for(&rest), None).await;
    let snapshot = cache.snapshot();
    assert!(snapshot.items.is_empty());
    assert!(!snapshot.loading);
    assert_eq!(snapshot.error.as_deref(), Some("server returned 503: maintenance"));
}

#[tokio::test]
async fn test_notifications_from_live_channel() {
    let server = start_test_server().await;
    let registry = registry_for(&server, ReconnectPolicy::default());
    let session = registry.get_or_create(&ChannelKey::all("invoices")).await;

    let (_sub, mut notes) = NotificationProjector::new("Invoice").attach(&session);
    session.connect().await;

    server.push(&Envelope::with_data("invoice_viewed", json!({"id": 1})));
    server.push(&Envelope::with_data("invoice_created", json!({"id": 2, "number": "INV-2"})));

    let note = timeout(Duration::from_secs(2), notes.recv()).await.unwrap().unwrap();
    assert_eq!(note.severity, Severity::Success);
    assert_eq!(note.title, "Invoice created");
    assert_eq!(note.message, "INV-2");

    registry.close_all().await;
}
