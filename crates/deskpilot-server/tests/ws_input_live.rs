//! Integration tests for the live input channel, driven by a real WebSocket
//! client against a server bound to an ephemeral loopback port.
//!
//! These cover the connection lifecycle a phone actually goes through:
//! hello and hello_ack, version rejection, per-event authorization (a
//! stream-only session sending a key event gets a `denied` frame and the
//! socket stays open), diagnostics counters, and injection reaching the
//! input backend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use deskpilot_core::{DeviceSession, Permission, PermissionSet};
use deskpilot_server::application::now_ms;
use deskpilot_server::application::pairing::PairingGateway;
use deskpilot_server::application::session_store::SessionStore;
use deskpilot_server::application::streaming::StreamingOrchestrator;
use deskpilot_server::application::transfer::TransferBroker;
use deskpilot_server::domain::config::ServerConfig;
use deskpilot_server::infrastructure::inject::MockInjector;
use deskpilot_server::infrastructure::system::SystemActions;
use deskpilot_server::infrastructure::ws_input::PushRegistry;
use deskpilot_server::{build_router, AppState};

struct LiveServer {
    addr: SocketAddr,
    store: Arc<SessionStore>,
    injector: Arc<MockInjector>,
}

async fn start_server() -> LiveServer {
    let config = Arc::new(ServerConfig::default());
    let store = Arc::new(SessionStore::new(
        config.expiry_rule(),
        config.sessions.max_sessions,
    ));
    let gateway = Arc::new(PairingGateway::new(
        Arc::clone(&store),
        config.pin_limits(),
        config.pairing.window_s * 1_000,
        config.pairing.qr_token_ttl_s * 1_000,
        config.default_permission_set(),
    ));
    let orchestrator = StreamingOrchestrator::new(config.streaming.clone(), Vec::new());
    let broker = Arc::new(TransferBroker::new(
        Arc::clone(&store),
        config.transfer.clone(),
    ));
    let injector = Arc::new(MockInjector::new());

    let state = AppState {
        config: Arc::clone(&config),
        store: Arc::clone(&store),
        gateway,
        orchestrator,
        broker,
        injector: injector.clone(),
        registry: Arc::new(PushRegistry::new()),
        system: Arc::new(SystemActions::new(config.system.clone())),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(
            listener,
            build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve");
    });

    LiveServer {
        addr,
        store,
        injector,
    }
}

fn session_with(store: &SessionStore, perms: PermissionSet) -> String {
    let session = DeviceSession::new("dev-ws", "WS Phone", None, perms, now_ms());
    store.insert(session, now_ms()).to_string()
}

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(addr: SocketAddr, token: &str) -> WsClient {
    let url = format!("ws://{addr}/input?token={token}");
    let (client, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("websocket connect");
    client
}

async fn send_json(client: &mut WsClient, value: serde_json::Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("send frame");
}

/// Reads frames until one matches `predicate`, failing after `secs` seconds.
/// Heartbeat pings and cursor frames may interleave with the frame a test
/// is waiting for.
async fn expect_frame<F>(client: &mut WsClient, secs: u64, mut predicate: F) -> serde_json::Value
where
    F: FnMut(&serde_json::Value) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        let frame = tokio::time::timeout_at(deadline, client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("transport error");
        if let Message::Text(text) = frame {
            let value: serde_json::Value = serde_json::from_str(text.as_str()).expect("json frame");
            if predicate(&value) {
                return value;
            }
        }
    }
}

async fn handshake(client: &mut WsClient) -> serde_json::Value {
    send_json(
        client,
        serde_json::json!({"type": "hello", "protocol_version": 2}),
    )
    .await;
    expect_frame(client, 5, |v| v["type"] == "hello_ack").await
}

#[tokio::test]
async fn test_hello_is_acknowledged_with_protocol_info() {
    let server = start_server().await;
    let token = session_with(&server.store, PermissionSet::all());
    let mut client = connect(server.addr, &token).await;

    let ack = handshake(&mut client).await;

    assert_eq!(ack["protocol"]["protocol_version"], 2);
    assert!(ack["heartbeat_interval_ms"].as_u64().unwrap() >= 1_000);
    assert_eq!(ack["capabilities"]["pointer"], true);
}

#[tokio::test]
async fn test_unsupported_protocol_version_is_rejected() {
    let server = start_server().await;
    let token = session_with(&server.store, PermissionSet::all());
    let mut client = connect(server.addr, &token).await;

    send_json(
        &mut client,
        serde_json::json!({"type": "hello", "protocol_version": 99}),
    )
    .await;

    let error = expect_frame(&mut client, 5, |v| v["type"] == "error").await;
    assert_eq!(error["code"], "version_mismatch");
}

#[tokio::test]
async fn test_unknown_token_cannot_upgrade() {
    let server = start_server().await;
    let url = format!(
        "ws://{}/input?token={}",
        server.addr,
        uuid::Uuid::new_v4()
    );

    let result = tokio_tungstenite::connect_async(url).await;

    assert!(result.is_err(), "upgrade must be refused for unknown sessions");
}

#[tokio::test]
async fn test_stream_only_session_key_event_denied_but_connection_survives() {
    let server = start_server().await;
    let perms: PermissionSet = [Permission::Stream].into_iter().collect();
    let token = session_with(&server.store, perms);
    let mut client = connect(server.addr, &token).await;
    handshake(&mut client).await;

    // Act: a key event the session is not allowed to inject.
    send_json(
        &mut client,
        serde_json::json!({"type": "key", "key": "a"}),
    )
    .await;

    // Assert: a denied frame naming the missing permission.
    let denied = expect_frame(&mut client, 5, |v| v["type"] == "denied").await;
    assert_eq!(denied["action"], "key");
    assert_eq!(denied["permission"], "keyboard");

    // The connection is still usable: diagnostics round-trips and shows the
    // denial, and nothing reached the injector.
    send_json(&mut client, serde_json::json!({"type": "diagnostics"})).await;
    let diag = expect_frame(&mut client, 5, |v| v["type"] == "diagnostics").await;
    assert_eq!(diag["events_denied"], 1);
    assert_eq!(diag["events_injected"], 0);
    assert_eq!(server.injector.event_count(), 0);
}

#[tokio::test]
async fn test_pointer_events_reach_the_injector_and_move_the_cursor() {
    let server = start_server().await;
    let token = session_with(&server.store, PermissionSet::all());
    let mut client = connect(server.addr, &token).await;
    handshake(&mut client).await;

    send_json(
        &mut client,
        serde_json::json!({"type": "pointer_move", "dx": 25.0, "dy": -10.0}),
    )
    .await;

    // A cursor frame follows on the cursor ticker.
    let cursor = expect_frame(&mut client, 5, |v| v["type"] == "cursor").await;
    assert_eq!(cursor["x"], 960 + 25);
    assert_eq!(cursor["y"], 540 - 10);
    assert!(server.injector.event_count() >= 1);
}

#[tokio::test]
async fn test_client_ping_is_echoed_as_pong() {
    let server = start_server().await;
    let token = session_with(&server.store, PermissionSet::all());
    let mut client = connect(server.addr, &token).await;
    handshake(&mut client).await;

    send_json(&mut client, serde_json::json!({"type": "ping", "token": 77})).await;

    let pong = expect_frame(&mut client, 5, |v| v["type"] == "pong").await;
    assert_eq!(pong["token"], 77);
}

#[tokio::test]
async fn test_revoked_session_closes_on_next_event() {
    let server = start_server().await;
    let token = session_with(&server.store, PermissionSet::all());
    let mut client = connect(server.addr, &token).await;
    handshake(&mut client).await;

    server.store.revoke(token.parse().unwrap());
    send_json(
        &mut client,
        serde_json::json!({"type": "key", "key": "enter"}),
    )
    .await;

    let error = expect_frame(&mut client, 5, |v| v["type"] == "error").await;
    assert_eq!(error["code"], "session_expired");
}
