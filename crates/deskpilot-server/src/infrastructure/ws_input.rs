//! The live input channel: one WebSocket per controlling device.
//!
//! Connection lifecycle: the first frame must be `hello` (with a protocol
//! version inside the supported window) before the hello timeout, answered
//! by `hello_ack`.  After that the connection is active: input events flow
//! client to server in order, the server pings on the heartbeat interval
//! and drops the connection after too many unanswered pings, and a cursor
//! ticker streams the virtual pointer position back to the client.
//!
//! Authorization happens per event, not per connection.  A denied event is
//! answered with a `denied` frame and the connection stays open; only an
//! expired or revoked session closes it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use deskpilot_core::protocol::messages::{
    ClientMessage, ConnectionDiagnostics, InputCapabilities, ProtocolErrorCode, ProtocolInfo,
    ServerMessage, MIN_SUPPORTED_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
use deskpilot_core::{Permission, PointerState, SessionId, VirtualCursor};

use crate::application::now_ms;
use crate::application::session_store::{GateError, SessionStore};
use crate::domain::config::InputSection;
use crate::infrastructure::inject::{InjectError, InputInjector};

/// Logical canvas the virtual cursor lives on when the host resolution is
/// unknown.
const DEFAULT_CANVAS: (i32, i32) = (1920, 1080);

// ── Push registry ─────────────────────────────────────────────────────────────

/// Maps active input connections by session so out-of-band frames (file
/// transfer offers from the management channel) can be pushed to a device.
#[derive(Default)]
pub struct PushRegistry {
    inner: Mutex<HashMap<SessionId, mpsc::UnboundedSender<ServerMessage>>>,
}

impl PushRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, session: SessionId, tx: mpsc::UnboundedSender<ServerMessage>) {
        self.guard().insert(session, tx);
    }

    fn unregister(&self, session: SessionId) {
        self.guard().remove(&session);
    }

    /// Pushes a frame to the connection owned by `session`.  Returns `false`
    /// when the device has no live input connection.
    pub fn push(&self, session: SessionId, message: ServerMessage) -> bool {
        match self.guard().get(&session) {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    pub fn is_connected(&self, session: SessionId) -> bool {
        self.guard().contains_key(&session)
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<SessionId, mpsc::UnboundedSender<ServerMessage>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Connection driver ─────────────────────────────────────────────────────────

pub struct InputContext {
    pub store: Arc<SessionStore>,
    pub injector: Arc<dyn InputInjector>,
    pub registry: Arc<PushRegistry>,
    pub cfg: InputSection,
    pub token: SessionId,
}

pub fn version_supported(version: u16) -> bool {
    (MIN_SUPPORTED_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version)
}

/// Builds the protocol descriptor advertised in `hello_ack` and on the
/// discovery endpoint.
pub fn protocol_info() -> ProtocolInfo {
    ProtocolInfo {
        protocol_version: PROTOCOL_VERSION,
        min_supported_protocol_version: MIN_SUPPORTED_PROTOCOL_VERSION,
        server_version: env!("CARGO_PKG_VERSION").to_string(),
        server_time_ms: now_ms(),
        features: Default::default(),
    }
}

#[derive(Default)]
struct Counters {
    received: u64,
    injected: u64,
    denied: u64,
    dropped: u64,
    heartbeat_misses: u32,
    last_error: Option<String>,
}

impl Counters {
    fn snapshot(&self) -> ConnectionDiagnostics {
        ConnectionDiagnostics {
            events_received: self.received,
            events_injected: self.injected,
            events_denied: self.denied,
            events_dropped: self.dropped,
            heartbeat_misses: self.heartbeat_misses,
            last_error: self.last_error.clone(),
        }
    }
}

async fn send(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), ()> {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "failed to encode server frame");
            return Err(());
        }
    };
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

async fn close_with(socket: &mut WebSocket, code: ProtocolErrorCode, message: &str) {
    let _ = send(
        socket,
        &ServerMessage::Error {
            code,
            message: message.to_string(),
        },
    )
    .await;
    let _ = socket.close().await;
}

/// Drives one input connection to completion.  Consumes the socket; the
/// HTTP layer calls this from the upgrade callback.
pub async fn serve_input(mut socket: WebSocket, ctx: InputContext) {
    let capabilities = match hello_phase(&mut socket, &ctx).await {
        Some(caps) => caps,
        None => return,
    };

    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    ctx.registry.register(ctx.token, push_tx);
    active_phase(&mut socket, &ctx, capabilities, &mut push_rx).await;
    ctx.registry.unregister(ctx.token);
}

/// Waits for a valid `hello` and answers with `hello_ack`.  Returns `None`
/// when the connection must not proceed.
async fn hello_phase(socket: &mut WebSocket, ctx: &InputContext) -> Option<InputCapabilities> {
    let hello_deadline = Duration::from_secs(ctx.cfg.hello_timeout_s.max(1));
    let first = match timeout(hello_deadline, socket.recv()).await {
        Ok(Some(Ok(frame))) => frame,
        Ok(_) => return None,
        Err(_) => {
            close_with(
                socket,
                ProtocolErrorCode::HelloTimeout,
                "no hello within the handshake window",
            )
            .await;
            return None;
        }
    };

    let Message::Text(text) = first else {
        close_with(
            socket,
            ProtocolErrorCode::MalformedMessage,
            "expected a text hello frame",
        )
        .await;
        return None;
    };

    let (protocol_version, device_label, capabilities) =
        match serde_json::from_str::<ClientMessage>(text.as_str()) {
            Ok(ClientMessage::Hello {
                protocol_version,
                device_label,
                capabilities,
            }) => (protocol_version, device_label, capabilities),
            Ok(_) => {
                close_with(
                    socket,
                    ProtocolErrorCode::MalformedMessage,
                    "first frame must be hello",
                )
                .await;
                return None;
            }
            Err(e) => {
                close_with(socket, ProtocolErrorCode::MalformedMessage, &e.to_string()).await;
                return None;
            }
        };

    if !version_supported(protocol_version) {
        close_with(
            socket,
            ProtocolErrorCode::VersionMismatch,
            &format!(
                "protocol {protocol_version} outside supported window \
                 {MIN_SUPPORTED_PROTOCOL_VERSION}..={PROTOCOL_VERSION}"
            ),
        )
        .await;
        return None;
    }

    // The session must at least exist; capability checks happen per event.
    if let Err(e) = ctx.store.resolve(ctx.token) {
        debug!(error = %e, "hello from unknown or expired session");
        close_with(socket, ProtocolErrorCode::SessionExpired, "session invalid").await;
        return None;
    }

    let ack = ServerMessage::HelloAck {
        capabilities,
        heartbeat_interval_ms: ctx.cfg.heartbeat_interval_s.max(1) * 1_000,
        protocol: protocol_info(),
    };
    if send(socket, &ack).await.is_err() {
        return None;
    }
    info!(
        session_id = %ctx.token,
        device_label = device_label.as_deref().unwrap_or(""),
        protocol_version,
        "input connection active"
    );
    Some(capabilities)
}

async fn active_phase(
    socket: &mut WebSocket,
    ctx: &InputContext,
    capabilities: InputCapabilities,
    push_rx: &mut mpsc::UnboundedReceiver<ServerMessage>,
) {
    let filter = ctx.cfg.pointer_filter();
    let mut pointer_state = PointerState::default();
    let mut cursor = VirtualCursor::centered(DEFAULT_CANVAS.0, DEFAULT_CANVAS.1);
    let mut cursor_dirty = true;
    let mut counters = Counters::default();

    let mut ping_ticker = interval(Duration::from_secs(ctx.cfg.heartbeat_interval_s.max(1)));
    ping_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick of a tokio interval fires immediately; consume it so
    // the first ping goes out one interval after the handshake.
    ping_ticker.tick().await;

    let cursor_period = Duration::from_millis(1_000 / u64::from(ctx.cfg.cursor_stream_fps.max(1)));
    let mut cursor_ticker = interval(cursor_period);
    cursor_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut next_ping_token: u64 = 1;
    let mut awaiting_pong: Option<u64> = None;

    loop {
        tokio::select! {
            frame = socket.recv() => {
                let Some(Ok(frame)) = frame else { break };
                let message = match frame {
                    Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(message) => message,
                        Err(e) => {
                            close_with(socket, ProtocolErrorCode::MalformedMessage, &e.to_string()).await;
                            break;
                        }
                    },
                    Message::Close(_) => break,
                    // Transport pings are handled by the WebSocket layer.
                    _ => continue,
                };

                match handle_message(
                    socket,
                    ctx,
                    capabilities,
                    message,
                    &filter,
                    &mut pointer_state,
                    &mut cursor,
                    &mut cursor_dirty,
                    &mut counters,
                    &mut awaiting_pong,
                )
                .await
                {
                    Flow::Continue => {}
                    Flow::Close => break,
                }
            }

            _ = ping_ticker.tick() => {
                if awaiting_pong.is_some() {
                    counters.heartbeat_misses += 1;
                    if counters.heartbeat_misses >= ctx.cfg.heartbeat_miss_limit {
                        warn!(session_id = %ctx.token, misses = counters.heartbeat_misses,
                              "heartbeat limit reached");
                        close_with(socket, ProtocolErrorCode::HeartbeatTimeout, "missed heartbeats").await;
                        break;
                    }
                }
                let token = next_ping_token;
                next_ping_token += 1;
                awaiting_pong = Some(token);
                if send(socket, &ServerMessage::Ping { token }).await.is_err() {
                    break;
                }
            }

            _ = cursor_ticker.tick() => {
                if cursor_dirty {
                    cursor_dirty = false;
                    let frame = ServerMessage::Cursor {
                        x: cursor.x,
                        y: cursor.y,
                        w: cursor.width,
                        h: cursor.height,
                    };
                    if send(socket, &frame).await.is_err() {
                        break;
                    }
                }
            }

            pushed = push_rx.recv() => {
                let Some(message) = pushed else { break };
                if send(socket, &message).await.is_err() {
                    break;
                }
            }
        }
    }

    info!(
        session_id = %ctx.token,
        received = counters.received,
        injected = counters.injected,
        denied = counters.denied,
        dropped = counters.dropped,
        "input connection closed"
    );
}

enum Flow {
    Continue,
    Close,
}

#[allow(clippy::too_many_arguments)]
async fn handle_message(
    socket: &mut WebSocket,
    ctx: &InputContext,
    capabilities: InputCapabilities,
    message: ClientMessage,
    filter: &deskpilot_core::PointerFilter,
    pointer_state: &mut PointerState,
    cursor: &mut VirtualCursor,
    cursor_dirty: &mut bool,
    counters: &mut Counters,
    awaiting_pong: &mut Option<u64>,
) -> Flow {
    match message {
        ClientMessage::Hello { .. } => {
            close_with(
                socket,
                ProtocolErrorCode::MalformedMessage,
                "hello is only valid as the first frame",
            )
            .await;
            Flow::Close
        }

        ClientMessage::Pong { token } => {
            if *awaiting_pong == Some(token) {
                *awaiting_pong = None;
                counters.heartbeat_misses = 0;
            }
            Flow::Continue
        }

        ClientMessage::Ping { token } => {
            match send(socket, &ServerMessage::Pong { token }).await {
                Ok(()) => Flow::Continue,
                Err(()) => Flow::Close,
            }
        }

        ClientMessage::Diagnostics => {
            match send(socket, &ServerMessage::Diagnostics(counters.snapshot())).await {
                Ok(()) => Flow::Continue,
                Err(()) => Flow::Close,
            }
        }

        ClientMessage::PointerMove { dx, dy, .. } => {
            counters.received += 1;
            if !capabilities.pointer {
                counters.dropped += 1;
                return Flow::Continue;
            }
            match authorize(socket, ctx, Permission::Mouse, "pointer_move", counters).await {
                Gate::Allowed => {}
                Gate::Denied => return Flow::Continue,
                Gate::Fatal => return Flow::Close,
            }
            let (mx, my) = filter.condition(pointer_state, dx, dy);
            if (mx, my) == (0, 0) {
                return Flow::Continue;
            }
            cursor.move_by(mx, my);
            *cursor_dirty = true;
            let (x, y) = (cursor.x, cursor.y);
            record_injection(
                counters,
                inject(&ctx.injector, move |i| i.pointer_move(x, y)).await,
            );
            Flow::Continue
        }

        ClientMessage::PointerButton { button, action, .. } => {
            counters.received += 1;
            match authorize(socket, ctx, Permission::Mouse, "pointer_button", counters).await {
                Gate::Allowed => {}
                Gate::Denied => return Flow::Continue,
                Gate::Fatal => return Flow::Close,
            }
            let (x, y) = (cursor.x, cursor.y);
            record_injection(
                counters,
                inject(&ctx.injector, move |i| i.button(button, action, x, y)).await,
            );
            Flow::Continue
        }

        ClientMessage::Scroll { dx, dy, .. } => {
            counters.received += 1;
            match authorize(socket, ctx, Permission::Mouse, "scroll", counters).await {
                Gate::Allowed => {}
                Gate::Denied => return Flow::Continue,
                Gate::Fatal => return Flow::Close,
            }
            record_injection(counters, inject(&ctx.injector, move |i| i.scroll(dx, dy)).await);
            Flow::Continue
        }

        ClientMessage::Key { key, action, .. } => {
            counters.received += 1;
            if !capabilities.keyboard {
                counters.dropped += 1;
                return Flow::Continue;
            }
            match authorize(socket, ctx, Permission::Keyboard, "key", counters).await {
                Gate::Allowed => {}
                Gate::Denied => return Flow::Continue,
                Gate::Fatal => return Flow::Close,
            }
            record_injection(
                counters,
                inject(&ctx.injector, move |i| i.key(&key, action)).await,
            );
            Flow::Continue
        }

        ClientMessage::Text { text, .. } => {
            counters.received += 1;
            match authorize(socket, ctx, Permission::Keyboard, "text", counters).await {
                Gate::Allowed => {}
                Gate::Denied => return Flow::Continue,
                Gate::Fatal => return Flow::Close,
            }
            record_injection(
                counters,
                inject(&ctx.injector, move |i| i.text(&text)).await,
            );
            Flow::Continue
        }
    }
}

enum Gate {
    Allowed,
    Denied,
    Fatal,
}

/// Checks the session for `required` and reports the outcome to the client.
/// Permission denials answer with `denied` and leave the connection open;
/// an expired or revoked session is fatal.
async fn authorize(
    socket: &mut WebSocket,
    ctx: &InputContext,
    required: Permission,
    action: &str,
    counters: &mut Counters,
) -> Gate {
    match ctx.store.validate(ctx.token, required) {
        Ok(_) => Gate::Allowed,
        Err(GateError::PermissionDenied(permission)) => {
            counters.denied += 1;
            let frame = ServerMessage::Denied {
                action: action.to_string(),
                permission,
            };
            match send(socket, &frame).await {
                Ok(()) => Gate::Denied,
                Err(()) => Gate::Fatal,
            }
        }
        Err(GateError::Expired) | Err(GateError::Unauthenticated) => {
            close_with(socket, ProtocolErrorCode::SessionExpired, "session invalid").await;
            Gate::Fatal
        }
    }
}

/// Runs one injector call on the blocking pool.  The xdotool backend waits
/// on a child process; doing that inline would stall heartbeats and the rest
/// of the select loop.
async fn inject(
    injector: &Arc<dyn InputInjector>,
    op: impl FnOnce(&dyn InputInjector) -> Result<(), InjectError> + Send + 'static,
) -> Result<(), InjectError> {
    let injector = Arc::clone(injector);
    match tokio::task::spawn_blocking(move || op(injector.as_ref())).await {
        Ok(result) => result,
        Err(e) => Err(InjectError::Unavailable(format!("injection task: {e}"))),
    }
}

fn record_injection(counters: &mut Counters, result: Result<(), InjectError>) {
    match result {
        Ok(()) => counters.injected += 1,
        Err(e) => {
            counters.dropped += 1;
            counters.last_error = Some(e.to_string());
            debug!(error = %e, "injection failed");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use deskpilot_core::protocol::messages::KeyAction;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn test_version_window_bounds() {
        assert!(version_supported(MIN_SUPPORTED_PROTOCOL_VERSION));
        assert!(version_supported(PROTOCOL_VERSION));
        assert!(!version_supported(MIN_SUPPORTED_PROTOCOL_VERSION - 1));
        assert!(!version_supported(PROTOCOL_VERSION + 1));
    }

    #[tokio::test]
    async fn test_inject_runs_on_blocking_pool_and_surfaces_errors() {
        // Arrange
        let mock = Arc::new(crate::infrastructure::inject::MockInjector::new());
        let injector: Arc<dyn InputInjector> = mock.clone();

        // Act
        let ok = inject(&injector, |i| i.key("a", KeyAction::Tap)).await;
        mock.set_should_fail(true);
        let err = inject(&injector, |i| i.key("b", KeyAction::Tap)).await;

        // Assert
        assert!(ok.is_ok());
        assert!(err.is_err());
        assert_eq!(mock.event_count(), 1);
    }

    #[test]
    fn test_counters_snapshot_copies_all_fields() {
        // Arrange
        let counters = Counters {
            received: 10,
            injected: 7,
            denied: 2,
            dropped: 1,
            heartbeat_misses: 1,
            last_error: Some("boom".to_string()),
        };

        // Act
        let snap = counters.snapshot();

        // Assert
        assert_eq!(snap.events_received, 10);
        assert_eq!(snap.events_injected, 7);
        assert_eq!(snap.events_denied, 2);
        assert_eq!(snap.events_dropped, 1);
        assert_eq!(snap.heartbeat_misses, 1);
        assert_eq!(snap.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_push_registry_routes_only_to_registered_sessions() {
        // Arrange
        let registry = PushRegistry::new();
        let session = SessionId::new_v4();
        let other = SessionId::new_v4();
        let (tx, mut rx) = unbounded_channel();
        registry.register(session, tx);

        // Act
        let hit = registry.push(session, ServerMessage::Pong { token: 9 });
        let miss = registry.push(other, ServerMessage::Pong { token: 9 });

        // Assert
        assert!(hit);
        assert!(!miss);
        assert!(registry.is_connected(session));
        assert!(!registry.is_connected(other));
        assert_eq!(rx.try_recv().ok(), Some(ServerMessage::Pong { token: 9 }));
    }

    #[test]
    fn test_push_registry_unregister_drops_the_route() {
        // Arrange
        let registry = PushRegistry::new();
        let session = SessionId::new_v4();
        let (tx, _rx) = unbounded_channel();
        registry.register(session, tx);

        // Act
        registry.unregister(session);

        // Assert
        assert!(!registry.push(session, ServerMessage::Pong { token: 1 }));
    }

    #[test]
    fn test_key_action_default_is_tap_on_the_wire() {
        // The deny path names the action; the injector relies on the default.
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"key","key":"escape"}"#).expect("parse");
        assert_eq!(
            msg,
            ClientMessage::Key {
                key: "escape".to_string(),
                action: KeyAction::Tap,
                ts_ms: 0,
            }
        );
    }
}
