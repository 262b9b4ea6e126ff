//! Live-input WebSocket protocol messages.
//!
//! All frames are JSON objects discriminated by a `"type"` field.  The client
//! opens with `hello`; the server answers with `hello_ack` (or `error` and a
//! close on version mismatch).  While active, the server pings on a fixed
//! interval and the client must pong; input events flow client→server and
//! cursor/diagnostic/transfer pushes flow server→client.

use serde::{Deserialize, Serialize};

use crate::domain::permissions::Permission;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u16 = 2;

/// Oldest client protocol version the server still accepts.
pub const MIN_SUPPORTED_PROTOCOL_VERSION: u16 = 1;

// ── Shared payload fragments ──────────────────────────────────────────────────

/// Protocol metadata advertised in pairing responses and `hello_ack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolInfo {
    pub protocol_version: u16,
    pub min_supported_protocol_version: u16,
    /// Server build version string (e.g. `"0.1.0"`).
    pub server_version: String,
    /// Milliseconds since Unix epoch on the server at generation time.
    pub server_time_ms: u64,
    /// Stable feature flags supported by this build.
    pub features: FeatureFlags,
}

/// Feature flags a client may branch on.  Shipped flags are never removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub stream_offer: bool,
    pub stream_backend_select: bool,
    pub ws_cursor: bool,
    pub ws_heartbeat: bool,
    pub file_transfer_resume: bool,
    pub file_transfer_checksum: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        FeatureFlags {
            stream_offer: true,
            stream_backend_select: true,
            ws_cursor: true,
            ws_heartbeat: true,
            file_transfer_resume: true,
            file_transfer_checksum: true,
        }
    }
}

/// Input capabilities a client claims in `hello` / the server accepts in
/// `hello_ack`.  The intersection with granted permissions decides what the
/// connection can actually do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputCapabilities {
    pub pointer: bool,
    pub keyboard: bool,
}

impl Default for InputCapabilities {
    fn default() -> Self {
        InputCapabilities {
            pointer: true,
            keyboard: true,
        }
    }
}

/// Pointer button identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerButton {
    Left,
    Right,
    Middle,
}

/// What to do with a pointer button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonAction {
    /// Press and hold (drag start).
    Press,
    /// Release a held button (drag end).
    Release,
    /// Full press+release.
    Click,
    DoubleClick,
}

/// What to do with a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAction {
    Down,
    Up,
    /// Full down+up.  The default when a client omits the field.
    Tap,
}

impl Default for KeyAction {
    fn default() -> Self {
        KeyAction::Tap
    }
}

/// Close/error codes surfaced on the input channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolErrorCode {
    VersionMismatch,
    HelloTimeout,
    MalformedMessage,
    SessionExpired,
    HeartbeatTimeout,
    InputBackendUnavailable,
}

// ── Client → server ───────────────────────────────────────────────────────────

/// Frames a client may send on the input channel.
///
/// Input events carry a client-side timestamp (`ts_ms`, milliseconds since
/// Unix epoch, zero if unknown) so the injection collaborator can reconstruct
/// gesture timing; the server guarantees ordered delivery but does not
/// interpret gestures itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Must be the first frame on every connection.
    Hello {
        protocol_version: u16,
        #[serde(default)]
        device_label: Option<String>,
        #[serde(default)]
        capabilities: InputCapabilities,
    },
    /// Heartbeat reply to a server `ping`.
    Pong { token: u64 },
    /// Client-initiated latency probe; the server echoes a `pong`.
    Ping { token: u64 },
    /// Relative pointer movement (raw deltas, pre-conditioning).
    PointerMove {
        dx: f64,
        dy: f64,
        #[serde(default)]
        ts_ms: u64,
    },
    /// Pointer button press/release/click.
    PointerButton {
        button: PointerButton,
        action: ButtonAction,
        #[serde(default)]
        ts_ms: u64,
    },
    /// Wheel scroll, in notches.
    Scroll {
        #[serde(default)]
        dx: i32,
        dy: i32,
        #[serde(default)]
        ts_ms: u64,
    },
    /// Named key (e.g. `"enter"`, `"backspace"`, `"meta"`).
    Key {
        key: String,
        #[serde(default)]
        action: KeyAction,
        #[serde(default)]
        ts_ms: u64,
    },
    /// Literal text insertion.
    Text {
        text: String,
        #[serde(default)]
        ts_ms: u64,
    },
    /// Request a diagnostics snapshot without interrupting the event stream.
    Diagnostics,
}

// ── Server → client ───────────────────────────────────────────────────────────

/// Per-connection counters returned by a `diagnostics` request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionDiagnostics {
    pub events_received: u64,
    pub events_injected: u64,
    pub events_denied: u64,
    pub events_dropped: u64,
    pub heartbeat_misses: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Frames the server may send on the input channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Response to `hello`: the capabilities the server accepted plus the
    /// heartbeat contract the client must honor.
    HelloAck {
        capabilities: InputCapabilities,
        heartbeat_interval_ms: u64,
        protocol: ProtocolInfo,
    },
    /// Heartbeat probe; the client must answer with `pong`.
    Ping { token: u64 },
    /// Echo of a client `ping`.
    Pong { token: u64 },
    /// Virtual-cursor position on its logical canvas.
    Cursor { x: i32, y: i32, w: i32, h: i32 },
    /// An event was dropped because the session lacks `permission`.  The
    /// connection stays open.
    Denied {
        action: String,
        permission: Permission,
    },
    /// Snapshot answering a `diagnostics` request.
    Diagnostics(ConnectionDiagnostics),
    /// A file is ready for this device to download.
    FileTransfer {
        transfer_id: String,
        filename: String,
        url: String,
        size: u64,
        sha256: String,
        accept_ranges: bool,
        expires_at_ms: u64,
    },
    /// Fatal protocol error; the connection closes after this frame.
    Error {
        code: ProtocolErrorCode,
        message: String,
    },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
