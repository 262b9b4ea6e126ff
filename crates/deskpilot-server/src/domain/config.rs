//! Server configuration schema.
//!
//! One typed [`ServerConfig`] struct, loaded once at startup and passed by
//! reference (or cheap clone) to every service.  No component reads
//! environment variables or config files on its own.
//!
//! Every field has a serde default so a partial (or absent) TOML file works
//! on first run and across upgrades.  Each timeout is an independent field;
//! there is no global timeout.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use deskpilot_core::domain::pairing::PinLimits;
use deskpilot_core::{ExpiryRule, Permission, PermissionSet, PointerFilter};

// ── Top level ─────────────────────────────────────────────────────────────────

/// Top-level server configuration stored in `deskpilot.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub sessions: SessionSection,
    pub pairing: PairingSection,
    pub input: InputSection,
    pub streaming: StreamingSection,
    pub transfer: TransferSection,
    pub system: SystemSection,
}

/// Network bind and identity settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// IP address to bind.  `"0.0.0.0"` accepts LAN connections.
    pub bind_address: String,
    pub port: u16,
    /// Name shown to clients in pairing responses.
    pub server_name: String,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    pub log_level: String,
}

/// Session lifetime and persistence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Absolute session lifetime in seconds.  `0` means unlimited.
    pub ttl_s: u64,
    /// Idle expiry in seconds, measured from last activity.  `0` disables it.
    pub idle_ttl_s: u64,
    /// Maximum paired devices.  `0` means unlimited; above it the
    /// least-recently-seen unpinned session is evicted.
    pub max_sessions: usize,
    /// JSON snapshot of the session table.
    pub snapshot_path: PathBuf,
    /// Structural changes are flushed at most this often.
    pub snapshot_debounce_ms: u64,
    /// Expired sessions are also swept on this interval, not only lazily.
    pub sweep_interval_s: u64,
    /// Permission set issued to a freshly paired device.
    pub default_permissions: Vec<Permission>,
}

/// Pairing code and rate-limit settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingSection {
    /// Validity window of the current pairing code, in seconds.
    pub window_s: u64,
    /// One-time QR token lifetime in seconds.
    pub qr_token_ttl_s: u64,
    /// Sliding window over which PIN failures are counted, in seconds.
    pub pin_window_s: u64,
    /// Failures within the window before a hard lockout.
    pub pin_max_fails: u32,
    /// Hard lockout duration in seconds.
    pub pin_block_s: u64,
    /// Base of the exponential backoff applied between the first failures,
    /// in milliseconds.
    pub pin_backoff_base_ms: u64,
}

/// Live-input channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSection {
    /// How long a freshly accepted socket may sit without a `hello`.
    pub hello_timeout_s: u64,
    /// Server ping interval in seconds.
    pub heartbeat_interval_s: u64,
    /// Consecutive unanswered pings before the connection is torn down.
    pub heartbeat_miss_limit: u32,
    /// Multiplier applied to raw pointer deltas.
    pub pointer_gain: f64,
    /// Per-tick, per-axis pointer clamp in pixels.
    pub pointer_max_step: i32,
    /// Deltas with magnitude below this are suppressed as jitter.
    pub pointer_deadzone: f64,
    /// Upper bound on virtual-cursor position pushes per second.
    pub cursor_stream_fps: u32,
}

impl InputSection {
    /// Pointer conditioning parameters for new input connections.
    pub fn pointer_filter(&self) -> PointerFilter {
        PointerFilter {
            gain: self.pointer_gain,
            max_step: self.pointer_max_step,
            deadzone: self.pointer_deadzone,
        }
    }
}

/// Streaming profiles, budgets, and backend command templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingSection {
    /// Give up on a viewer if no backend yields a frame within this budget.
    pub first_frame_budget_ms: u64,
    /// Probe results are cached this long before a backend is re-probed.
    pub probe_cache_ttl_s: u64,
    /// Suggested client reconnect delay carried in the stream offer.
    pub reconnect_hint_ms: u64,
    /// Consecutive non-fatal frame errors before a backend is demoted to
    /// degraded and ranked below healthy ones.
    pub backend_degrade_threshold: u32,
    /// Default profile ceilings.
    pub default_width: u32,
    pub default_quality: u8,
    pub default_fps: u32,
    /// Low-latency profile ceilings (tighter than the default profile).
    pub lowlat_max_width: u32,
    pub lowlat_max_quality: u8,
    pub lowlat_max_fps: u32,
    /// Command template for the primary encoder pipeline.  Placeholders
    /// `{width}`, `{quality}`, `{fps}` are substituted before spawn.  An
    /// empty template disables the backend.
    pub pipeline_a_command: Vec<String>,
    /// Command template for the secondary encoder pipeline.
    pub pipeline_b_command: Vec<String>,
    /// Command producing a single screenshot file at `{path}`.
    pub screenshot_command: Vec<String>,
}

/// Transfer broker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSection {
    /// Directory uploads land in and downloads are served from.
    pub files_dir: PathBuf,
    /// Download grant lifetime in seconds.
    pub grant_ttl_s: u64,
    /// Full retrievals allowed per grant.  Single-use by default.
    pub max_consumes: u32,
    /// When set, a grant is only honored from the address that paired the
    /// issuing session.
    pub strict_ip_pin: bool,
    pub upload_max_bytes: u64,
    /// Lowercase extensions accepted on upload, without dots.
    pub upload_allowed_ext: Vec<String>,
}

/// Power/system action command candidates, tried in order until one succeeds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSection {
    /// Action name to candidate command lines, e.g.
    /// `lock = [["loginctl", "lock-session"], ["xdg-screensaver", "lock"]]`.
    pub actions: BTreeMap<String, Vec<Vec<String>>>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            bind_address: "0.0.0.0".to_string(),
            port: 8787,
            server_name: "DeskPilot".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        SessionSection {
            ttl_s: 0,
            idle_ttl_s: 0,
            max_sessions: 16,
            snapshot_path: PathBuf::from("sessions.json"),
            snapshot_debounce_ms: 2_000,
            sweep_interval_s: 60,
            default_permissions: vec![
                Permission::Mouse,
                Permission::Keyboard,
                Permission::Stream,
                Permission::Upload,
                Permission::FileSend,
            ],
        }
    }
}

impl Default for PairingSection {
    fn default() -> Self {
        PairingSection {
            window_s: 60,
            qr_token_ttl_s: 120,
            pin_window_s: 60,
            pin_max_fails: 8,
            pin_block_s: 300,
            pin_backoff_base_ms: 1_000,
        }
    }
}

impl Default for InputSection {
    fn default() -> Self {
        InputSection {
            hello_timeout_s: 10,
            heartbeat_interval_s: 5,
            heartbeat_miss_limit: 3,
            pointer_gain: 1.0,
            pointer_max_step: 200,
            pointer_deadzone: 0.05,
            cursor_stream_fps: 30,
        }
    }
}

impl Default for StreamingSection {
    fn default() -> Self {
        StreamingSection {
            first_frame_budget_ms: 4_000,
            probe_cache_ttl_s: 8,
            reconnect_hint_ms: 700,
            backend_degrade_threshold: 5,
            default_width: 1280,
            default_quality: 55,
            default_fps: 30,
            lowlat_max_width: 1280,
            lowlat_max_quality: 50,
            lowlat_max_fps: 45,
            pipeline_a_command: Vec::new(),
            pipeline_b_command: Vec::new(),
            screenshot_command: Vec::new(),
        }
    }
}

impl Default for TransferSection {
    fn default() -> Self {
        TransferSection {
            files_dir: PathBuf::from("files"),
            grant_ttl_s: 300,
            max_consumes: 1,
            strict_ip_pin: true,
            upload_max_bytes: 512 * 1024 * 1024,
            upload_allowed_ext: [
                "txt", "pdf", "png", "jpg", "jpeg", "gif", "mp4", "mp3", "zip", "apk", "doc",
                "docx", "xls", "xlsx", "ppt", "pptx", "csv", "json", "md",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

// ── Derived views ─────────────────────────────────────────────────────────────

impl ServerConfig {
    /// Socket address the HTTP server binds.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        let ip: IpAddr = self.server.bind_address.parse()?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    /// Loopback bind at `port`, used by tests and the local management gate.
    pub fn loopback(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// Session expiry rule in milliseconds.
    pub fn expiry_rule(&self) -> ExpiryRule {
        ExpiryRule {
            ttl_ms: self.sessions.ttl_s * 1_000,
            idle_ttl_ms: self.sessions.idle_ttl_s * 1_000,
        }
    }

    /// PIN limiter parameters in milliseconds.
    pub fn pin_limits(&self) -> PinLimits {
        PinLimits {
            window_ms: self.pairing.pin_window_s * 1_000,
            max_fails: self.pairing.pin_max_fails,
            block_ms: self.pairing.pin_block_s * 1_000,
            backoff_base_ms: self.pairing.pin_backoff_base_ms,
        }
    }

    /// Pointer conditioning parameters for new input connections.
    pub fn pointer_filter(&self) -> PointerFilter {
        self.input.pointer_filter()
    }

    /// Permission set granted on pairing.
    pub fn default_permission_set(&self) -> PermissionSet {
        self.sessions.default_permissions.iter().copied().collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
