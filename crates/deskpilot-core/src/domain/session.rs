//! The device-session record and its expiry rules.
//!
//! A [`DeviceSession`] is created by a successful pairing and identifies one
//! remote device plus the capabilities it has been granted.  Validity is a
//! pure function of the record and the current time:
//!
//! ```text
//! valid  ⇔  now < created_at + ttl  AND  now < last_seen_at + idle_ttl
//! ```
//!
//! A TTL of zero means "unlimited" for that bound, matching the persisted
//! configuration format.  All timestamps are milliseconds since the Unix
//! epoch so records serialize portably and tests can fabricate any clock.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::permissions::PermissionSet;

/// Opaque session identifier; doubles as the bearer token on the wire.
pub type SessionId = Uuid;

/// Absolute and idle expiry bounds, in milliseconds.  Zero disables a bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryRule {
    pub ttl_ms: u64,
    pub idle_ttl_ms: u64,
}

impl ExpiryRule {
    /// A rule with both bounds disabled (sessions never expire).
    pub fn unlimited() -> Self {
        ExpiryRule {
            ttl_ms: 0,
            idle_ttl_ms: 0,
        }
    }
}

/// One paired device as tracked by the session store and persisted on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSession {
    /// Unique session token issued at pairing time.
    pub session_id: SessionId,
    /// Stable identifier reported by the device (survives re-pairing).
    pub device_id: String,
    /// Human-readable device name shown in the management UI.
    pub device_label: String,
    /// Network address observed at pairing time; refreshed on re-pair.
    #[serde(default)]
    pub remote_addr: Option<std::net::IpAddr>,
    /// Capabilities granted to this device.  Default-deny.
    #[serde(default)]
    pub permissions: PermissionSet,
    /// Milliseconds since Unix epoch at creation.
    pub created_at_ms: u64,
    /// Milliseconds since Unix epoch at the last accepted request.
    pub last_seen_at_ms: u64,
}

impl DeviceSession {
    /// Creates a fresh session at `now_ms` with the given permissions.
    pub fn new(
        device_id: impl Into<String>,
        device_label: impl Into<String>,
        remote_addr: Option<std::net::IpAddr>,
        permissions: PermissionSet,
        now_ms: u64,
    ) -> Self {
        DeviceSession {
            session_id: Uuid::new_v4(),
            device_id: device_id.into(),
            device_label: device_label.into(),
            remote_addr,
            permissions,
            created_at_ms: now_ms,
            last_seen_at_ms: now_ms,
        }
    }

    /// Records activity at `now_ms`.  Clocks can step backwards across
    /// suspend/resume; never move `last_seen_at` into the past.
    pub fn touch(&mut self, now_ms: u64) {
        if now_ms > self.last_seen_at_ms {
            self.last_seen_at_ms = now_ms;
        }
    }

    /// Returns `true` when either expiry bound has been reached at `now_ms`.
    pub fn is_expired(&self, rule: ExpiryRule, now_ms: u64) -> bool {
        if rule.ttl_ms > 0 && now_ms >= self.created_at_ms.saturating_add(rule.ttl_ms) {
            return true;
        }
        if rule.idle_ttl_ms > 0 && now_ms >= self.last_seen_at_ms.saturating_add(rule.idle_ttl_ms) {
            return true;
        }
        false
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
