//! Pairing gateway.
//!
//! Two paths issue sessions: a short numeric code typed from the device (rate
//! limited per source address) and a one-time QR token scanned from the host
//! screen.  Both converge on the same session creation with the configured
//! default permission set.
//!
//! Rejection reasons are exact internally so the operator log can tell a bad
//! code from an expired window, but the wire response collapses everything
//! except rate limiting into a uniform denial so failed guesses learn
//! nothing.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};

use deskpilot_core::domain::pairing::{PinCheck, PinLimiter, PinLimits, QrTokenStore};
use deskpilot_core::{DeviceSession, PermissionSet, SessionId};

use crate::application::now_ms;
use crate::application::session_store::SessionStore;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a pairing attempt was refused.  Only [`PairRejection::RateLimited`]
/// is distinguishable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PairRejection {
    #[error("rate limited, retry in {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("pairing code mismatch")]
    BadPin,
    #[error("pairing window expired")]
    ExpiredWindow,
    #[error("token already consumed or unknown")]
    AlreadyConsumed,
}

// ── Gateway ───────────────────────────────────────────────────────────────────

struct PairingCode {
    code: String,
    issued_at_ms: u64,
}

/// Issues sessions for PIN and QR pairing attempts.
pub struct PairingGateway {
    store: Arc<SessionStore>,
    limits: PinLimits,
    /// Validity of the current pairing code, in milliseconds.
    window_ms: u64,
    default_permissions: PermissionSet,
    code: Mutex<PairingCode>,
    limiter: Mutex<PinLimiter>,
    qr_tokens: Mutex<QrTokenStore>,
}

impl PairingGateway {
    pub fn new(
        store: Arc<SessionStore>,
        limits: PinLimits,
        window_ms: u64,
        qr_token_ttl_ms: u64,
        default_permissions: PermissionSet,
    ) -> Self {
        PairingGateway {
            store,
            limits,
            window_ms,
            default_permissions,
            code: Mutex::new(PairingCode {
                code: generate_code(),
                issued_at_ms: now_ms(),
            }),
            limiter: Mutex::new(PinLimiter::new()),
            qr_tokens: Mutex::new(QrTokenStore::new(qr_token_ttl_ms)),
        }
    }

    /// The code currently shown on the host, plus its expiry instant.
    pub fn current_code_at(&self, _now_ms: u64) -> (String, u64) {
        let code = lock(&self.code);
        (code.code.clone(), code.issued_at_ms + self.window_ms)
    }

    /// Replaces the pairing code and restarts its validity window.
    pub fn rotate_code_at(&self, now_ms: u64) -> String {
        let fresh = generate_code();
        let mut code = lock(&self.code);
        code.code = fresh.clone();
        code.issued_at_ms = now_ms;
        info!("pairing code rotated");
        fresh
    }

    pub fn rotate_code(&self) -> String {
        self.rotate_code_at(now_ms())
    }

    /// Issues a one-time QR token for the local QR payload endpoint.
    pub fn issue_qr_token_at(&self, now_ms: u64) -> String {
        lock(&self.qr_tokens).issue(now_ms)
    }

    // ── PIN path ──────────────────────────────────────────────────────────────

    /// Consumes a typed pairing code.  Checks the rate limiter, then the
    /// code's validity window, then the code itself; only a wrong code counts
    /// as a limiter failure.
    pub fn pair_with_pin_at(
        &self,
        addr: IpAddr,
        pin: &str,
        device_id: &str,
        device_label: &str,
        now_ms: u64,
    ) -> Result<DeviceSession, PairRejection> {
        match lock(&self.limiter).check(addr, self.limits, now_ms) {
            PinCheck::Allowed => {}
            PinCheck::Blocked { retry_after_ms } => {
                warn!(%addr, retry_after_ms, "pairing attempt rate limited");
                return Err(PairRejection::RateLimited { retry_after_ms });
            }
        }

        let matches_window;
        let matches_code;
        {
            let code = lock(&self.code);
            matches_window = now_ms < code.issued_at_ms.saturating_add(self.window_ms);
            matches_code = constant_shape_eq(pin.trim(), &code.code);
        }

        if !matches_window {
            warn!(%addr, "pairing attempt outside code validity window");
            return Err(PairRejection::ExpiredWindow);
        }
        if !matches_code {
            lock(&self.limiter).record_failure(addr, self.limits, now_ms);
            warn!(%addr, "pairing attempt with wrong code");
            return Err(PairRejection::BadPin);
        }

        lock(&self.limiter).record_success(addr);
        Ok(self.create_session(device_id, device_label, Some(addr), now_ms))
    }

    // ── QR path ───────────────────────────────────────────────────────────────

    /// Consumes a one-time QR token.  Exactly one concurrent caller wins; the
    /// rest see [`PairRejection::AlreadyConsumed`].
    pub fn pair_with_qr_at(
        &self,
        addr: Option<IpAddr>,
        token: &str,
        device_id: &str,
        device_label: &str,
        now_ms: u64,
    ) -> Result<DeviceSession, PairRejection> {
        let consumed = lock(&self.qr_tokens).consume(token, now_ms);
        if !consumed {
            warn!("qr login with expired or already-consumed token");
            return Err(PairRejection::AlreadyConsumed);
        }
        Ok(self.create_session(device_id, device_label, addr, now_ms))
    }

    fn create_session(
        &self,
        device_id: &str,
        device_label: &str,
        addr: Option<IpAddr>,
        now_ms: u64,
    ) -> DeviceSession {
        let session = DeviceSession::new(
            device_id,
            device_label,
            addr,
            self.default_permissions,
            now_ms,
        );
        let snapshot = session.clone();
        let id: SessionId = self.store.insert(session, now_ms);
        info!(session_id = %id, device_label, "device paired");
        snapshot
    }
}

/// 6-digit numeric pairing code, zero padded.
fn generate_code() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{n:06}")
}

/// Compares the full length of both strings before deciding, so a mismatch in
/// the first digit costs the same as one in the last.
fn constant_shape_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
