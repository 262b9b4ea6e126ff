//! Application layer: the services implementing the control-plane rules.
//!
//! Each service is constructed once at startup and shared behind `Arc` by the
//! infrastructure handlers.  Time-dependent rules take `now_ms` parameters
//! internally; the `*_at` variants are exposed so tests can pin the clock.

pub mod pairing;
pub mod session_store;
pub mod streaming;
pub mod transfer;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch on the wall clock.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
