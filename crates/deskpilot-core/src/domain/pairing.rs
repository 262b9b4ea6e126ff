//! Pairing rate-limit and one-time-token state machines.
//!
//! Two pure pieces used by the pairing gateway:
//!
//! - [`PinLimiter`]: per-source-address failure tracking for PIN attempts:
//!   a sliding window of failures, an exponential backoff between attempts
//!   once failures accumulate, and a hard lockout after the configured
//!   threshold.
//! - [`QrTokenStore`]: one-time tokens embedded in QR payloads.  Consuming
//!   a token removes it atomically, so two racing consumers see exactly one
//!   success.  The store is TTL-bounded and size-bounded.
//!
//! Both take `now_ms` as a parameter; the caller owns the clock.

use std::collections::HashMap;
use std::net::IpAddr;

use uuid::Uuid;

// ── PIN limiter ───────────────────────────────────────────────────────────────

/// Limits checked before every PIN attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinLimits {
    /// Sliding window over which failures are counted.
    pub window_ms: u64,
    /// Failures within the window that trigger the hard lockout.
    pub max_fails: u32,
    /// Hard lockout duration once `max_fails` is reached.
    pub block_ms: u64,
    /// Base delay for the exponential backoff; doubles per failure after the
    /// second one, capped at `block_ms`.
    pub backoff_base_ms: u64,
}

impl Default for PinLimits {
    fn default() -> Self {
        PinLimits {
            window_ms: 60_000,
            max_fails: 8,
            block_ms: 300_000,
            backoff_base_ms: 1_000,
        }
    }
}

/// Outcome of [`PinLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinCheck {
    Allowed,
    /// Caller must wait; `retry_after_ms` is safe to surface to the client.
    Blocked { retry_after_ms: u64 },
}

#[derive(Debug, Clone)]
struct PinState {
    window_start_ms: u64,
    fails: u32,
    /// Next attempt is allowed at this time (backoff or lockout).
    blocked_until_ms: u64,
}

/// Per-source-address PIN attempt limiter.
#[derive(Debug, Default)]
pub struct PinLimiter {
    by_addr: HashMap<IpAddr, PinState>,
}

impl PinLimiter {
    pub fn new() -> Self {
        PinLimiter::default()
    }

    /// Returns whether an attempt from `addr` may proceed at `now_ms`.
    pub fn check(&mut self, addr: IpAddr, limits: PinLimits, now_ms: u64) -> PinCheck {
        let state = self.state(addr, now_ms);
        if now_ms < state.blocked_until_ms {
            return PinCheck::Blocked {
                retry_after_ms: state.blocked_until_ms - now_ms,
            };
        }
        Self::roll_window(state, limits, now_ms);
        PinCheck::Allowed
    }

    /// Records a failed attempt and computes the next allowed time.
    pub fn record_failure(&mut self, addr: IpAddr, limits: PinLimits, now_ms: u64) {
        let state = self.state(addr, now_ms);
        Self::roll_window(state, limits, now_ms);
        state.fails += 1;

        if state.fails >= limits.max_fails {
            state.blocked_until_ms = now_ms.saturating_add(limits.block_ms);
            return;
        }
        if state.fails >= 2 {
            // Exponential backoff: base * 2^(fails-2), capped at the lockout.
            let shift = (state.fails - 2).min(31);
            let delay = limits
                .backoff_base_ms
                .saturating_mul(1u64 << shift)
                .min(limits.block_ms);
            state.blocked_until_ms = now_ms.saturating_add(delay);
        }
    }

    /// Clears all state for `addr` after a successful pairing.
    pub fn record_success(&mut self, addr: IpAddr) {
        self.by_addr.remove(&addr);
    }

    fn state(&mut self, addr: IpAddr, now_ms: u64) -> &mut PinState {
        self.by_addr.entry(addr).or_insert(PinState {
            window_start_ms: now_ms,
            fails: 0,
            blocked_until_ms: 0,
        })
    }

    fn roll_window(state: &mut PinState, limits: PinLimits, now_ms: u64) {
        if now_ms.saturating_sub(state.window_start_ms) > limits.window_ms {
            state.window_start_ms = now_ms;
            state.fails = 0;
            state.blocked_until_ms = 0;
        }
    }
}

// ── QR token store ────────────────────────────────────────────────────────────

/// Upper bound on outstanding tokens; oldest are dropped beyond this.
const MAX_OUTSTANDING_TOKENS: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct QrToken {
    created_ms: u64,
    expires_ms: u64,
}

/// One-time tokens for QR pairing.  Issue on the management channel, consume
/// exactly once on the public pairing endpoint.
#[derive(Debug)]
pub struct QrTokenStore {
    ttl_ms: u64,
    tokens: HashMap<String, QrToken>,
}

impl QrTokenStore {
    /// `ttl_ms` bounds how long an issued token stays consumable.
    pub fn new(ttl_ms: u64) -> Self {
        QrTokenStore {
            ttl_ms,
            tokens: HashMap::new(),
        }
    }

    /// Issues a fresh single-use token valid until `now_ms + ttl`.
    pub fn issue(&mut self, now_ms: u64) -> String {
        self.cleanup(now_ms);
        let token = Uuid::new_v4().simple().to_string();
        self.tokens.insert(
            token.clone(),
            QrToken {
                created_ms: now_ms,
                expires_ms: now_ms.saturating_add(self.ttl_ms),
            },
        );
        token
    }

    /// Consumes `token`, returning `true` exactly once per issued token and
    /// only while it is still within its validity window.
    pub fn consume(&mut self, token: &str, now_ms: u64) -> bool {
        self.cleanup(now_ms);
        let token = token.trim();
        if token.is_empty() {
            return false;
        }
        match self.tokens.remove(token) {
            Some(entry) => now_ms < entry.expires_ms,
            None => false,
        }
    }

    /// Number of currently outstanding (unconsumed, unexpired) tokens.
    pub fn outstanding(&self) -> usize {
        self.tokens.len()
    }

    fn cleanup(&mut self, now_ms: u64) {
        self.tokens.retain(|_, t| now_ms < t.expires_ms);
        if self.tokens.len() <= MAX_OUTSTANDING_TOKENS {
            return;
        }
        let mut by_age: Vec<(String, u64)> = self
            .tokens
            .iter()
            .map(|(k, v)| (k.clone(), v.created_ms))
            .collect();
        by_age.sort_by_key(|(_, created)| *created);
        let excess = self.tokens.len() - MAX_OUTSTANDING_TOKENS;
        for (key, _) in by_age.into_iter().take(excess) {
            self.tokens.remove(&key);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> IpAddr {
        "192.168.1.50".parse().unwrap()
    }

    // ── PinLimiter ────────────────────────────────────────────────────────────

    #[test]
    fn test_first_attempt_is_allowed() {
        let mut limiter = PinLimiter::new();
        assert_eq!(
            limiter.check(addr(), PinLimits::default(), 0),
            PinCheck::Allowed
        );
    }

    #[test]
    fn test_single_failure_does_not_block() {
        let mut limiter = PinLimiter::new();
        let limits = PinLimits::default();
        limiter.record_failure(addr(), limits, 0);
        assert_eq!(limiter.check(addr(), limits, 1), PinCheck::Allowed);
    }

    #[test]
    fn test_backoff_grows_exponentially_after_second_failure() {
        let mut limiter = PinLimiter::new();
        let limits = PinLimits {
            backoff_base_ms: 1_000,
            ..PinLimits::default()
        };
        limiter.record_failure(addr(), limits, 0);
        limiter.record_failure(addr(), limits, 10); // 2nd fail → 1s backoff
        assert!(matches!(
            limiter.check(addr(), limits, 11),
            PinCheck::Blocked { retry_after_ms } if retry_after_ms <= 1_000
        ));
        limiter.record_failure(addr(), limits, 1_100); // 3rd fail → 2s backoff
        match limiter.check(addr(), limits, 1_101) {
            PinCheck::Blocked { retry_after_ms } => {
                assert!(retry_after_ms > 1_000 && retry_after_ms <= 2_000)
            }
            PinCheck::Allowed => panic!("expected backoff after third failure"),
        }
    }

    #[test]
    fn test_hard_lockout_after_max_fails() {
        let mut limiter = PinLimiter::new();
        let limits = PinLimits {
            max_fails: 3,
            block_ms: 300_000,
            ..PinLimits::default()
        };
        for i in 0..3 {
            limiter.record_failure(addr(), limits, i);
        }
        match limiter.check(addr(), limits, 10) {
            PinCheck::Blocked { retry_after_ms } => assert!(retry_after_ms > 200_000),
            PinCheck::Allowed => panic!("expected lockout"),
        }
    }

    #[test]
    fn test_window_expiry_resets_failure_count() {
        let mut limiter = PinLimiter::new();
        let limits = PinLimits {
            window_ms: 60_000,
            max_fails: 3,
            ..PinLimits::default()
        };
        limiter.record_failure(addr(), limits, 0);
        limiter.record_failure(addr(), limits, 1);
        // Past the window: state rolls over, attempt allowed again.
        assert_eq!(limiter.check(addr(), limits, 61_002), PinCheck::Allowed);
        limiter.record_failure(addr(), limits, 61_002);
        assert_eq!(limiter.check(addr(), limits, 61_003), PinCheck::Allowed);
    }

    #[test]
    fn test_success_clears_state_for_that_address_only() {
        let mut limiter = PinLimiter::new();
        let limits = PinLimits {
            max_fails: 2,
            ..PinLimits::default()
        };
        let other: IpAddr = "192.168.1.51".parse().unwrap();
        limiter.record_failure(addr(), limits, 0);
        limiter.record_failure(other, limits, 0);
        limiter.record_failure(other, limits, 1);
        limiter.record_success(addr());
        assert_eq!(limiter.check(addr(), limits, 2), PinCheck::Allowed);
        assert!(matches!(
            limiter.check(other, limits, 2),
            PinCheck::Blocked { .. }
        ));
    }

    // ── QrTokenStore ──────────────────────────────────────────────────────────

    #[test]
    fn test_issued_token_consumes_exactly_once() {
        let mut store = QrTokenStore::new(120_000);
        let token = store.issue(0);
        assert!(store.consume(&token, 1_000));
        assert!(!store.consume(&token, 1_001), "second consume must fail");
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let mut store = QrTokenStore::new(120_000);
        let token = store.issue(0);
        assert!(!store.consume(&token, 120_000));
    }

    #[test]
    fn test_unknown_and_empty_tokens_are_rejected() {
        let mut store = QrTokenStore::new(120_000);
        assert!(!store.consume("nope", 0));
        assert!(!store.consume("", 0));
        assert!(!store.consume("   ", 0));
    }

    #[test]
    fn test_cleanup_drops_expired_tokens() {
        let mut store = QrTokenStore::new(1_000);
        store.issue(0);
        store.issue(0);
        let fresh = store.issue(5_000);
        assert!(store.consume(&fresh, 5_500));
        assert_eq!(store.outstanding(), 0);
    }
}
