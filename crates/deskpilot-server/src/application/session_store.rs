//! Session store and capability gate.
//!
//! The store owns the table of paired device sessions.  [`SessionStore::validate`]
//! is the single choke point every channel calls before a privileged action:
//! it resolves the token, applies the expiry rule, then checks the required
//! permission, strictly in that order so an expired session never leaks its
//! permission state.
//!
//! Locking is two-level: an `RwLock` guards the map structure and each entry
//! sits behind its own `Mutex`, so activity on one session never blocks
//! another.  All lock holds are short and never span I/O; persistence happens
//! in a background flusher driven by a dirty flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use deskpilot_core::{DeviceSession, ExpiryRule, Permission, PermissionSet, SessionId};

use crate::application::now_ms;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Outcome of a failed capability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GateError {
    /// The token does not resolve to any session.
    #[error("unknown session token")]
    Unauthenticated,
    /// The session existed but its TTL or idle TTL has elapsed.
    #[error("session expired")]
    Expired,
    /// The session is valid but lacks the required permission.
    #[error("permission '{0}' not granted")]
    PermissionDenied(Permission),
}

// ── Persistence seam ──────────────────────────────────────────────────────────

/// Where session snapshots go.  The filesystem implementation lives in
/// `infrastructure::storage`; tests substitute an in-memory recorder.
pub trait SnapshotSink: Send + Sync {
    fn save(&self, sessions: &[DeviceSession]) -> std::io::Result<()>;
    fn load(&self) -> std::io::Result<Vec<DeviceSession>>;
}

// ── Store ─────────────────────────────────────────────────────────────────────

type Entry = Arc<Mutex<DeviceSession>>;

/// Shared table of paired device sessions.
pub struct SessionStore {
    rule: ExpiryRule,
    max_sessions: usize,
    sessions: RwLock<HashMap<SessionId, Entry>>,
    /// Pin counts for sessions that must not be evicted (in-flight transfers).
    pins: Mutex<HashMap<SessionId, u32>>,
    dirty: AtomicBool,
    flush_signal: Notify,
}

impl SessionStore {
    pub fn new(rule: ExpiryRule, max_sessions: usize) -> Self {
        SessionStore {
            rule,
            max_sessions,
            sessions: RwLock::new(HashMap::new()),
            pins: Mutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            flush_signal: Notify::new(),
        }
    }

    /// Restores sessions from a snapshot, dropping any that are already
    /// expired at `now_ms`.
    pub fn restore(&self, snapshot: Vec<DeviceSession>, now_ms: u64) {
        let mut map = self.write_map();
        for session in snapshot {
            if session.is_expired(self.rule, now_ms) {
                debug!(session_id = %session.session_id, "dropping expired session from snapshot");
                continue;
            }
            map.insert(session.session_id, Arc::new(Mutex::new(session)));
        }
        info!(restored = map.len(), "session table restored");
    }

    // ── Gate ──────────────────────────────────────────────────────────────────

    /// Resolves `token`, applies expiry, checks `required`, and refreshes
    /// `last_seen_at` on success.  Expired sessions are removed lazily here.
    pub fn validate(&self, token: SessionId, required: Permission) -> Result<DeviceSession, GateError> {
        self.validate_at(token, required, now_ms())
    }

    pub fn validate_at(
        &self,
        token: SessionId,
        required: Permission,
        now_ms: u64,
    ) -> Result<DeviceSession, GateError> {
        let entry = self
            .read_map()
            .get(&token)
            .cloned()
            .ok_or(GateError::Unauthenticated)?;

        {
            let mut session = lock_entry(&entry);
            if session.is_expired(self.rule, now_ms) {
                drop(session);
                self.remove(token, "expired");
                return Err(GateError::Expired);
            }
            if !session.permissions.contains(required) {
                return Err(GateError::PermissionDenied(required));
            }
            session.touch(now_ms);
            return Ok(session.clone());
        }
    }

    /// Resolves `token` without a permission requirement.  Used by channels
    /// that only need identity (e.g. the stream offer endpoint).
    pub fn resolve_at(&self, token: SessionId, now_ms: u64) -> Result<DeviceSession, GateError> {
        let entry = self
            .read_map()
            .get(&token)
            .cloned()
            .ok_or(GateError::Unauthenticated)?;
        let mut session = lock_entry(&entry);
        if session.is_expired(self.rule, now_ms) {
            drop(session);
            self.remove(token, "expired");
            return Err(GateError::Expired);
        }
        session.touch(now_ms);
        Ok(session.clone())
    }

    pub fn resolve(&self, token: SessionId) -> Result<DeviceSession, GateError> {
        self.resolve_at(token, now_ms())
    }

    // ── Mutations ─────────────────────────────────────────────────────────────

    /// Inserts a freshly paired session, evicting the least-recently-seen
    /// unpinned sessions first when the table is full.
    pub fn insert(&self, session: DeviceSession, now_ms: u64) -> SessionId {
        let id = session.session_id;
        self.evict_for_insert(now_ms);
        self.write_map()
            .insert(id, Arc::new(Mutex::new(session)));
        info!(session_id = %id, "session created");
        self.mark_dirty();
        id
    }

    pub fn touch(&self, token: SessionId, now_ms: u64) {
        if let Some(entry) = self.read_map().get(&token) {
            lock_entry(entry).touch(now_ms);
        }
        // touch alone never triggers a snapshot
    }

    /// Removes a session.  Returns `true` when it existed.
    pub fn revoke(&self, token: SessionId) -> bool {
        self.remove(token, "revoked")
    }

    pub fn set_permissions(&self, token: SessionId, flags: PermissionSet) -> Result<(), GateError> {
        let entry = self
            .read_map()
            .get(&token)
            .cloned()
            .ok_or(GateError::Unauthenticated)?;
        lock_entry(&entry).permissions = flags;
        self.mark_dirty();
        Ok(())
    }

    /// Grants or revokes a single flag.
    pub fn set_permission(
        &self,
        token: SessionId,
        perm: Permission,
        granted: bool,
    ) -> Result<(), GateError> {
        let entry = self
            .read_map()
            .get(&token)
            .cloned()
            .ok_or(GateError::Unauthenticated)?;
        lock_entry(&entry).permissions.set(perm, granted);
        self.mark_dirty();
        Ok(())
    }

    /// All sessions valid at `now_ms`, most recently seen first.
    pub fn list_active_at(&self, now_ms: u64) -> Vec<DeviceSession> {
        let entries: Vec<Entry> = self.read_map().values().cloned().collect();
        let mut out: Vec<DeviceSession> = entries
            .iter()
            .map(|e| lock_entry(e).clone())
            .filter(|s| !s.is_expired(self.rule, now_ms))
            .collect();
        out.sort_by(|a, b| b.last_seen_at_ms.cmp(&a.last_seen_at_ms));
        out
    }

    pub fn list_active(&self) -> Vec<DeviceSession> {
        self.list_active_at(now_ms())
    }

    /// Drops every expired session.  Returns how many were removed.
    pub fn sweep_expired(&self, now_ms: u64) -> usize {
        let expired: Vec<SessionId> = {
            let map = self.read_map();
            map.iter()
                .filter(|(_, e)| lock_entry(e).is_expired(self.rule, now_ms))
                .map(|(id, _)| *id)
                .collect()
        };
        for id in &expired {
            self.remove(*id, "swept");
        }
        expired.len()
    }

    // ── Pinning ───────────────────────────────────────────────────────────────

    /// Protects a session from eviction while a transfer grant is in flight.
    pub fn pin(&self, token: SessionId) {
        *lock_pins(&self.pins).entry(token).or_insert(0) += 1;
    }

    pub fn unpin(&self, token: SessionId) {
        let mut pins = lock_pins(&self.pins);
        if let Some(count) = pins.get_mut(&token) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&token);
            }
        }
    }

    pub(crate) fn is_pinned(&self, token: SessionId) -> bool {
        lock_pins(&self.pins).contains_key(&token)
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    /// Current table contents for a snapshot, expiry included so the flusher
    /// does not persist dead records.
    pub fn snapshot(&self) -> Vec<DeviceSession> {
        self.list_active()
    }

    /// Waits until a structural change has been flagged.
    pub async fn flush_wanted(&self) {
        self.flush_signal.notified().await;
    }

    /// Takes the dirty flag.  Returns `true` when a snapshot is due.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        self.flush_signal.notify_one();
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn remove(&self, token: SessionId, why: &str) -> bool {
        let removed = self.write_map().remove(&token).is_some();
        if removed {
            debug!(session_id = %token, why, "session removed");
            self.mark_dirty();
        }
        removed
    }

    /// Evicts just enough of the least-recently-seen unpinned sessions to
    /// make room for one insert.  Pinned targets are skipped to the next
    /// oldest.
    fn evict_for_insert(&self, now_ms: u64) {
        if self.max_sessions == 0 {
            return;
        }
        // Sweeping first may already free the slot.
        self.sweep_expired(now_ms);

        loop {
            let len = self.read_map().len();
            if len < self.max_sessions {
                return;
            }
            let victim = {
                let map = self.read_map();
                let mut candidates: Vec<(SessionId, u64)> = map
                    .iter()
                    .filter(|(id, _)| !self.is_pinned(**id))
                    .map(|(id, e)| (*id, lock_entry(e).last_seen_at_ms))
                    .collect();
                candidates.sort_by_key(|(_, seen)| *seen);
                candidates.first().map(|(id, _)| *id)
            };
            match victim {
                Some(id) => {
                    warn!(session_id = %id, "evicting least-recently-seen session");
                    self.remove(id, "evicted");
                }
                // Everything is pinned; insert above the cap rather than
                // break an in-flight transfer.
                None => return,
            }
        }
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SessionId, Entry>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_map(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SessionId, Entry>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn lock_entry(entry: &Entry) -> std::sync::MutexGuard<'_, DeviceSession> {
    entry.lock().unwrap_or_else(|e| e.into_inner())
}

fn lock_pins(
    pins: &Mutex<HashMap<SessionId, u32>>,
) -> std::sync::MutexGuard<'_, HashMap<SessionId, u32>> {
    pins.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Background tasks ──────────────────────────────────────────────────────────

/// Debounced snapshot flusher.  Waits for a structural change, sleeps the
/// debounce window so bursts coalesce into one write, then persists.
pub async fn run_snapshot_flusher(
    store: Arc<SessionStore>,
    sink: Arc<dyn SnapshotSink>,
    debounce: Duration,
) {
    loop {
        store.flush_wanted().await;
        tokio::time::sleep(debounce).await;
        if store.take_dirty() {
            let sessions = store.snapshot();
            if let Err(e) = sink.save(&sessions) {
                warn!(error = %e, "session snapshot write failed");
            } else {
                debug!(count = sessions.len(), "session snapshot written");
            }
        }
    }
}

/// Periodic expiry sweep so idle tables shrink even without traffic.
pub async fn run_expiry_sweeper(store: Arc<SessionStore>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let removed = store.sweep_expired(now_ms());
        if removed > 0 {
            info!(removed, "expiry sweep removed sessions");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use deskpilot_core::PermissionSet;

    fn store(ttl_ms: u64, idle_ttl_ms: u64, max: usize) -> SessionStore {
        SessionStore::new(ExpiryRule { ttl_ms, idle_ttl_ms }, max)
    }

    fn session_at(label: &str, now_ms: u64) -> DeviceSession {
        DeviceSession::new(label, label, None, PermissionSet::all(), now_ms)
    }

    #[test]
    fn test_validate_unknown_token_is_unauthenticated() {
        let store = store(0, 0, 8);
        let err = store
            .validate_at(uuid::Uuid::new_v4(), Permission::Mouse, 0)
            .unwrap_err();
        assert_eq!(err, GateError::Unauthenticated);
    }

    #[test]
    fn test_validate_checks_expiry_before_permission() {
        // Arrange: a session with no permissions at all, past its TTL.
        let store = store(1_000, 0, 8);
        let session = DeviceSession::new("d", "D", None, PermissionSet::none(), 0);
        let id = store.insert(session, 0);

        // Act: both expiry and permission would fail; expiry must win.
        let err = store.validate_at(id, Permission::Mouse, 5_000).unwrap_err();

        // Assert
        assert_eq!(err, GateError::Expired);
    }

    #[test]
    fn test_validate_denies_missing_permission_without_mutating() {
        let store = store(0, 0, 8);
        let session = DeviceSession::new("d", "D", None, PermissionSet::none(), 0);
        let id = store.insert(session, 0);

        // Repeated denied attempts never grant access as a side effect.
        for _ in 0..3 {
            let err = store.validate_at(id, Permission::Keyboard, 10).unwrap_err();
            assert_eq!(err, GateError::PermissionDenied(Permission::Keyboard));
        }
        assert!(store.resolve_at(id, 10).is_ok());
    }

    #[test]
    fn test_validate_success_refreshes_last_seen() {
        let store = store(0, 10_000, 8);
        let id = store.insert(session_at("d", 0), 0);

        store.validate_at(id, Permission::Mouse, 9_000).unwrap();

        // Without the touch at t=9s this would be idle-expired by t=15s.
        assert!(store.validate_at(id, Permission::Mouse, 15_000).is_ok());
    }

    #[test]
    fn test_expired_session_is_removed_lazily() {
        let store = store(1_000, 0, 8);
        let id = store.insert(session_at("d", 0), 0);

        assert_eq!(
            store.validate_at(id, Permission::Mouse, 2_000).unwrap_err(),
            GateError::Expired
        );
        // Second call sees no session at all.
        assert_eq!(
            store.validate_at(id, Permission::Mouse, 2_000).unwrap_err(),
            GateError::Unauthenticated
        );
    }

    #[test]
    fn test_eviction_removes_least_recently_seen_first() {
        let store = store(0, 0, 2);
        let a = store.insert(session_at("a", 0), 0);
        let b = store.insert(session_at("b", 0), 0);
        store.touch(a, 100); // a is now fresher than b

        let c = store.insert(session_at("c", 200), 200);

        assert!(store.resolve_at(a, 300).is_ok());
        assert!(store.resolve_at(c, 300).is_ok());
        assert_eq!(
            store.resolve_at(b, 300).unwrap_err(),
            GateError::Unauthenticated
        );
    }

    #[test]
    fn test_eviction_skips_pinned_sessions() {
        let store = store(0, 0, 2);
        let a = store.insert(session_at("a", 0), 0);
        let b = store.insert(session_at("b", 10), 10);
        store.pin(a); // oldest, but mid-transfer

        store.insert(session_at("c", 20), 20);

        assert!(store.resolve_at(a, 30).is_ok(), "pinned session must survive");
        assert_eq!(
            store.resolve_at(b, 30).unwrap_err(),
            GateError::Unauthenticated
        );
    }

    #[test]
    fn test_eviction_removes_only_the_minimum_needed() {
        let store = store(0, 0, 3);
        store.insert(session_at("a", 0), 0);
        store.insert(session_at("b", 1), 1);
        store.insert(session_at("c", 2), 2);

        store.insert(session_at("d", 3), 3);

        assert_eq!(store.list_active_at(4).len(), 3);
    }

    #[test]
    fn test_revoke_is_immediate() {
        let store = store(0, 0, 8);
        let id = store.insert(session_at("d", 0), 0);

        assert!(store.revoke(id));
        assert_eq!(
            store.validate_at(id, Permission::Mouse, 1).unwrap_err(),
            GateError::Unauthenticated
        );
        assert!(!store.revoke(id), "second revoke finds nothing");
    }

    #[test]
    fn test_set_permission_toggles_single_flag() {
        let store = store(0, 0, 8);
        let session = DeviceSession::new("d", "D", None, PermissionSet::none(), 0);
        let id = store.insert(session, 0);

        store.set_permission(id, Permission::Power, true).unwrap();
        assert!(store.validate_at(id, Permission::Power, 1).is_ok());

        store.set_permission(id, Permission::Power, false).unwrap();
        assert_eq!(
            store.validate_at(id, Permission::Power, 2).unwrap_err(),
            GateError::PermissionDenied(Permission::Power)
        );
    }

    #[test]
    fn test_sweep_removes_all_expired_sessions() {
        let store = store(0, 1_000, 8);
        store.insert(session_at("a", 0), 0);
        store.insert(session_at("b", 0), 0);
        let fresh = store.insert(session_at("c", 500), 500);

        let removed = store.sweep_expired(1_200);

        assert_eq!(removed, 2);
        assert!(store.resolve_at(fresh, 1_200).is_ok());
    }

    #[test]
    fn test_restore_drops_already_expired_records() {
        let store = store(1_000, 0, 8);
        let live = session_at("live", 9_500);
        let live_id = live.session_id;
        let dead = session_at("dead", 0);
        let dead_id = dead.session_id;

        store.restore(vec![live, dead], 10_000);

        assert!(store.resolve_at(live_id, 10_000).is_ok());
        assert_eq!(
            store.resolve_at(dead_id, 10_000).unwrap_err(),
            GateError::Unauthenticated
        );
    }

    #[test]
    fn test_structural_change_sets_dirty_flag_but_touch_does_not() {
        let store = store(0, 0, 8);
        assert!(!store.take_dirty());

        let id = store.insert(session_at("d", 0), 0);
        assert!(store.take_dirty());

        store.touch(id, 100);
        assert!(!store.take_dirty(), "touch must not force a snapshot");
    }
}
