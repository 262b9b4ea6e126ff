//! Per-device capability flags.
//!
//! Every privileged action a paired device can perform is gated by one of the
//! named flags below.  A flag that was never granted is denied; there is no
//! implicit "all" permission, and unknown flag names deserialize as errors
//! rather than silently granting anything.

use serde::{Deserialize, Serialize};

/// A single grantable capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Pointer movement, clicks, drags, scrolling.
    Mouse,
    /// Key events, text insertion, hotkeys, media keys.
    Keyboard,
    /// Receiving the live screen stream.
    Stream,
    /// Uploading files to the host.
    Upload,
    /// Receiving files pushed from the host (transfer grants).
    FileSend,
    /// Power/session actions (lock, sleep, shutdown, volume).
    Power,
}

impl Permission {
    /// All permissions, in a stable order (used for serialization and UI lists).
    pub const ALL: [Permission; 6] = [
        Permission::Mouse,
        Permission::Keyboard,
        Permission::Stream,
        Permission::Upload,
        Permission::FileSend,
        Permission::Power,
    ];

    /// The flag name as it appears on the wire and in the session file.
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Mouse => "mouse",
            Permission::Keyboard => "keyboard",
            Permission::Stream => "stream",
            Permission::Upload => "upload",
            Permission::FileSend => "file_send",
            Permission::Power => "power",
        }
    }

    fn bit(self) -> u8 {
        match self {
            Permission::Mouse => 1 << 0,
            Permission::Keyboard => 1 << 1,
            Permission::Stream => 1 << 2,
            Permission::Upload => 1 << 3,
            Permission::FileSend => 1 << 4,
            Permission::Power => 1 << 5,
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of granted [`Permission`] flags.
///
/// Stored as a bitmask in memory but serialized as a list of flag names so
/// the persisted session file stays hand-editable:
///
/// ```json
/// "permissions": ["mouse", "keyboard", "stream"]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Permission>", into = "Vec<Permission>")]
pub struct PermissionSet(u8);

impl PermissionSet {
    /// The empty set, where every check denies.
    pub fn none() -> Self {
        PermissionSet(0)
    }

    /// Every flag granted.  Used only by tests and the local management
    /// channel; pairing never starts a session with this.
    pub fn all() -> Self {
        Permission::ALL.iter().copied().collect()
    }

    /// Returns `true` if `perm` has been granted.
    pub fn contains(&self, perm: Permission) -> bool {
        self.0 & perm.bit() != 0
    }

    /// Grants a flag.  Granting an already-granted flag is a no-op.
    pub fn grant(&mut self, perm: Permission) {
        self.0 |= perm.bit();
    }

    /// Revokes a flag.  Revoking an absent flag is a no-op.
    pub fn revoke(&mut self, perm: Permission) {
        self.0 &= !perm.bit();
    }

    /// Sets a flag to an explicit value.
    pub fn set(&mut self, perm: Permission, granted: bool) {
        if granted {
            self.grant(perm);
        } else {
            self.revoke(perm);
        }
    }

    /// Returns `true` if no flag is granted.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// The granted flags in stable order.
    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        Permission::ALL.iter().copied().filter(|p| self.contains(*p))
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        let mut set = PermissionSet::none();
        for p in iter {
            set.grant(p);
        }
        set
    }
}

impl From<Vec<Permission>> for PermissionSet {
    fn from(perms: Vec<Permission>) -> Self {
        perms.into_iter().collect()
    }
}

impl From<PermissionSet> for Vec<Permission> {
    fn from(set: PermissionSet) -> Self {
        set.iter().collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_set_denies_every_flag() {
        let set = PermissionSet::none();
        for perm in Permission::ALL {
            assert!(!set.contains(perm), "{perm:?} must be denied by default");
        }
    }

    #[test]
    fn test_grant_is_specific_to_one_flag() {
        let mut set = PermissionSet::none();
        set.grant(Permission::Stream);
        assert!(set.contains(Permission::Stream));
        assert!(!set.contains(Permission::Keyboard));
        assert!(!set.contains(Permission::Power));
    }

    #[test]
    fn test_revoke_removes_only_the_named_flag() {
        let mut set = PermissionSet::all();
        set.revoke(Permission::Power);
        assert!(!set.contains(Permission::Power));
        assert!(set.contains(Permission::Mouse));
        assert!(set.contains(Permission::FileSend));
    }

    #[test]
    fn test_grant_and_revoke_are_idempotent() {
        let mut set = PermissionSet::none();
        set.grant(Permission::Mouse);
        set.grant(Permission::Mouse);
        assert!(set.contains(Permission::Mouse));
        set.revoke(Permission::Mouse);
        set.revoke(Permission::Mouse);
        assert!(!set.contains(Permission::Mouse));
    }

    #[test]
    fn test_serializes_as_list_of_names() {
        let set: PermissionSet = [Permission::Mouse, Permission::FileSend]
            .into_iter()
            .collect();
        let json = serde_json::to_string(&set).expect("serialize");
        assert_eq!(json, r#"["mouse","file_send"]"#);
    }

    #[test]
    fn test_deserializes_from_list_of_names() {
        let set: PermissionSet =
            serde_json::from_str(r#"["keyboard","power"]"#).expect("deserialize");
        assert!(set.contains(Permission::Keyboard));
        assert!(set.contains(Permission::Power));
        assert!(!set.contains(Permission::Mouse));
    }

    #[test]
    fn test_unknown_flag_name_is_rejected() {
        let result: Result<PermissionSet, _> = serde_json::from_str(r#"["root"]"#);
        assert!(result.is_err(), "unknown flags must not silently grant");
    }

    #[test]
    fn test_round_trip_preserves_flags() {
        let set = PermissionSet::all();
        let json = serde_json::to_string(&set).unwrap();
        let restored: PermissionSet = serde_json::from_str(&json).unwrap();
        assert_eq!(set, restored);
    }
}
