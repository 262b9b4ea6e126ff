//! Transfer broker.
//!
//! Host-to-device delivery works through grants: an unguessable URL token
//! bound to one file, one issuing session, a short expiry, an optional source
//! address pin, and a consume budget (single-use by default).  Consumption is
//! decided under the grant-table lock, so two racing downloads of a
//! single-use grant see exactly one winner.
//!
//! Device-to-host uploads are validated (size cap, extension allow-list,
//! optional declared checksum) and land via write-temp-then-rename so a crash
//! mid-upload never leaves a half-written file under the final name.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use deskpilot_core::{Permission, SessionId};

use crate::application::now_ms;
use crate::application::session_store::{GateError, SessionStore};
use crate::domain::config::TransferSection;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransferError {
    /// Unknown, expired, or fully consumed token.  Deliberately the same
    /// wire shape for all three.
    #[error("transfer not found")]
    NotFound,
    #[error("transfer grant expired")]
    Expired,
    /// Strict IP pinning rejected the caller's address.
    #[error("address not allowed for this transfer")]
    AddressMismatch,
    #[error("requested range is not satisfiable")]
    RangeNotSatisfiable,
    #[error("upload exceeds the {max_bytes} byte limit")]
    TooLarge { max_bytes: u64 },
    #[error("file extension '{0}' is not allowed")]
    ExtensionNotAllowed(String),
    #[error("declared checksum does not match the received bytes")]
    ChecksumMismatch,
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error("transfer i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

// ── Grants ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct TransferGrant {
    file_path: PathBuf,
    filename: String,
    issuing_session_id: SessionId,
    allowed_remote_addr: Option<IpAddr>,
    expires_at_ms: u64,
    content_sha256: String,
    size: u64,
    consumes_remaining: u32,
}

/// Everything a client needs to fetch a granted file, pushed over the input
/// WebSocket as a `file_transfer` frame.
#[derive(Debug, Clone)]
pub struct GrantInfo {
    pub url_token: String,
    pub url: String,
    pub filename: String,
    pub size: u64,
    pub sha256: String,
    pub expires_at_ms: u64,
}

/// A granted download resolved for one consume: the file plus the byte
/// window to serve.
#[derive(Debug, Clone)]
pub struct ConsumedFile {
    pub file_path: PathBuf,
    pub filename: String,
    pub total_size: u64,
    pub sha256: String,
    /// Byte window to serve; covers the whole file for a full retrieval.
    pub offset: u64,
    pub length: u64,
    pub is_partial: bool,
}

/// A stored upload after validation and the atomic rename.
#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub path: PathBuf,
    pub filename: String,
    pub size: u64,
    pub sha256: String,
}

// ── Broker ────────────────────────────────────────────────────────────────────

pub struct TransferBroker {
    store: Arc<SessionStore>,
    cfg: TransferSection,
    grants: Mutex<HashMap<String, TransferGrant>>,
}

impl TransferBroker {
    pub fn new(store: Arc<SessionStore>, cfg: TransferSection) -> Self {
        TransferBroker {
            store,
            cfg,
            grants: Mutex::new(HashMap::new()),
        }
    }

    // ── Granting ──────────────────────────────────────────────────────────────

    /// Issues a download grant for `path` to `session_id`.  Requires the
    /// session to hold `file_send`.  Hashes the file content up front so the
    /// client can verify integrity after the fetch.
    pub fn grant(&self, session_id: SessionId, path: &Path) -> Result<GrantInfo, TransferError> {
        self.grant_at(session_id, path, now_ms())
    }

    pub fn grant_at(
        &self,
        session_id: SessionId,
        path: &Path,
        now_ms: u64,
    ) -> Result<GrantInfo, TransferError> {
        let session = self
            .store
            .validate_at(session_id, Permission::FileSend, now_ms)?;

        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(TransferError::NotFound);
        }
        let size = metadata.len();
        let sha256 = sha256_file(path)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());

        let url_token = Uuid::new_v4().simple().to_string();
        let expires_at_ms = now_ms.saturating_add(self.cfg.grant_ttl_s * 1_000);
        let allowed_remote_addr = if self.cfg.strict_ip_pin {
            session.remote_addr
        } else {
            None
        };

        let grant = TransferGrant {
            file_path: path.to_path_buf(),
            filename: filename.clone(),
            issuing_session_id: session_id,
            allowed_remote_addr,
            expires_at_ms,
            content_sha256: sha256.clone(),
            size,
            consumes_remaining: self.cfg.max_consumes.max(1),
        };

        // The issuing session must survive eviction while the grant lives.
        self.store.pin(session_id);
        lock(&self.grants).insert(url_token.clone(), grant);
        info!(session_id = %session_id, %filename, size, "transfer grant issued");

        Ok(GrantInfo {
            url: format!("/file/{url_token}"),
            url_token,
            filename,
            size,
            sha256,
            expires_at_ms,
        })
    }

    // ── Consuming ─────────────────────────────────────────────────────────────

    /// Consumes a grant.  The entire decision happens under the grant-table
    /// lock: exactly one of two racing calls on a single-use grant wins.
    pub fn consume(
        &self,
        url_token: &str,
        remote_addr: Option<IpAddr>,
        range: Option<ByteRange>,
    ) -> Result<ConsumedFile, TransferError> {
        self.consume_at(url_token, remote_addr, range, now_ms())
    }

    pub fn consume_at(
        &self,
        url_token: &str,
        remote_addr: Option<IpAddr>,
        range: Option<ByteRange>,
        now_ms: u64,
    ) -> Result<ConsumedFile, TransferError> {
        let mut grants = lock(&self.grants);
        let grant = grants.get_mut(url_token).ok_or(TransferError::NotFound)?;

        if now_ms >= grant.expires_at_ms {
            let session = grant.issuing_session_id;
            grants.remove(url_token);
            drop(grants);
            self.store.unpin(session);
            return Err(TransferError::Expired);
        }

        if let Some(pinned) = grant.allowed_remote_addr {
            if remote_addr != Some(pinned) {
                warn!(token = url_token, ?remote_addr, "transfer address mismatch");
                return Err(TransferError::AddressMismatch);
            }
        }

        let (offset, length, is_partial) = match range {
            Some(r) => {
                let (offset, length) = r
                    .resolve(grant.size)
                    .ok_or(TransferError::RangeNotSatisfiable)?;
                (offset, length, true)
            }
            None => (0, grant.size, false),
        };

        let consumed = ConsumedFile {
            file_path: grant.file_path.clone(),
            filename: grant.filename.clone(),
            total_size: grant.size,
            sha256: grant.content_sha256.clone(),
            offset,
            length,
            is_partial,
        };

        grant.consumes_remaining -= 1;
        if grant.consumes_remaining == 0 {
            let session = grant.issuing_session_id;
            grants.remove(url_token);
            drop(grants);
            self.store.unpin(session);
            info!(token = url_token, "transfer grant fully consumed");
        }

        Ok(consumed)
    }

    /// Drops expired grants and releases their session pins.
    pub fn sweep_expired_at(&self, now_ms: u64) -> usize {
        let mut grants = lock(&self.grants);
        let expired: Vec<(String, SessionId)> = grants
            .iter()
            .filter(|(_, g)| now_ms >= g.expires_at_ms)
            .map(|(t, g)| (t.clone(), g.issuing_session_id))
            .collect();
        for (token, _) in &expired {
            grants.remove(token);
        }
        drop(grants);
        for (_, session) in &expired {
            self.store.unpin(*session);
        }
        expired.len()
    }

    // ── Uploads ───────────────────────────────────────────────────────────────

    /// Validates and persists an upload.  `declared_sha256`, when present,
    /// must match the received bytes exactly; mismatches reject the upload
    /// rather than storing corrupt data.
    pub fn save_upload(
        &self,
        session_id: SessionId,
        original_name: &str,
        bytes: &[u8],
        declared_sha256: Option<&str>,
    ) -> Result<StoredUpload, TransferError> {
        self.store.validate(session_id, Permission::Upload)?;

        if bytes.len() as u64 > self.cfg.upload_max_bytes {
            return Err(TransferError::TooLarge {
                max_bytes: self.cfg.upload_max_bytes,
            });
        }

        let filename = sanitize_filename(original_name);
        let ext = extension_of(&filename);
        if !self
            .cfg
            .upload_allowed_ext
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&ext))
        {
            return Err(TransferError::ExtensionNotAllowed(ext));
        }

        let sha256 = sha256_bytes(bytes);
        if let Some(declared) = declared_sha256 {
            if !declared.trim().eq_ignore_ascii_case(&sha256) {
                warn!(%filename, "upload checksum mismatch");
                return Err(TransferError::ChecksumMismatch);
            }
        }

        std::fs::create_dir_all(&self.cfg.files_dir)?;
        let dest = non_colliding_path(&self.cfg.files_dir, &filename);
        let tmp = dest.with_extension(format!(
            "{}.part-{}",
            ext,
            Uuid::new_v4().simple()
        ));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &dest)?;

        let stored_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(filename);
        info!(filename = %stored_name, size = bytes.len(), "upload stored");

        Ok(StoredUpload {
            path: dest,
            filename: stored_name,
            size: bytes.len() as u64,
            sha256,
        })
    }
}

// ── Byte ranges ───────────────────────────────────────────────────────────────

/// A parsed `Range: bytes=` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=start-` and `bytes=start-end` (inclusive end).
    From { start: u64, end: Option<u64> },
    /// `bytes=-suffix`: the final `suffix` bytes.
    Suffix(u64),
}

impl ByteRange {
    /// Parses a single-range `Range` header value.  Multi-range requests are
    /// not supported and parse as `None`.
    pub fn parse(header: &str) -> Option<ByteRange> {
        let ranges = header.trim().strip_prefix("bytes=")?;
        if ranges.contains(',') {
            return None;
        }
        let (start, end) = ranges.split_once('-')?;
        let start = start.trim();
        let end = end.trim();
        if start.is_empty() {
            return Some(ByteRange::Suffix(end.parse().ok()?));
        }
        let start: u64 = start.parse().ok()?;
        let end = if end.is_empty() {
            None
        } else {
            Some(end.parse().ok()?)
        };
        Some(ByteRange::From { start, end })
    }

    /// Resolves against a file size to `(offset, length)`, or `None` when
    /// the range is unsatisfiable.
    pub fn resolve(self, size: u64) -> Option<(u64, u64)> {
        match self {
            ByteRange::From { start, end } => {
                if start >= size {
                    return None;
                }
                let end = end.map(|e| e.min(size - 1)).unwrap_or(size - 1);
                if end < start {
                    return None;
                }
                Some((start, end - start + 1))
            }
            ByteRange::Suffix(suffix) => {
                if suffix == 0 {
                    return None;
                }
                let length = suffix.min(size);
                Some((size - length, length))
            }
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex(&hasher.finalize())
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex(&hasher.finalize()))
}

fn hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Strips directory components and control characters from a client-supplied
/// filename.
fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .trim()
        .trim_start_matches('.');
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .collect();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Appends ` (1)`, ` (2)`, … before the extension until the name is free.
fn non_colliding_path(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }
    let stem = Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());
    let ext = extension_of(filename);
    for i in 1.. {
        let name = if ext.is_empty() {
            format!("{stem} ({i})")
        } else {
            format!("{stem} ({i}).{ext}")
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use deskpilot_core::{DeviceSession, ExpiryRule, PermissionSet};

    fn broker_with_session(files_dir: PathBuf) -> (Arc<SessionStore>, TransferBroker, SessionId) {
        let store = Arc::new(SessionStore::new(ExpiryRule::unlimited(), 16));
        let session = DeviceSession::new("dev", "Phone", None, PermissionSet::all(), 0);
        let id = store.insert(session, 0);
        let cfg = TransferSection {
            files_dir,
            ..TransferSection::default()
        };
        let broker = TransferBroker::new(Arc::clone(&store), cfg);
        (store, broker, id)
    }

    fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_grant_hashes_content_and_carries_size() {
        let dir = tempfile::tempdir().unwrap();
        let (_, broker, id) = broker_with_session(dir.path().to_path_buf());
        let path = write_file(dir.path(), "report.pdf", b"pdf bytes");

        let info = broker.grant_at(id, &path, 0).unwrap();

        assert_eq!(info.size, 9);
        assert_eq!(info.sha256, sha256_bytes(b"pdf bytes"));
        assert!(info.url.starts_with("/file/"));
    }

    #[test]
    fn test_grant_requires_file_send_permission() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(ExpiryRule::unlimited(), 16));
        let session = DeviceSession::new("dev", "Phone", None, PermissionSet::none(), 0);
        let id = store.insert(session, 0);
        let broker = TransferBroker::new(
            store,
            TransferSection {
                files_dir: dir.path().to_path_buf(),
                ..TransferSection::default()
            },
        );
        let path = write_file(dir.path(), "x.txt", b"x");

        let err = broker.grant_at(id, &path, 0).unwrap_err();

        assert!(matches!(
            err,
            TransferError::Gate(GateError::PermissionDenied(Permission::FileSend))
        ));
    }

    #[test]
    fn test_full_consume_matches_grant_hash() {
        let dir = tempfile::tempdir().unwrap();
        let (_, broker, id) = broker_with_session(dir.path().to_path_buf());
        let path = write_file(dir.path(), "data.bin", b"payload-bytes");
        let info = broker.grant_at(id, &path, 0).unwrap();

        let consumed = broker.consume_at(&info.url_token, None, None, 1_000).unwrap();

        let bytes = std::fs::read(&consumed.file_path).unwrap();
        assert_eq!(sha256_bytes(&bytes), info.sha256);
        assert_eq!(consumed.offset, 0);
        assert_eq!(consumed.length, 13);
        assert!(!consumed.is_partial);
    }

    #[test]
    fn test_single_use_grant_is_gone_after_consume() {
        let dir = tempfile::tempdir().unwrap();
        let (_, broker, id) = broker_with_session(dir.path().to_path_buf());
        let path = write_file(dir.path(), "once.txt", b"once");
        let info = broker.grant_at(id, &path, 0).unwrap();

        assert!(broker.consume_at(&info.url_token, None, None, 1).is_ok());
        assert!(matches!(
            broker.consume_at(&info.url_token, None, None, 2),
            Err(TransferError::NotFound)
        ));
    }

    #[test]
    fn test_concurrent_consumes_have_exactly_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let (_, broker, id) = broker_with_session(dir.path().to_path_buf());
        let path = write_file(dir.path(), "race.txt", b"contended");
        let info = broker.grant_at(id, &path, 0).unwrap();

        let broker = Arc::new(broker);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let broker = Arc::clone(&broker);
                let token = info.url_token.clone();
                std::thread::spawn(move || broker.consume_at(&token, None, None, 1).is_ok())
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap_or(false))
            .filter(|won| *won)
            .count();

        assert_eq!(wins, 1, "single-use grant must have one winner");
    }

    #[test]
    fn test_expired_grant_reports_expired_and_releases_pin() {
        let dir = tempfile::tempdir().unwrap();
        let (store, broker, id) = broker_with_session(dir.path().to_path_buf());
        let path = write_file(dir.path(), "late.txt", b"late");
        let info = broker.grant_at(id, &path, 0).unwrap();

        // Default TTL is 300s; at t=301s the grant is dead.
        let err = broker
            .consume_at(&info.url_token, None, None, 301_000)
            .unwrap_err();

        assert!(matches!(err, TransferError::Expired));
        assert!(!store.is_pinned(id));
    }

    #[test]
    fn test_address_pinned_grant_rejects_other_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(ExpiryRule::unlimited(), 16));
        let paired_addr: IpAddr = "192.168.1.7".parse().unwrap();
        let session = DeviceSession::new("dev", "Phone", Some(paired_addr), PermissionSet::all(), 0);
        let id = store.insert(session, 0);
        let broker = TransferBroker::new(
            store,
            TransferSection {
                files_dir: dir.path().to_path_buf(),
                strict_ip_pin: true,
                ..TransferSection::default()
            },
        );
        let path = write_file(dir.path(), "pinned.txt", b"pinned");
        let info = broker.grant_at(id, &path, 0).unwrap();

        let stranger: IpAddr = "192.168.1.99".parse().unwrap();
        assert!(matches!(
            broker.consume_at(&info.url_token, Some(stranger), None, 1),
            Err(TransferError::AddressMismatch)
        ));
        // The grant survives the mismatch; the right address still works.
        assert!(broker
            .consume_at(&info.url_token, Some(paired_addr), None, 2)
            .is_ok());
    }

    #[test]
    fn test_ranged_consume_returns_the_requested_window() {
        let dir = tempfile::tempdir().unwrap();
        let (_, broker, id) = broker_with_session(dir.path().to_path_buf());
        let path = write_file(dir.path(), "ranged.txt", b"0123456789");
        let cfg_token = broker.grant_at(id, &path, 0).unwrap();

        let range = ByteRange::parse("bytes=2-5").unwrap();
        let consumed = broker
            .consume_at(&cfg_token.url_token, None, Some(range), 1)
            .unwrap();

        assert_eq!(consumed.offset, 2);
        assert_eq!(consumed.length, 4);
        assert!(consumed.is_partial);
        assert_eq!(consumed.total_size, 10);
    }

    #[test]
    fn test_range_parsing_covers_the_three_forms() {
        assert_eq!(
            ByteRange::parse("bytes=0-99"),
            Some(ByteRange::From {
                start: 0,
                end: Some(99)
            })
        );
        assert_eq!(
            ByteRange::parse("bytes=500-"),
            Some(ByteRange::From {
                start: 500,
                end: None
            })
        );
        assert_eq!(ByteRange::parse("bytes=-200"), Some(ByteRange::Suffix(200)));
        assert_eq!(ByteRange::parse("bytes=0-10,20-30"), None);
        assert_eq!(ByteRange::parse("items=0-10"), None);
    }

    #[test]
    fn test_range_resolution_clamps_and_rejects() {
        let from = ByteRange::From {
            start: 5,
            end: Some(1_000),
        };
        assert_eq!(from.resolve(10), Some((5, 5)), "end clamps to file size");

        let past_end = ByteRange::From {
            start: 10,
            end: None,
        };
        assert_eq!(past_end.resolve(10), None, "start at EOF is unsatisfiable");

        assert_eq!(ByteRange::Suffix(4).resolve(10), Some((6, 4)));
        assert_eq!(ByteRange::Suffix(100).resolve(10), Some((0, 10)));
    }

    #[test]
    fn test_upload_rejects_disallowed_extension() {
        let dir = tempfile::tempdir().unwrap();
        let (_, broker, id) = broker_with_session(dir.path().to_path_buf());

        let err = broker
            .save_upload(id, "payload.exe", b"MZ", None)
            .unwrap_err();

        assert!(matches!(err, TransferError::ExtensionNotAllowed(ext) if ext == "exe"));
    }

    #[test]
    fn test_upload_rejects_oversize_body() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(ExpiryRule::unlimited(), 16));
        let session = DeviceSession::new("dev", "Phone", None, PermissionSet::all(), 0);
        let id = store.insert(session, 0);
        let broker = TransferBroker::new(
            store,
            TransferSection {
                files_dir: dir.path().to_path_buf(),
                upload_max_bytes: 4,
                ..TransferSection::default()
            },
        );

        let err = broker
            .save_upload(id, "note.txt", b"five!", None)
            .unwrap_err();

        assert!(matches!(err, TransferError::TooLarge { max_bytes: 4 }));
    }

    #[test]
    fn test_upload_checksum_mismatch_rejects_without_storing() {
        let dir = tempfile::tempdir().unwrap();
        let (_, broker, id) = broker_with_session(dir.path().to_path_buf());

        let err = broker
            .save_upload(id, "note.txt", b"content", Some("deadbeef"))
            .unwrap_err();

        assert!(matches!(err, TransferError::ChecksumMismatch));
        assert!(!dir.path().join("note.txt").exists());
    }

    #[test]
    fn test_upload_with_matching_checksum_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let (_, broker, id) = broker_with_session(dir.path().to_path_buf());
        let sha = sha256_bytes(b"content");

        let stored = broker
            .save_upload(id, "note.txt", b"content", Some(&sha))
            .unwrap();

        assert_eq!(std::fs::read(&stored.path).unwrap(), b"content");
        assert_eq!(stored.sha256, sha);
    }

    #[test]
    fn test_upload_name_collision_gets_a_numbered_name() {
        let dir = tempfile::tempdir().unwrap();
        let (_, broker, id) = broker_with_session(dir.path().to_path_buf());

        let first = broker.save_upload(id, "dup.txt", b"one", None).unwrap();
        let second = broker.save_upload(id, "dup.txt", b"two", None).unwrap();

        assert_eq!(first.filename, "dup.txt");
        assert_eq!(second.filename, "dup (1).txt");
        assert_eq!(std::fs::read(&second.path).unwrap(), b"two");
    }

    #[test]
    fn test_upload_strips_path_components_from_the_name() {
        let dir = tempfile::tempdir().unwrap();
        let (_, broker, id) = broker_with_session(dir.path().to_path_buf());

        let stored = broker
            .save_upload(id, "../../etc/passwd.txt", b"nope", None)
            .unwrap();

        assert_eq!(stored.filename, "passwd.txt");
        assert!(stored.path.starts_with(dir.path()));
    }

    #[test]
    fn test_sweep_drops_expired_grants() {
        let dir = tempfile::tempdir().unwrap();
        let (_, broker, id) = broker_with_session(dir.path().to_path_buf());
        let path = write_file(dir.path(), "a.txt", b"a");
        let info = broker.grant_at(id, &path, 0).unwrap();

        assert_eq!(broker.sweep_expired_at(301_000), 1);
        assert!(matches!(
            broker.consume_at(&info.url_token, None, None, 301_000),
            Err(TransferError::NotFound)
        ));
    }
}
