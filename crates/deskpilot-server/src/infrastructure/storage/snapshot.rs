//! JSON session snapshot persistence.
//!
//! The snapshot is the durability side of the session store: written through
//! a temp file plus rename so a crash mid-write never truncates the previous
//! snapshot, and loaded tolerantly so one corrupt record does not discard
//! every paired device.

use std::path::PathBuf;

use tracing::warn;
use uuid::Uuid;

use deskpilot_core::DeviceSession;

use crate::application::session_store::SnapshotSink;

pub struct JsonSnapshotSink {
    path: PathBuf,
}

impl JsonSnapshotSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonSnapshotSink { path: path.into() }
    }
}

impl SnapshotSink for JsonSnapshotSink {
    fn save(&self, sessions: &[DeviceSession]) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(sessions)?;

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let tmp = self
            .path
            .with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn load(&self) -> std::io::Result<Vec<DeviceSession>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        // Records are parsed one by one; a single bad entry is dropped with
        // a warning instead of failing the whole load.
        let values: Vec<serde_json::Value> = match serde_json::from_str(&content) {
            Ok(values) => values,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "snapshot unreadable, starting empty");
                return Ok(Vec::new());
            }
        };

        let mut sessions = Vec::with_capacity(values.len());
        for value in values {
            match serde_json::from_value::<DeviceSession>(value) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "dropping malformed snapshot record");
                }
            }
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskpilot_core::PermissionSet;

    fn session(device_id: &str) -> DeviceSession {
        DeviceSession::new(device_id, "Phone", None, PermissionSet::all(), 1_000)
    }

    #[test]
    fn test_save_then_load_round_trips_sessions() {
        // Arrange
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = JsonSnapshotSink::new(dir.path().join("sessions.json"));
        let sessions = vec![session("dev-a"), session("dev-b")];

        // Act
        sink.save(&sessions).expect("save");
        let loaded = sink.load().expect("load");

        // Assert
        assert_eq!(loaded, sessions);
    }

    #[test]
    fn test_missing_snapshot_loads_empty() {
        // Arrange
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = JsonSnapshotSink::new(dir.path().join("absent.json"));

        // Act / Assert
        assert!(sink.load().expect("load").is_empty());
    }

    #[test]
    fn test_malformed_record_is_dropped_not_fatal() {
        // Arrange
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sessions.json");
        let good = serde_json::to_value(session("dev-a")).expect("to_value");
        let doc = serde_json::json!([good, {"not": "a session"}]);
        std::fs::write(&path, serde_json::to_string(&doc).expect("json")).expect("write");
        let sink = JsonSnapshotSink::new(path);

        // Act
        let loaded = sink.load().expect("load");

        // Assert
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].device_id, "dev-a");
    }

    #[test]
    fn test_unreadable_snapshot_starts_empty() {
        // Arrange
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "{{{{ not json").expect("write");
        let sink = JsonSnapshotSink::new(path);

        // Act / Assert
        assert!(sink.load().expect("load").is_empty());
    }

    #[test]
    fn test_save_overwrites_previous_snapshot() {
        // Arrange
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = JsonSnapshotSink::new(dir.path().join("sessions.json"));
        sink.save(&[session("old")]).expect("first save");

        // Act
        sink.save(&[session("new")]).expect("second save");
        let loaded = sink.load().expect("load");

        // Assert
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].device_id, "new");
    }
}
