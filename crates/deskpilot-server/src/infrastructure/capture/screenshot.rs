//! Screenshot-poll backend, the last-resort capture path.
//!
//! Runs the configured screenshot command once per frame interval; the
//! command writes a still image to the `{path}` placeholder, which is read
//! back and pushed as an mjpeg frame.  An order of magnitude slower than a
//! real pipeline, but it works on desktops where no encoder is installed.

use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use deskpilot_core::{BackendKind, StreamCodec};

use crate::application::now_ms;

use super::{
    program_on_path, CaptureBackend, CaptureError, Frame, FrameSource, StreamParams,
    FRAME_CHANNEL_DEPTH,
};

const CODECS: [StreamCodec; 1] = [StreamCodec::Mjpeg];

pub struct ScreenshotBackend {
    template: Vec<String>,
}

impl ScreenshotBackend {
    pub fn new(template: Vec<String>) -> Self {
        ScreenshotBackend { template }
    }

    fn rendered(&self, path: &str) -> Vec<String> {
        self.template
            .iter()
            .map(|arg| arg.replace("{path}", path))
            .collect()
    }
}

impl CaptureBackend for ScreenshotBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ScreenshotPoll
    }

    fn codecs(&self) -> &[StreamCodec] {
        &CODECS
    }

    fn probe(&self) -> Result<(), CaptureError> {
        let Some(program) = self.template.first() else {
            return Err(CaptureError::Unavailable(
                "no screenshot command configured".into(),
            ));
        };
        if !program_on_path(program) {
            return Err(CaptureError::Unavailable(format!(
                "'{program}' not found on PATH"
            )));
        }
        Ok(())
    }

    fn start(&self, params: StreamParams) -> Result<FrameSource, CaptureError> {
        self.probe()?;

        let shot_path: PathBuf =
            std::env::temp_dir().join(format!("deskpilot-shot-{}.jpg", Uuid::new_v4().simple()));
        let argv = self.rendered(&shot_path.to_string_lossy());
        let interval = Duration::from_millis(1_000 / u64::from(params.fps.max(1)));

        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_DEPTH);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some((program, args)) = argv.split_first() else {
                    break;
                };
                let status = Command::new(program).args(args).status().await;
                match status {
                    Ok(s) if s.success() => {}
                    Ok(s) => {
                        warn!(code = ?s.code(), "screenshot command failed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "screenshot command could not run");
                        break;
                    }
                }
                match tokio::fs::read(&shot_path).await {
                    Ok(bytes) if !bytes.is_empty() => {
                        if tx.send(Frame::new(bytes, now_ms())).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => warn!("screenshot command produced an empty file"),
                    Err(e) => {
                        warn!(error = %e, "screenshot file unreadable");
                        break;
                    }
                }
            }
            let _ = tokio::fs::remove_file(&shot_path).await;
            debug!("screenshot poll loop ended");
        });

        Ok(FrameSource::new(rx, task))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_fails_without_a_template() {
        let backend = ScreenshotBackend::new(vec![]);
        assert!(matches!(backend.probe(), Err(CaptureError::Unavailable(_))));
    }

    #[test]
    fn test_path_placeholder_is_substituted() {
        let backend = ScreenshotBackend::new(vec![
            "screenshot-tool".to_string(),
            "-o".to_string(),
            "{path}".to_string(),
        ]);
        let argv = backend.rendered("/tmp/x.jpg");
        assert_eq!(argv[2], "/tmp/x.jpg");
    }

    #[tokio::test]
    async fn test_start_polls_the_command_output_file() {
        // A shell stand-in "screenshot tool" that writes a fixed image.
        let backend = ScreenshotBackend::new(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            r"printf '\377\330shot\377\331' > {path}".to_string(),
        ]);

        let mut source = backend
            .start(StreamParams {
                width: 640,
                quality: 40,
                fps: 20,
            })
            .expect("shell must spawn");

        let frame = tokio::time::timeout(Duration::from_secs(5), source.next_frame())
            .await
            .expect("frame within timeout")
            .expect("source alive");

        assert_eq!(frame.data.as_slice(), b"\xFF\xD8shot\xFF\xD9");
    }
}
