//! Scripted capture backend for tests.
//!
//! Lets orchestrator tests stage probe failures, start failures, short-lived
//! captures, and endless captures without spawning real processes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use deskpilot_core::{BackendKind, StreamCodec};

use crate::application::now_ms;

use super::{CaptureBackend, CaptureError, Frame, FrameSource, StreamParams, FRAME_CHANNEL_DEPTH};

/// What the mock does when probed/started.
#[derive(Debug, Clone)]
pub enum MockScript {
    /// Probe reports unavailable; start is never reached.
    ProbeFail,
    /// Probe succeeds but every start fails.
    StartFail,
    /// Serve these frames in order, then die.
    Frames(Vec<Vec<u8>>),
    /// Serve the same frame every few milliseconds until dropped.
    Endless(Vec<u8>),
}

pub struct MockBackend {
    kind: BackendKind,
    script: MockScript,
    codecs: Vec<StreamCodec>,
    starts: AtomicU32,
}

impl MockBackend {
    pub fn new(kind: BackendKind, script: MockScript) -> Self {
        MockBackend {
            kind,
            script,
            codecs: vec![StreamCodec::Mjpeg],
            starts: AtomicU32::new(0),
        }
    }

    pub fn with_codecs(mut self, codecs: Vec<StreamCodec>) -> Self {
        self.codecs = codecs;
        self
    }

    /// How many times `start` has been called.
    pub fn start_count(&self) -> u32 {
        self.starts.load(Ordering::Acquire)
    }
}

impl CaptureBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn codecs(&self) -> &[StreamCodec] {
        &self.codecs
    }

    fn probe(&self) -> Result<(), CaptureError> {
        match self.script {
            MockScript::ProbeFail => Err(CaptureError::Unavailable("scripted probe failure".into())),
            _ => Ok(()),
        }
    }

    fn start(&self, _params: StreamParams) -> Result<FrameSource, CaptureError> {
        self.starts.fetch_add(1, Ordering::AcqRel);
        match &self.script {
            MockScript::ProbeFail => {
                Err(CaptureError::Unavailable("scripted probe failure".into()))
            }
            MockScript::StartFail => Err(CaptureError::Ended("scripted start failure".into())),
            MockScript::Frames(frames) => {
                let (tx, rx) = mpsc::channel(FRAME_CHANNEL_DEPTH.max(frames.len() + 1));
                for data in frames {
                    // Buffered up front; the channel closes once drained.
                    let _ = tx.try_send(Frame::new(data.clone(), now_ms()));
                }
                drop(tx);
                Ok(FrameSource::from_channel(rx))
            }
            MockScript::Endless(data) => {
                let (tx, rx) = mpsc::channel(FRAME_CHANNEL_DEPTH);
                let data = data.clone();
                let task = tokio::spawn(async move {
                    loop {
                        if tx.send(Frame::new(data.clone(), now_ms())).await.is_err() {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                });
                Ok(FrameSource::new(rx, task))
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_frames_arrive_in_order_then_end() {
        let backend = MockBackend::new(
            BackendKind::PipelineA,
            MockScript::Frames(vec![vec![1], vec![2], vec![3]]),
        );
        let params = StreamParams {
            width: 640,
            quality: 50,
            fps: 30,
        };

        let mut source = backend.start(params).unwrap();

        assert_eq!(source.next_frame().await.unwrap().data.as_slice(), &[1]);
        assert_eq!(source.next_frame().await.unwrap().data.as_slice(), &[2]);
        assert_eq!(source.next_frame().await.unwrap().data.as_slice(), &[3]);
        assert!(source.next_frame().await.is_none());
        assert_eq!(backend.start_count(), 1);
    }

    #[test]
    fn test_probe_fail_script_fails_probe() {
        let backend = MockBackend::new(BackendKind::PipelineB, MockScript::ProbeFail);
        assert!(backend.probe().is_err());
    }
}
