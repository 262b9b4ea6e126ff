//! Screen-capture backend seam.
//!
//! The orchestrator never talks to capture tools directly; it sees a closed
//! set of [`CaptureBackend`] implementations behind one trait: external
//! encoder pipelines spawned from configured command templates, a periodic
//! screenshot poller, and a scripted mock for tests.  `probe` answers "could
//! this backend plausibly start here" cheaply and off the latency-sensitive
//! path; `start` commits to producing frames.

mod mock;
mod process;
mod screenshot;

pub use mock::{MockBackend, MockScript};
pub use process::PipelineBackend;
pub use screenshot::ScreenshotBackend;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use deskpilot_core::{BackendKind, StreamCodec};

// ── Types ─────────────────────────────────────────────────────────────────────

/// One encoded unit pushed to viewers: a complete JPEG for mjpeg, a transport
/// stream chunk for the TS codecs.  Cheap to clone so one capture can feed
/// many viewers.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Arc<Vec<u8>>,
    pub captured_at_ms: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, captured_at_ms: u64) -> Self {
        Frame {
            data: Arc::new(data),
            captured_at_ms,
        }
    }
}

/// Encode ceilings a capture is started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamParams {
    pub width: u32,
    pub quality: u8,
    pub fps: u32,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    /// The backend cannot run here (no template, binary missing).
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("failed to spawn capture process: {0}")]
    Spawn(#[from] std::io::Error),
    /// The capture process exited or its output ended.
    #[error("capture pipeline ended: {0}")]
    Ended(String),
}

// ── Trait ─────────────────────────────────────────────────────────────────────

/// A concrete capture/encode mechanism.
pub trait CaptureBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Codecs this backend can serve, best first.
    fn codecs(&self) -> &[StreamCodec];

    /// Cheap availability check.  Must not start a capture.
    fn probe(&self) -> Result<(), CaptureError>;

    /// Starts producing frames at the given ceilings.
    fn start(&self, params: StreamParams) -> Result<FrameSource, CaptureError>;
}

// ── Frame source ──────────────────────────────────────────────────────────────

/// Handle to a running capture.  Frames arrive in capture order; the channel
/// closing means the backend died.  Dropping the source stops the capture.
pub struct FrameSource {
    rx: mpsc::Receiver<Frame>,
    task: Option<JoinHandle<()>>,
}

impl FrameSource {
    /// Wraps a producer task and its frame channel.
    pub fn new(rx: mpsc::Receiver<Frame>, task: JoinHandle<()>) -> Self {
        FrameSource {
            rx,
            task: Some(task),
        }
    }

    /// A source fed directly by the caller, without a pump task.  Used by the
    /// mock backend.
    pub fn from_channel(rx: mpsc::Receiver<Frame>) -> Self {
        FrameSource { rx, task: None }
    }

    /// Next frame in capture order, or `None` once the backend has died.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Bounded depth of every frame channel.  Under backpressure the producer
/// drops new frames rather than queueing stale video.
pub const FRAME_CHANNEL_DEPTH: usize = 8;

/// Resolves a command template's program against `PATH`.
pub(crate) fn program_on_path(program: &str) -> bool {
    let program_path = std::path::Path::new(program);
    if program_path.is_absolute() {
        return program_path.exists();
    }
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(program).exists())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
