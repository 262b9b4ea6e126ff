//! External encoder pipeline backend.
//!
//! Spawns a configured command (an encoder invocation reading the screen and
//! writing encoded video to stdout) and splits its stdout into frames: whole
//! JPEGs for mjpeg templates, fixed-size chunks for transport-stream
//! templates.  The template carries `{width}`, `{quality}`, and `{fps}`
//! placeholders substituted at start time.

use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use deskpilot_core::{BackendKind, StreamCodec};

use crate::application::now_ms;

use super::{
    program_on_path, CaptureBackend, CaptureError, Frame, FrameSource, StreamParams,
    FRAME_CHANNEL_DEPTH,
};

/// How stdout bytes are cut into frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// Scan for JPEG start/end markers; each complete image is one frame.
    Jpeg,
    /// Emit stdout in chunks as they arrive; the client demuxes the container.
    Chunked,
}

/// A capture backend that runs one external encoder process per capture.
pub struct PipelineBackend {
    kind: BackendKind,
    template: Vec<String>,
    codecs: Vec<StreamCodec>,
}

impl PipelineBackend {
    /// `template` is the configured command line; an empty template means the
    /// operator disabled this pipeline.
    pub fn new(kind: BackendKind, template: Vec<String>, codecs: Vec<StreamCodec>) -> Self {
        PipelineBackend {
            kind,
            template,
            codecs,
        }
    }

    fn rendered(&self, params: StreamParams) -> Vec<String> {
        self.template
            .iter()
            .map(|arg| {
                arg.replace("{width}", &params.width.to_string())
                    .replace("{quality}", &params.quality.to_string())
                    .replace("{fps}", &params.fps.to_string())
            })
            .collect()
    }

    fn framing(&self) -> Framing {
        // The first codec decides the stdout format; mjpeg templates emit
        // concatenated JPEGs, everything else a byte stream.
        match self.codecs.first() {
            Some(StreamCodec::Mjpeg) | None => Framing::Jpeg,
            Some(_) => Framing::Chunked,
        }
    }
}

impl CaptureBackend for PipelineBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn codecs(&self) -> &[StreamCodec] {
        &self.codecs
    }

    fn probe(&self) -> Result<(), CaptureError> {
        let Some(program) = self.template.first() else {
            return Err(CaptureError::Unavailable("no command configured".into()));
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
        let argv = self.rendered(params);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| CaptureError::Unavailable("no command configured".into()))?;

        debug!(kind = %self.kind.as_str(), %program, "starting capture pipeline");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Ended("pipeline has no stdout".into()))?;

        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_DEPTH);
        let framing = self.framing();
        let kind = self.kind;
        let task = tokio::spawn(async move {
            // child must live as long as the pump; kill_on_drop reaps it.
            let _child = child;
            match framing {
                Framing::Jpeg => pump_jpeg(stdout, tx).await,
                Framing::Chunked => pump_chunks(stdout, tx).await,
            }
            debug!(kind = %kind.as_str(), "capture pipeline ended");
        });

        Ok(FrameSource::new(rx, task))
    }
}

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Scans a concatenated-JPEG byte stream and forwards each complete image.
async fn pump_jpeg(mut stdout: tokio::process::ChildStdout, tx: mpsc::Sender<Frame>) {
    let mut buf: Vec<u8> = Vec::with_capacity(64 * 1024);
    let mut chunk = [0u8; 16 * 1024];
    loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "capture stdout read failed");
                break;
            }
        };
        buf.extend_from_slice(&chunk[..n]);

        while let Some(frame) = extract_jpeg(&mut buf) {
            // try_send drops the frame under backpressure instead of
            // queueing stale video.
            if let Err(mpsc::error::TrySendError::Closed(_)) =
                tx.try_send(Frame::new(frame, now_ms()))
            {
                return;
            }
        }
        // A garbage prefix before the first SOI never shrinks on its own.
        trim_to_soi(&mut buf);
    }
}

/// Forwards stdout in arrival-order chunks.
async fn pump_chunks(mut stdout: tokio::process::ChildStdout, tx: mpsc::Sender<Frame>) {
    let mut chunk = [0u8; 32 * 1024];
    loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "capture stdout read failed");
                break;
            }
        };
        if let Err(mpsc::error::TrySendError::Closed(_)) =
            tx.try_send(Frame::new(chunk[..n].to_vec(), now_ms()))
        {
            return;
        }
    }
}

/// Removes and returns the first complete JPEG in `buf`, if any.
fn extract_jpeg(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let start = find_marker(buf, JPEG_SOI)?;
    let end_rel = find_marker(&buf[start + 2..], JPEG_EOI)?;
    let end = start + 2 + end_rel + 2;
    let frame = buf[start..end].to_vec();
    buf.drain(..end);
    Some(frame)
}

/// Discards bytes before the first SOI so junk between images cannot grow the
/// buffer without bound.
fn trim_to_soi(buf: &mut Vec<u8>) {
    if buf.len() < 2 {
        return;
    }
    match find_marker(buf, JPEG_SOI) {
        Some(0) => {}
        Some(pos) => {
            buf.drain(..pos);
        }
        None => {
            // Keep the final byte; it may be the first half of a marker.
            let keep_from = buf.len() - 1;
            buf.drain(..keep_from);
        }
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2]) -> Option<usize> {
    haystack
        .windows(2)
        .position(|w| w == marker)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
