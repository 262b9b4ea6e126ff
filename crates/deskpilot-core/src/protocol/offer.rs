//! Stream offer negotiation types.
//!
//! The server describes what it can capture as an ordered list of
//! [`StreamCandidate`]s; clients start with `recommended` and walk the list on
//! failure per `fallback_policy`.

use serde::{Deserialize, Serialize};

// ── Backends ──────────────────────────────────────────────────────────────────

/// Capture backend families, in rough preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process capture through the platform API.
    NativeCapture,
    /// Primary external encoder pipeline.
    PipelineA,
    /// Secondary external encoder pipeline.
    PipelineB,
    /// Periodic still-image capture, the last resort.
    ScreenshotPoll,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::NativeCapture,
        BackendKind::PipelineA,
        BackendKind::PipelineB,
        BackendKind::ScreenshotPoll,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::NativeCapture => "native_capture",
            BackendKind::PipelineA => "pipeline_a",
            BackendKind::PipelineB => "pipeline_b",
            BackendKind::ScreenshotPoll => "screenshot_poll",
        }
    }

    /// Preference rank used when health is equal.  Lower is better.
    pub fn preference(&self) -> u8 {
        match self {
            BackendKind::NativeCapture => 0,
            BackendKind::PipelineA => 1,
            BackendKind::PipelineB => 2,
            BackendKind::ScreenshotPoll => 3,
        }
    }
}

/// Observed health of a backend, fed back from live streaming sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendHealth {
    /// Probed available but never streamed.
    Untested,
    /// Served frames recently without incident.
    Ok,
    /// Working, but has accumulated enough mid-stream failures to rank below
    /// every `Ok` backend.
    Degraded,
    /// Probe or startup failed; skipped until the probe cache expires.
    Failed,
}

impl BackendHealth {
    /// Rank for candidate ordering.  Lower is better.
    pub fn rank(&self) -> u8 {
        match self {
            BackendHealth::Ok => 0,
            BackendHealth::Untested => 1,
            BackendHealth::Degraded => 2,
            BackendHealth::Failed => 3,
        }
    }

    pub fn is_usable(&self) -> bool {
        !matches!(self, BackendHealth::Failed)
    }
}

// ── Codecs and candidates ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamCodec {
    Mjpeg,
    H264,
    H265,
}

impl StreamCodec {
    /// Content type of the HTTP response body for this codec.
    pub fn mime(&self) -> &'static str {
        match self {
            StreamCodec::Mjpeg => "multipart/x-mixed-replace; boundary=frame",
            StreamCodec::H264 | StreamCodec::H265 => "video/mp2t",
        }
    }

    /// Path segment of the stream endpoint serving this codec.
    pub fn variant(&self) -> &'static str {
        match self {
            StreamCodec::Mjpeg => "mjpeg",
            StreamCodec::H264 => "h264_ts",
            StreamCodec::H265 => "h265_ts",
        }
    }
}

/// One playable stream a client could open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamCandidate {
    pub backend: BackendKind,
    pub codec: StreamCodec,
    /// Relative URL of the stream endpoint, query parameters included.
    pub url: String,
    pub width: u32,
    /// JPEG quality for mjpeg, encoder quality hint otherwise (1..=100).
    pub quality: u8,
    pub fps: u32,
    /// Expected worst-case time to first frame for this candidate.
    pub first_frame_budget_ms: u64,
}

/// The full negotiation result returned by the offer endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamOffer {
    /// Index into `candidates` the client should try first.
    pub recommended: usize,
    /// Ordered best-to-worst.
    pub candidates: Vec<StreamCandidate>,
    /// Currently always `"ordered_candidates"`: on failure, advance to the
    /// next candidate in order.
    pub fallback_policy: String,
    /// How long a client should wait before reconnecting a dropped stream.
    pub reconnect_hint_ms: u64,
}

impl StreamOffer {
    pub const FALLBACK_ORDERED: &'static str = "ordered_candidates";

    pub fn recommended_candidate(&self) -> Option<&StreamCandidate> {
        self.candidates.get(self.recommended)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
