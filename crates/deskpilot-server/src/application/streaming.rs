//! Streaming orchestrator.
//!
//! Owns the capture backend registry, the cached probe/health table, and the
//! live frame sources.  One capture feeds any number of viewers through a
//! broadcast fan-out, so serving a second representation of the same screen
//! never spawns a second capture.
//!
//! Viewer recovery happens here, not in the HTTP handler: when a backend dies
//! mid-stream the viewer's [`ViewerSession::next_frame`] walks the fallback
//! order and reattaches, and only when every candidate is exhausted does the
//! viewer see an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use deskpilot_core::{BackendHealth, BackendKind, StreamCandidate, StreamCodec, StreamOffer};

use crate::application::now_ms;
use crate::domain::config::StreamingSection;
use crate::infrastructure::capture::{CaptureBackend, Frame, StreamParams};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StreamError {
    /// Every candidate failed within the first-frame budget.
    #[error("no capture backend produced a frame within {budget_ms} ms")]
    NoBackend { budget_ms: u64 },
}

// ── Registry state ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct HealthEntry {
    health: BackendHealth,
    last_checked_ms: u64,
    /// Consecutive mid-stream capture deaths.  Reset by a clean stop.
    consecutive_errors: u32,
    failure_count: u64,
    last_error: Option<String>,
    last_error_at_ms: Option<u64>,
}

impl HealthEntry {
    fn untested() -> Self {
        HealthEntry {
            health: BackendHealth::Untested,
            last_checked_ms: 0,
            consecutive_errors: 0,
            failure_count: 0,
            last_error: None,
            last_error_at_ms: None,
        }
    }
}

/// One live capture shared by every viewer of the same (backend, params).
struct SharedSource {
    tx: broadcast::Sender<Frame>,
}

type SourceKey = (BackendKind, StreamParams);

#[derive(Debug, Clone, Serialize)]
pub struct ViewerStat {
    pub viewer_id: u64,
    pub backend: BackendKind,
    pub frames: u64,
    pub started_at_ms: u64,
}

/// Wire shape of one row in the backend stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStats {
    pub kind: BackendKind,
    pub health: BackendHealth,
    pub last_checked_ms: u64,
    pub failure_count: u64,
    pub consecutive_errors: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamingStats {
    pub backends: Vec<BackendStats>,
    pub viewers: Vec<ViewerStat>,
}

/// Subscriber fan-out depth.  A lagging viewer skips frames (never sees them
/// reordered) rather than stalling the capture.
const FANOUT_DEPTH: usize = 16;

// ── Orchestrator ──────────────────────────────────────────────────────────────

pub struct StreamingOrchestrator {
    cfg: StreamingSection,
    backends: Vec<Arc<dyn CaptureBackend>>,
    health: Mutex<HashMap<BackendKind, HealthEntry>>,
    sources: Mutex<HashMap<SourceKey, SharedSource>>,
    viewers: Mutex<HashMap<u64, ViewerStat>>,
    next_viewer_id: AtomicU64,
}

impl StreamingOrchestrator {
    pub fn new(cfg: StreamingSection, backends: Vec<Arc<dyn CaptureBackend>>) -> Arc<Self> {
        let health = backends
            .iter()
            .map(|b| (b.kind(), HealthEntry::untested()))
            .collect();
        Arc::new(StreamingOrchestrator {
            cfg,
            backends,
            health: Mutex::new(health),
            sources: Mutex::new(HashMap::new()),
            viewers: Mutex::new(HashMap::new()),
            next_viewer_id: AtomicU64::new(1),
        })
    }

    // ── Profiles ──────────────────────────────────────────────────────────────

    /// Encode ceilings for the default profile, clamped by any caller hints.
    pub fn default_params(&self) -> StreamParams {
        StreamParams {
            width: self.cfg.default_width,
            quality: self.cfg.default_quality,
            fps: self.cfg.default_fps,
        }
    }

    /// Low-latency profile: the default profile squeezed under tighter caps.
    pub fn low_latency_params(&self) -> StreamParams {
        StreamParams {
            width: self.cfg.default_width.min(self.cfg.lowlat_max_width),
            quality: self.cfg.default_quality.min(self.cfg.lowlat_max_quality),
            fps: self.cfg.default_fps.min(self.cfg.lowlat_max_fps),
        }
    }

    /// Caller-requested ceilings clamped into the valid range.
    pub fn clamp_params(&self, width: Option<u32>, quality: Option<u8>, fps: Option<u32>) -> StreamParams {
        let base = self.default_params();
        StreamParams {
            width: width.unwrap_or(base.width).clamp(160, 3840),
            quality: quality.unwrap_or(base.quality).clamp(1, 100),
            fps: fps.unwrap_or(base.fps).clamp(1, 60),
        }
    }

    // ── Probing and ranking ───────────────────────────────────────────────────

    /// Refreshes stale probe results.  Cheap (PATH checks), but still cached
    /// so the offer endpoint never probes per request.
    pub fn refresh_probes(&self, now_ms: u64) {
        let ttl_ms = self.cfg.probe_cache_ttl_s * 1_000;
        let mut health = lock(&self.health);
        for backend in &self.backends {
            let entry = health
                .entry(backend.kind())
                .or_insert_with(HealthEntry::untested);
            if entry.last_checked_ms != 0 && now_ms < entry.last_checked_ms + ttl_ms {
                continue;
            }
            entry.last_checked_ms = now_ms;
            match backend.probe() {
                Ok(()) => {
                    // A backend that failed earlier gets another chance once
                    // its probe cache expires.
                    if entry.health == BackendHealth::Failed {
                        entry.health = BackendHealth::Untested;
                    }
                }
                Err(e) => {
                    debug!(kind = %backend.kind().as_str(), error = %e, "probe failed");
                    entry.health = BackendHealth::Failed;
                    entry.last_error = Some(e.to_string());
                    entry.last_error_at_ms = Some(now_ms);
                }
            }
        }
    }

    /// Usable backends serving `codec`, best first; falls back to raw
    /// preference order when nothing is currently usable.
    fn ranked(&self, codec: StreamCodec, now_ms: u64) -> Vec<Arc<dyn CaptureBackend>> {
        self.refresh_probes(now_ms);
        let health = lock(&self.health);
        let rank_of = |kind: BackendKind| {
            health
                .get(&kind)
                .map(|e| e.health)
                .unwrap_or(BackendHealth::Untested)
        };

        let mut usable: Vec<Arc<dyn CaptureBackend>> = self
            .backends
            .iter()
            .filter(|b| b.codecs().contains(&codec))
            .filter(|b| rank_of(b.kind()).is_usable())
            .cloned()
            .collect();
        usable.sort_by_key(|b| (rank_of(b.kind()).rank(), b.kind().preference()));
        usable
    }

    // ── Offer negotiation ─────────────────────────────────────────────────────

    /// Builds the offer: every (backend, codec) candidate in fallback order,
    /// with `recommended` pointing at the head.
    pub fn negotiate(&self, low_latency: bool, now_ms: u64) -> StreamOffer {
        self.refresh_probes(now_ms);
        let params = if low_latency {
            self.low_latency_params()
        } else {
            self.default_params()
        };

        let health = lock(&self.health);
        let rank_of = |kind: BackendKind| {
            health
                .get(&kind)
                .map(|e| e.health)
                .unwrap_or(BackendHealth::Untested)
        };

        let mut backends: Vec<&Arc<dyn CaptureBackend>> = self.backends.iter().collect();
        backends.sort_by_key(|b| (rank_of(b.kind()).rank(), b.kind().preference()));

        let candidates: Vec<StreamCandidate> = backends
            .iter()
            .filter(|b| rank_of(b.kind()).is_usable())
            .flat_map(|b| {
                let kind = b.kind();
                b.codecs().iter().map(move |codec| StreamCandidate {
                    backend: kind,
                    codec: *codec,
                    url: format!(
                        "/stream/{}?backend={}&w={}&q={}&fps={}",
                        codec.variant(),
                        kind.as_str(),
                        params.width,
                        params.quality,
                        params.fps
                    ),
                    width: params.width,
                    quality: params.quality,
                    fps: params.fps,
                    first_frame_budget_ms: self.cfg.first_frame_budget_ms,
                })
            })
            .collect();

        StreamOffer {
            recommended: 0,
            candidates,
            fallback_policy: StreamOffer::FALLBACK_ORDERED.to_string(),
            reconnect_hint_ms: self.cfg.reconnect_hint_ms,
        }
    }

    // ── Viewer lifecycle ──────────────────────────────────────────────────────

    /// Opens a viewer for `codec`, preferring `preferred` when it is usable.
    /// The first frame must arrive within the configured budget or the whole
    /// attempt fails.
    pub async fn open_viewer(
        self: &Arc<Self>,
        codec: StreamCodec,
        params: StreamParams,
        preferred: Option<BackendKind>,
    ) -> Result<ViewerSession, StreamError> {
        let attached = self.acquire(codec, params, preferred, None).await?;
        let viewer_id = self.next_viewer_id.fetch_add(1, Ordering::AcqRel);
        lock(&self.viewers).insert(
            viewer_id,
            ViewerStat {
                viewer_id,
                backend: attached.backend,
                frames: 0,
                started_at_ms: now_ms(),
            },
        );
        info!(viewer_id, backend = %attached.backend.as_str(), "viewer attached");
        Ok(ViewerSession {
            orchestrator: Arc::clone(self),
            viewer_id,
            codec,
            params,
            backend: attached.backend,
            rx: attached.rx,
            pending: Some(attached.first),
        })
    }

    /// Walks the fallback order until one backend delivers a first frame
    /// within the remaining budget.
    async fn acquire(
        self: &Arc<Self>,
        codec: StreamCodec,
        params: StreamParams,
        preferred: Option<BackendKind>,
        exclude: Option<BackendKind>,
    ) -> Result<Attached, StreamError> {
        let budget_ms = self.cfg.first_frame_budget_ms;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(budget_ms);

        let mut order = self.ranked(codec, now_ms());
        if let Some(kind) = preferred {
            order.sort_by_key(|b| if b.kind() == kind { 0 } else { 1 });
        }

        for backend in order {
            if Some(backend.kind()) == exclude {
                continue;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            let mut rx = match self.subscribe_or_start(&backend, params) {
                Ok(rx) => rx,
                Err(e) => {
                    self.note_fatal_failure(backend.kind(), &e.to_string());
                    continue;
                }
            };
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(first)) => {
                    self.note_first_frame(backend.kind());
                    return Ok(Attached {
                        backend: backend.kind(),
                        rx,
                        first,
                    });
                }
                Ok(Err(_closed)) => {
                    // Source died before its first frame; pump already
                    // recorded the failure.
                    continue;
                }
                Err(_elapsed) => {
                    self.note_fatal_failure(backend.kind(), "first frame timed out");
                    break;
                }
            }
        }
        warn!(budget_ms, "no backend produced a first frame");
        Err(StreamError::NoBackend { budget_ms })
    }

    /// Joins an existing shared capture or starts a new one.
    fn subscribe_or_start(
        self: &Arc<Self>,
        backend: &Arc<dyn CaptureBackend>,
        params: StreamParams,
    ) -> Result<broadcast::Receiver<Frame>, crate::infrastructure::capture::CaptureError> {
        let key = (backend.kind(), params);
        let mut sources = lock(&self.sources);
        if let Some(shared) = sources.get(&key) {
            return Ok(shared.tx.subscribe());
        }

        let mut source = backend.start(params)?;
        let (tx, rx) = broadcast::channel(FANOUT_DEPTH);
        sources.insert(key, SharedSource { tx: tx.clone() });
        drop(sources);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let clean = loop {
                match source.next_frame().await {
                    Some(frame) => {
                        // Send fails only when no viewer is subscribed.
                        if tx.send(frame).is_err() {
                            break true;
                        }
                    }
                    None => break false,
                }
            };
            this.remove_source(key);
            if clean {
                this.note_clean_stop(key.0);
                debug!(kind = %key.0.as_str(), "capture stopped, no viewers left");
            } else {
                this.note_mid_stream_death(key.0);
            }
        });
        Ok(rx)
    }

    fn remove_source(&self, key: SourceKey) {
        lock(&self.sources).remove(&key);
    }

    fn close_viewer(&self, viewer_id: u64) {
        if lock(&self.viewers).remove(&viewer_id).is_some() {
            debug!(viewer_id, "viewer detached");
        }
    }

    fn note_viewer_frame(&self, viewer_id: u64, backend: BackendKind) {
        if let Some(stat) = lock(&self.viewers).get_mut(&viewer_id) {
            stat.frames += 1;
            stat.backend = backend;
        }
    }

    // ── Health bookkeeping ────────────────────────────────────────────────────

    fn note_first_frame(&self, kind: BackendKind) {
        let mut health = lock(&self.health);
        let entry = health.entry(kind).or_insert_with(HealthEntry::untested);
        if entry.health != BackendHealth::Degraded {
            entry.health = BackendHealth::Ok;
        }
    }

    fn note_clean_stop(&self, kind: BackendKind) {
        let mut health = lock(&self.health);
        let entry = health.entry(kind).or_insert_with(HealthEntry::untested);
        entry.consecutive_errors = 0;
        if entry.health == BackendHealth::Degraded {
            entry.health = BackendHealth::Ok;
        }
    }

    /// A capture died while viewers were attached.  Enough of these in a row
    /// demote the backend below every healthy one.
    fn note_mid_stream_death(&self, kind: BackendKind) {
        let mut health = lock(&self.health);
        let entry = health.entry(kind).or_insert_with(HealthEntry::untested);
        entry.failure_count += 1;
        entry.consecutive_errors += 1;
        entry.last_error = Some("capture died mid-stream".to_string());
        entry.last_error_at_ms = Some(now_ms());
        if entry.consecutive_errors >= self.cfg.backend_degrade_threshold
            && entry.health == BackendHealth::Ok
        {
            warn!(kind = %kind.as_str(), errors = entry.consecutive_errors, "backend demoted to degraded");
            entry.health = BackendHealth::Degraded;
        }
    }

    fn note_fatal_failure(&self, kind: BackendKind, error: &str) {
        let mut health = lock(&self.health);
        let entry = health.entry(kind).or_insert_with(HealthEntry::untested);
        entry.failure_count += 1;
        entry.health = BackendHealth::Failed;
        entry.last_error = Some(error.to_string());
        entry.last_error_at_ms = Some(now_ms());
    }

    // ── Stats ─────────────────────────────────────────────────────────────────

    pub fn stats(&self) -> StreamingStats {
        let health = lock(&self.health);
        let mut backends: Vec<BackendStats> = self
            .backends
            .iter()
            .map(|b| {
                let entry = health
                    .get(&b.kind())
                    .cloned()
                    .unwrap_or_else(HealthEntry::untested);
                BackendStats {
                    kind: b.kind(),
                    health: entry.health,
                    last_checked_ms: entry.last_checked_ms,
                    failure_count: entry.failure_count,
                    consecutive_errors: entry.consecutive_errors,
                    last_error: entry.last_error,
                    last_error_at_ms: entry.last_error_at_ms,
                }
            })
            .collect();
        backends.sort_by_key(|b| b.kind.preference());

        let mut viewers: Vec<ViewerStat> = lock(&self.viewers).values().cloned().collect();
        viewers.sort_by_key(|v| v.viewer_id);

        StreamingStats { backends, viewers }
    }
}

struct Attached {
    backend: BackendKind,
    rx: broadcast::Receiver<Frame>,
    first: Frame,
}

// ── Viewer session ────────────────────────────────────────────────────────────

/// One authorized viewer's handle on the frame flow.  Dropping it releases
/// the viewer's stats entry and, transitively, its shared capture.
pub struct ViewerSession {
    orchestrator: Arc<StreamingOrchestrator>,
    viewer_id: u64,
    codec: StreamCodec,
    params: StreamParams,
    backend: BackendKind,
    rx: broadcast::Receiver<Frame>,
    pending: Option<Frame>,
}

impl ViewerSession {
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn viewer_id(&self) -> u64 {
        self.viewer_id
    }

    /// Next frame in capture order.  On backend death this reattaches down
    /// the fallback order; only when every candidate fails does it error.
    pub async fn next_frame(&mut self) -> Result<Frame, StreamError> {
        if let Some(frame) = self.pending.take() {
            self.orchestrator.note_viewer_frame(self.viewer_id, self.backend);
            return Ok(frame);
        }
        loop {
            match self.rx.recv().await {
                Ok(frame) => {
                    self.orchestrator.note_viewer_frame(self.viewer_id, self.backend);
                    return Ok(frame);
                }
                // Dropped under backpressure, never reordered.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(viewer_id = self.viewer_id, skipped, "viewer lagged, frames dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let failed = self.backend;
                    let attached = self
                        .orchestrator
                        .acquire(self.codec, self.params, None, Some(failed))
                        .await?;
                    info!(
                        viewer_id = self.viewer_id,
                        from = %failed.as_str(),
                        to = %attached.backend.as_str(),
                        "viewer failed over"
                    );
                    self.backend = attached.backend;
                    self.rx = attached.rx;
                    self.pending = Some(attached.first);
                }
            }
        }
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        self.orchestrator.close_viewer(self.viewer_id);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
