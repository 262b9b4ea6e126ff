//! The axum surface: pairing, input WebSocket upgrade, stream negotiation
//! and delivery, file transfer, system actions, and the loopback-only
//! management channel.
//!
//! Session tokens travel as `Authorization: Bearer <uuid>` or a `?token=`
//! query parameter.  Authentication failures answer with a uniform 401
//! `denied` body regardless of cause; only rate limiting is distinguishable
//! (429 plus `Retry-After`), so a guesser learns nothing about which part
//! of a credential was wrong.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use uuid::Uuid;

use deskpilot_core::protocol::messages::ProtocolInfo;
use deskpilot_core::{
    BackendKind, DeviceSession, Permission, PermissionSet, ServerMessage, SessionId, StreamCodec,
    StreamOffer,
};

use crate::application::now_ms;
use crate::application::pairing::{PairRejection, PairingGateway};
use crate::application::session_store::{GateError, SessionStore};
use crate::application::streaming::{StreamError, StreamingOrchestrator, StreamingStats, ViewerSession};
use crate::application::transfer::{ByteRange, TransferBroker, TransferError};
use crate::domain::config::ServerConfig;
use crate::infrastructure::capture::Frame;
use crate::infrastructure::inject::InputInjector;
use crate::infrastructure::system::{SystemActionError, SystemActions};
use crate::infrastructure::ws_input::{protocol_info, serve_input, InputContext, PushRegistry};

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: Arc<SessionStore>,
    pub gateway: Arc<PairingGateway>,
    pub orchestrator: Arc<StreamingOrchestrator>,
    pub broker: Arc<TransferBroker>,
    pub injector: Arc<dyn InputInjector>,
    pub registry: Arc<PushRegistry>,
    pub system: Arc<SystemActions>,
}

/// Builds the full route table.  Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()`; several handlers
/// need the peer address.
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.transfer.upload_max_bytes as usize + 1024 * 1024;
    Router::new()
        .route("/pair", post(pair))
        .route("/qr/login", post(qr_login))
        .route("/protocol", get(protocol))
        .route("/input", get(input_upgrade))
        .route("/stream/offer", get(stream_offer))
        .route("/stream/{variant}", get(stream_live))
        .route("/stats/backends", get(backend_stats))
        .route("/file/upload", post(upload))
        .route("/file/{token}", get(download))
        .route("/system/{action}", post(system_action))
        .route("/local/info", get(local_info))
        .route("/local/code", get(local_code))
        .route("/local/code/rotate", post(local_rotate_code))
        .route("/local/qr", get(local_qr))
        .route("/local/devices", get(local_devices))
        .route("/local/devices/{id}/permissions", post(local_set_permission))
        .route("/local/devices/{id}", delete(local_revoke))
        .route("/local/send", post(local_send_file))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// HTTP-facing error.  Pairing and authentication failures all collapse to
/// [`ApiError::Denied`] before reaching the wire.
#[derive(Debug)]
pub enum ApiError {
    Denied,
    RateLimited { retry_after_ms: u64 },
    Forbidden(Permission),
    NotFound,
    Gone,
    BadRequest(String),
    RangeNotSatisfiable,
    PayloadTooLarge { max_bytes: u64 },
    UnsupportedMediaType(String),
    UnprocessableChecksum,
    NoStreamBackend,
    ActionFailed(String),
    LoopbackOnly,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Denied => (StatusCode::UNAUTHORIZED, serde_json::json!({"error": "denied"})),
            ApiError::RateLimited { retry_after_ms } => {
                let retry_s = retry_after_ms.div_ceil(1_000).max(1);
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, retry_s.to_string())],
                    Json(serde_json::json!({
                        "error": "rate_limited",
                        "retry_after_ms": retry_after_ms,
                    })),
                )
                    .into_response();
            }
            ApiError::Forbidden(permission) => (
                StatusCode::FORBIDDEN,
                serde_json::json!({"error": "permission_denied", "permission": permission}),
            ),
            ApiError::NotFound => (StatusCode::NOT_FOUND, serde_json::json!({"error": "not_found"})),
            ApiError::Gone => (StatusCode::GONE, serde_json::json!({"error": "expired"})),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({"error": "bad_request", "message": message}),
            ),
            ApiError::RangeNotSatisfiable => (
                StatusCode::RANGE_NOT_SATISFIABLE,
                serde_json::json!({"error": "range_not_satisfiable"}),
            ),
            ApiError::PayloadTooLarge { max_bytes } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                serde_json::json!({"error": "too_large", "max_bytes": max_bytes}),
            ),
            ApiError::UnsupportedMediaType(ext) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                serde_json::json!({"error": "extension_not_allowed", "extension": ext}),
            ),
            ApiError::UnprocessableChecksum => (
                StatusCode::UNPROCESSABLE_ENTITY,
                serde_json::json!({"error": "checksum_mismatch"}),
            ),
            ApiError::NoStreamBackend => (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({"error": "no_stream_backend"}),
            ),
            ApiError::ActionFailed(action) => (
                StatusCode::BAD_GATEWAY,
                serde_json::json!({"error": "action_failed", "action": action}),
            ),
            ApiError::LoopbackOnly => (
                StatusCode::FORBIDDEN,
                serde_json::json!({"error": "loopback_only"}),
            ),
            ApiError::Internal(message) => {
                error!(message, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({"error": "internal"}),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

impl From<GateError> for ApiError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::PermissionDenied(p) => ApiError::Forbidden(p),
            GateError::Unauthenticated | GateError::Expired => ApiError::Denied,
        }
    }
}

impl From<PairRejection> for ApiError {
    fn from(e: PairRejection) -> Self {
        match e {
            PairRejection::RateLimited { retry_after_ms } => {
                ApiError::RateLimited { retry_after_ms }
            }
            // Wrong code, stale window, and spent token are indistinguishable
            // on the wire.
            PairRejection::BadPin
            | PairRejection::ExpiredWindow
            | PairRejection::AlreadyConsumed => ApiError::Denied,
        }
    }
}

impl From<TransferError> for ApiError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::NotFound => ApiError::NotFound,
            TransferError::Expired => ApiError::Gone,
            TransferError::AddressMismatch => ApiError::Denied,
            TransferError::RangeNotSatisfiable => ApiError::RangeNotSatisfiable,
            TransferError::TooLarge { max_bytes } => ApiError::PayloadTooLarge { max_bytes },
            TransferError::ExtensionNotAllowed(ext) => ApiError::UnsupportedMediaType(ext),
            TransferError::ChecksumMismatch => ApiError::UnprocessableChecksum,
            TransferError::Gate(e) => e.into(),
            TransferError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<StreamError> for ApiError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::NoBackend { .. } => ApiError::NoStreamBackend,
        }
    }
}

impl From<SystemActionError> for ApiError {
    fn from(e: SystemActionError) -> Self {
        match e {
            SystemActionError::UnknownAction(_) => ApiError::NotFound,
            SystemActionError::AllCandidatesFailed { action } => ApiError::ActionFailed(action),
        }
    }
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    ApiError::Internal(e.to_string())
}

// ── Token extraction ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Resolves the session token from the `Authorization` header or the
/// `?token=` query parameter, in that order.
fn require_token(headers: &HeaderMap, query: Option<&str>) -> Result<SessionId, ApiError> {
    let raw = bearer_token(headers).or(query).ok_or(ApiError::Denied)?;
    Uuid::parse_str(raw.trim()).map_err(|_| ApiError::Denied)
}

fn require_loopback(addr: SocketAddr) -> Result<(), ApiError> {
    if addr.ip().is_loopback() {
        Ok(())
    } else {
        warn!(%addr, "management request from non-loopback address");
        Err(ApiError::LoopbackOnly)
    }
}

fn parse_codec(variant: &str) -> Option<StreamCodec> {
    match variant {
        "mjpeg" => Some(StreamCodec::Mjpeg),
        "h264_ts" => Some(StreamCodec::H264),
        "h265_ts" => Some(StreamCodec::H265),
        _ => None,
    }
}

fn parse_backend(name: &str) -> Option<BackendKind> {
    BackendKind::ALL.iter().copied().find(|k| k.as_str() == name)
}

// ── Pairing ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PairRequest {
    #[serde(alias = "code")]
    pin: String,
    device_id: String,
    #[serde(default)]
    device_label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QrLoginRequest {
    #[serde(alias = "nonce")]
    qr_token: String,
    device_id: String,
    #[serde(default)]
    device_label: Option<String>,
}

#[derive(Debug, Serialize)]
struct PairResponse {
    token: SessionId,
    device_id: String,
    permissions: PermissionSet,
    server_name: String,
    protocol: ProtocolInfo,
}

fn pair_response(session: DeviceSession, config: &ServerConfig) -> Json<PairResponse> {
    Json(PairResponse {
        token: session.session_id,
        device_id: session.device_id,
        permissions: session.permissions,
        server_name: config.server.server_name.clone(),
        protocol: protocol_info(),
    })
}

async fn pair(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<PairRequest>,
) -> Result<Json<PairResponse>, ApiError> {
    let label = req.device_label.as_deref().unwrap_or(&req.device_id);
    let session =
        state
            .gateway
            .pair_with_pin_at(addr.ip(), &req.pin, &req.device_id, label, now_ms())?;
    Ok(pair_response(session, &state.config))
}

async fn qr_login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<QrLoginRequest>,
) -> Result<Json<PairResponse>, ApiError> {
    let label = req.device_label.as_deref().unwrap_or(&req.device_id);
    let session = state.gateway.pair_with_qr_at(
        Some(addr.ip()),
        &req.qr_token,
        &req.device_id,
        label,
        now_ms(),
    )?;
    Ok(pair_response(session, &state.config))
}

#[derive(Debug, Serialize)]
struct ProtocolResponse {
    server_name: String,
    #[serde(flatten)]
    protocol: ProtocolInfo,
}

async fn protocol(State(state): State<AppState>) -> Json<ProtocolResponse> {
    Json(ProtocolResponse {
        server_name: state.config.server.server_name.clone(),
        protocol: protocol_info(),
    })
}

// ── Input channel ─────────────────────────────────────────────────────────────

async fn input_upgrade(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(q): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    let token = require_token(&headers, q.token.as_deref())?;
    // Unknown sessions are rejected before the upgrade; capability checks
    // stay per event inside the connection.
    state.store.resolve(token)?;

    let ctx = InputContext {
        store: Arc::clone(&state.store),
        injector: Arc::clone(&state.injector),
        registry: Arc::clone(&state.registry),
        cfg: state.config.input.clone(),
        token,
    };
    Ok(ws.on_upgrade(move |socket| serve_input(socket, ctx)))
}

// ── Streaming ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
struct OfferQuery {
    token: Option<String>,
    #[serde(default)]
    low_latency: Option<String>,
}

fn flag_set(value: Option<&str>) -> bool {
    matches!(value, Some("1") | Some("true") | Some("yes"))
}

async fn stream_offer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<OfferQuery>,
) -> Result<Json<StreamOffer>, ApiError> {
    let token = require_token(&headers, q.token.as_deref())?;
    state.store.validate(token, Permission::Stream)?;
    let offer = state
        .orchestrator
        .negotiate(flag_set(q.low_latency.as_deref()), now_ms());
    Ok(Json(offer))
}

#[derive(Debug, Deserialize, Default)]
struct StreamQuery {
    token: Option<String>,
    backend: Option<String>,
    w: Option<u32>,
    q: Option<u8>,
    fps: Option<u32>,
}

fn mjpeg_part(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.data.len() + 64);
    out.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: ");
    out.extend_from_slice(frame.data.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n\r\n");
    out.extend_from_slice(&frame.data);
    out.extend_from_slice(b"\r\n");
    out
}

fn stream_body(viewer: ViewerSession, codec: StreamCodec) -> Body {
    let stream = futures_util::stream::unfold(viewer, move |mut viewer| async move {
        match viewer.next_frame().await {
            Ok(frame) => {
                let bytes = match codec {
                    StreamCodec::Mjpeg => mjpeg_part(&frame),
                    StreamCodec::H264 | StreamCodec::H265 => frame.data.to_vec(),
                };
                Some((Ok::<_, std::io::Error>(bytes), viewer))
            }
            Err(_) => None,
        }
    });
    Body::from_stream(stream)
}

async fn stream_live(
    State(state): State<AppState>,
    Path(variant): Path<String>,
    headers: HeaderMap,
    Query(q): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    let token = require_token(&headers, q.token.as_deref())?;
    state.store.validate(token, Permission::Stream)?;

    let codec = parse_codec(&variant)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown stream variant '{variant}'")))?;
    let preferred = match &q.backend {
        Some(name) => Some(
            parse_backend(name)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown backend '{name}'")))?,
        ),
        None => None,
    };
    let params = state.orchestrator.clamp_params(q.w, q.q, q.fps);

    let viewer = state
        .orchestrator
        .open_viewer(codec, params, preferred)
        .await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, codec.mime())
        .header(header::CACHE_CONTROL, "no-store")
        .body(stream_body(viewer, codec))
        .map_err(internal)
}

async fn backend_stats(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(q): Query<TokenQuery>,
) -> Result<Json<StreamingStats>, ApiError> {
    // Paired devices and the local UI may both read stats.
    if require_loopback(addr).is_err() {
        let token = require_token(&headers, q.token.as_deref())?;
        state.store.resolve(token)?;
    }
    Ok(Json(state.orchestrator.stats()))
}

// ── File transfer ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct UploadResponse {
    filename: String,
    size: u64,
    sha256: String,
}

async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<TokenQuery>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let token = require_token(&headers, q.token.as_deref())?;
    let declared = headers
        .get("x-file-sha256")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;

        let broker = Arc::clone(&state.broker);
        let declared = declared.clone();
        let stored = tokio::task::spawn_blocking(move || {
            broker.save_upload(token, &filename, &bytes, declared.as_deref())
        })
        .await
        .map_err(internal)??;

        return Ok(Json(UploadResponse {
            filename: stored.filename,
            size: stored.size,
            sha256: stored.sha256,
        }));
    }

    Err(ApiError::BadRequest("no file field in upload".to_string()))
}

async fn download(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(ByteRange::parse);

    let consumed = state.broker.consume(&token, Some(addr.ip()), range)?;

    let mut file = tokio::fs::File::open(&consumed.file_path)
        .await
        .map_err(internal)?;
    file.seek(std::io::SeekFrom::Start(consumed.offset))
        .await
        .map_err(internal)?;

    let status = if consumed.is_partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, consumed.length)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::ETAG, format!("\"{}\"", consumed.sha256))
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", consumed.filename),
        );
    if consumed.is_partial {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!(
                "bytes {}-{}/{}",
                consumed.offset,
                consumed.offset + consumed.length - 1,
                consumed.total_size
            ),
        );
    }

    builder.body(file_body(file, consumed.length)).map_err(internal)
}

/// Streams `length` bytes from an already-positioned file, 64 KiB at a time.
fn file_body(file: tokio::fs::File, length: u64) -> Body {
    let stream = futures_util::stream::unfold((file, length), |(mut file, remaining)| async move {
        if remaining == 0 {
            return None;
        }
        let cap = remaining.min(64 * 1024) as usize;
        let mut buf = vec![0u8; cap];
        match file.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok::<_, std::io::Error>(buf), (file, remaining - n as u64)))
            }
            Err(e) => Some((Err(e), (file, 0))),
        }
    });
    Body::from_stream(stream)
}

// ── System actions ────────────────────────────────────────────────────────────

async fn system_action(
    State(state): State<AppState>,
    Path(action): Path<String>,
    headers: HeaderMap,
    Query(q): Query<TokenQuery>,
) -> Result<StatusCode, ApiError> {
    let token = require_token(&headers, q.token.as_deref())?;
    state.store.validate(token, Permission::Power)?;
    state.system.run(&action).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Local management channel ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct LocalInfo {
    server_name: String,
    version: String,
    active_devices: usize,
    actions: Vec<String>,
}

async fn local_info(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<LocalInfo>, ApiError> {
    require_loopback(addr)?;
    Ok(Json(LocalInfo {
        server_name: state.config.server.server_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_devices: state.store.list_active().len(),
        actions: state.system.available().iter().map(|s| s.to_string()).collect(),
    }))
}

#[derive(Debug, Serialize)]
struct CodeResponse {
    code: String,
    expires_at_ms: u64,
}

async fn local_code(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<CodeResponse>, ApiError> {
    require_loopback(addr)?;
    let (code, expires_at_ms) = state.gateway.current_code_at(now_ms());
    Ok(Json(CodeResponse {
        code,
        expires_at_ms,
    }))
}

async fn local_rotate_code(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<CodeResponse>, ApiError> {
    require_loopback(addr)?;
    let code = state.gateway.rotate_code();
    let (_, expires_at_ms) = state.gateway.current_code_at(now_ms());
    Ok(Json(CodeResponse {
        code,
        expires_at_ms,
    }))
}

#[derive(Debug, Serialize)]
struct QrPayload {
    qr_token: String,
    login_path: String,
    server_name: String,
}

async fn local_qr(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<QrPayload>, ApiError> {
    require_loopback(addr)?;
    Ok(Json(QrPayload {
        qr_token: state.gateway.issue_qr_token_at(now_ms()),
        login_path: "/qr/login".to_string(),
        server_name: state.config.server.server_name.clone(),
    }))
}

async fn local_devices(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<Vec<DeviceSession>>, ApiError> {
    require_loopback(addr)?;
    Ok(Json(state.store.list_active()))
}

#[derive(Debug, Deserialize)]
struct PermissionUpdate {
    permission: Permission,
    granted: bool,
}

async fn local_set_permission(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<Uuid>,
    Json(update): Json<PermissionUpdate>,
) -> Result<StatusCode, ApiError> {
    require_loopback(addr)?;
    state
        .store
        .set_permission(id, update.permission, update.granted)
        .map_err(|_| ApiError::NotFound)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn local_revoke(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    require_loopback(addr)?;
    if state.store.revoke(id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

#[derive(Debug, Deserialize)]
struct SendFileRequest {
    session_id: Uuid,
    path: PathBuf,
}

#[derive(Debug, Serialize)]
struct SendFileResponse {
    transfer_id: String,
    url: String,
    filename: String,
    size: u64,
    sha256: String,
    expires_at_ms: u64,
    /// Whether the offer was pushed to a live input connection.
    pushed: bool,
}

async fn local_send_file(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<SendFileRequest>,
) -> Result<Json<SendFileResponse>, ApiError> {
    require_loopback(addr)?;

    let broker = Arc::clone(&state.broker);
    let grant = tokio::task::spawn_blocking(move || broker.grant(req.session_id, &req.path))
        .await
        .map_err(internal)??;

    let pushed = state.registry.push(
        req.session_id,
        ServerMessage::FileTransfer {
            transfer_id: grant.url_token.clone(),
            filename: grant.filename.clone(),
            url: grant.url.clone(),
            size: grant.size,
            sha256: grant.sha256.clone(),
            accept_ranges: true,
            expires_at_ms: grant.expires_at_ms,
        },
    );

    Ok(Json(SendFileResponse {
        transfer_id: grant.url_token,
        url: grant.url,
        filename: grant.filename,
        size: grant.size,
        sha256: grant.sha256,
        expires_at_ms: grant.expires_at_ms,
        pushed,
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
