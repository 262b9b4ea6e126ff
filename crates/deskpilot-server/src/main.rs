//! DeskPilot server entry point.
//!
//! One process hosts everything a paired phone or tablet talks to: the
//! pairing endpoints, the live-input WebSocket, the screen stream, file
//! transfer, and the loopback management channel for the desktop UI.
//!
//! # Usage
//!
//! ```text
//! deskpilot-server [OPTIONS]
//!
//! Options:
//!   --config    <PATH>  TOML config file [default: deskpilot.toml]
//!   --bind      <IP>    Override the configured bind address
//!   --port      <PORT>  Override the configured port
//!   --files-dir <PATH>  Override the transfer directory
//!   --log-level <LVL>   Override the configured log level
//! ```
//!
//! Environment variables (`DESKPILOT_CONFIG`, `DESKPILOT_BIND`,
//! `DESKPILOT_PORT`, `DESKPILOT_FILES_DIR`, `DESKPILOT_LOG`) provide the
//! same overrides; CLI arguments win when both are present.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use deskpilot_core::{BackendKind, StreamCodec};
use deskpilot_server::application::pairing::PairingGateway;
use deskpilot_server::application::session_store::{
    run_expiry_sweeper, run_snapshot_flusher, SessionStore, SnapshotSink,
};
use deskpilot_server::application::streaming::StreamingOrchestrator;
use deskpilot_server::application::transfer::TransferBroker;
use deskpilot_server::application::now_ms;
use deskpilot_server::domain::config::StreamingSection;
use deskpilot_server::infrastructure::capture::{
    CaptureBackend, PipelineBackend, ScreenshotBackend,
};
use deskpilot_server::infrastructure::inject::{InputInjector, UnavailableInjector, XdotoolInjector};
use deskpilot_server::infrastructure::storage::{load_config, JsonSnapshotSink};
use deskpilot_server::infrastructure::system::SystemActions;
use deskpilot_server::infrastructure::ws_input::PushRegistry;
use deskpilot_server::{build_router, AppState, ServerConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Remote-control server for paired mobile devices.
#[derive(Debug, Parser)]
#[command(
    name = "deskpilot-server",
    about = "Pairing, live input, screen streaming, and file transfer for mobile remote control",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.  A missing file starts the
    /// server with built-in defaults.
    #[arg(long, default_value = "deskpilot.toml", env = "DESKPILOT_CONFIG")]
    config: PathBuf,

    /// IP address to bind, overriding the config file.
    #[arg(long, env = "DESKPILOT_BIND")]
    bind: Option<String>,

    /// TCP port, overriding the config file.
    #[arg(long, env = "DESKPILOT_PORT")]
    port: Option<u16>,

    /// Directory uploads land in and downloads are served from.
    #[arg(long, env = "DESKPILOT_FILES_DIR")]
    files_dir: Option<PathBuf>,

    /// `tracing` log level, overriding the config file.
    #[arg(long, env = "DESKPILOT_LOG")]
    log_level: Option<String>,
}

impl Cli {
    fn apply_overrides(&self, config: &mut ServerConfig) {
        if let Some(bind) = &self.bind {
            config.server.bind_address = bind.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(dir) = &self.files_dir {
            config.transfer.files_dir = dir.clone();
        }
        if let Some(level) = &self.log_level {
            config.server.log_level = level.clone();
        }
    }
}

// ── Wiring ────────────────────────────────────────────────────────────────────

/// Builds the capture backend list from the configured command templates.
/// An empty template disables that backend.
fn build_backends(cfg: &StreamingSection) -> Vec<Arc<dyn CaptureBackend>> {
    let mut backends: Vec<Arc<dyn CaptureBackend>> = Vec::new();
    if !cfg.pipeline_a_command.is_empty() {
        backends.push(Arc::new(PipelineBackend::new(
            BackendKind::PipelineA,
            cfg.pipeline_a_command.clone(),
            vec![StreamCodec::Mjpeg, StreamCodec::H264],
        )));
    }
    if !cfg.pipeline_b_command.is_empty() {
        backends.push(Arc::new(PipelineBackend::new(
            BackendKind::PipelineB,
            cfg.pipeline_b_command.clone(),
            vec![StreamCodec::Mjpeg, StreamCodec::H265],
        )));
    }
    if !cfg.screenshot_command.is_empty() {
        backends.push(Arc::new(ScreenshotBackend::new(
            cfg.screenshot_command.clone(),
        )));
    }
    backends
}

fn build_injector() -> Arc<dyn InputInjector> {
    match XdotoolInjector::new() {
        Ok(injector) => Arc::new(injector),
        Err(e) => {
            warn!(error = %e, "running without an input backend; input events will be dropped");
            Arc::new(UnavailableInjector)
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    cli.apply_overrides(&mut config);

    // RUST_LOG wins over the configured level when set.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.server.log_level.clone())),
        )
        .init();

    let config = Arc::new(config);
    let addr = config.bind_addr().context("invalid bind address")?;

    let store = Arc::new(SessionStore::new(
        config.expiry_rule(),
        config.sessions.max_sessions,
    ));
    let sink: Arc<dyn SnapshotSink> =
        Arc::new(JsonSnapshotSink::new(config.sessions.snapshot_path.clone()));
    let snapshot = sink.load().context("reading session snapshot")?;
    info!(sessions = snapshot.len(), "restoring paired devices");
    store.restore(snapshot, now_ms());

    let gateway = Arc::new(PairingGateway::new(
        Arc::clone(&store),
        config.pin_limits(),
        config.pairing.window_s * 1_000,
        config.pairing.qr_token_ttl_s * 1_000,
        config.default_permission_set(),
    ));
    let orchestrator =
        StreamingOrchestrator::new(config.streaming.clone(), build_backends(&config.streaming));
    let broker = Arc::new(TransferBroker::new(
        Arc::clone(&store),
        config.transfer.clone(),
    ));

    tokio::spawn(run_snapshot_flusher(
        Arc::clone(&store),
        Arc::clone(&sink),
        Duration::from_millis(config.sessions.snapshot_debounce_ms),
    ));
    tokio::spawn(run_expiry_sweeper(
        Arc::clone(&store),
        Duration::from_secs(config.sessions.sweep_interval_s.max(1)),
    ));
    tokio::spawn({
        let broker = Arc::clone(&broker);
        let interval = Duration::from_secs(config.sessions.sweep_interval_s.max(1));
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                broker.sweep_expired_at(now_ms());
            }
        }
    });

    let state = AppState {
        config: Arc::clone(&config),
        store: Arc::clone(&store),
        gateway,
        orchestrator,
        broker,
        injector: build_injector(),
        registry: Arc::new(PushRegistry::new()),
        system: Arc::new(SystemActions::new(config.system.clone())),
    };

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, server_name = %config.server.server_name, "deskpilot server listening");

    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    // Final snapshot so pairings made in the last debounce window survive.
    sink.save(&store.snapshot())
        .context("writing final session snapshot")?;
    info!("deskpilot server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down"),
        Err(e) => warn!(error = %e, "failed to listen for Ctrl+C"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
