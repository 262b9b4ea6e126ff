//! # deskpilot-server
//!
//! The DeskPilot desktop agent.  It runs on the controlled PC and exposes the
//! HTTP/WebSocket surface that paired mobile devices talk to:
//!
//! - **Pairing gateway** – PIN and QR login with per-address rate limiting.
//! - **Session store** – authenticated device sessions with TTL/idle expiry,
//!   per-device permission flags, and debounced JSON persistence.
//! - **Live input** – a WebSocket channel that authorizes and injects pointer
//!   and keyboard events, with heartbeat supervision and a cursor feed.
//! - **Streaming orchestrator** – probes the available capture backends,
//!   negotiates a stream offer, and falls back down the candidate list when a
//!   backend dies mid-stream.
//! - **Transfer broker** – one-time download grants and checksummed uploads.
//!
//! The crate follows a domain / application / infrastructure layering:
//! `domain` holds configuration, `application` holds the services that
//! implement the business rules, and `infrastructure` binds them to axum,
//! the OS input APIs, capture processes, and the filesystem.

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use domain::config::ServerConfig;
pub use infrastructure::http::{build_router, AppState};
