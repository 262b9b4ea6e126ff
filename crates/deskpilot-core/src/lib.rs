//! # deskpilot-core
//!
//! Shared library for DeskPilot containing the wire protocol types, the
//! permission model, session expiry rules, pairing rate-limit state machines,
//! and pointer-conditioning math.
//!
//! This crate is used by the server and any future native clients.  It has
//! zero dependencies on OS APIs, network sockets, or the async runtime: every
//! time-dependent rule takes the current time as a parameter so it can be
//! tested deterministically.
//!
//! - **`domain`** – Pure business logic: per-device permission flags, the
//!   device-session record with absolute/idle TTL rules, the per-address PIN
//!   limiter and one-time QR token store, and the virtual-cursor /
//!   pointer-delta conditioning used by the live-input channel.
//!
//! - **`protocol`** – The JSON messages exchanged over the input WebSocket
//!   (hello/heartbeat/input events/diagnostics) and the stream-offer payload
//!   the server returns from codec negotiation.

pub mod domain;
pub mod protocol;

pub use domain::cursor::{PointerFilter, PointerState, VirtualCursor};
pub use domain::pairing::{PinCheck, PinLimiter, QrTokenStore};
pub use domain::permissions::{Permission, PermissionSet};
pub use domain::session::{DeviceSession, ExpiryRule, SessionId};
pub use protocol::messages::{
    ClientMessage, ProtocolInfo, ServerMessage, MIN_SUPPORTED_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
pub use protocol::offer::{
    BackendHealth, BackendKind, StreamCandidate, StreamCodec, StreamOffer,
};
