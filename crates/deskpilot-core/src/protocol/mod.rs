//! Wire protocol shared between the server and its clients.
//!
//! Everything here is JSON: the live-input WebSocket speaks the tagged
//! message enums in [`messages`], and stream negotiation returns the payload
//! types in [`offer`].

pub mod messages;
pub mod offer;
