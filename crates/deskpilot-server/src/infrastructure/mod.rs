//! Infrastructure layer: axum handlers, the input WebSocket task, capture
//! backends, OS seams, and filesystem persistence.

pub mod capture;
pub mod http;
pub mod inject;
pub mod storage;
pub mod system;
pub mod ws_input;
