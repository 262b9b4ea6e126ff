//! Input injection into the host desktop.
//!
//! The WebSocket layer dispatches authorized events to an [`InputInjector`]
//! trait object.  `XdotoolInjector` shells out to the `xdotool` utility;
//! `MockInjector` records calls in memory for tests.

pub mod mock;
pub mod xdotool;

pub use mock::MockInjector;
pub use xdotool::XdotoolInjector;

use thiserror::Error;

use deskpilot_core::protocol::messages::{ButtonAction, KeyAction, PointerButton};

#[derive(Debug, Error)]
pub enum InjectError {
    /// No usable injection backend on this host.
    #[error("input backend unavailable: {0}")]
    Unavailable(String),
    #[error("input injection failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Injects decoded input events into the host desktop.
///
/// Implementations must tolerate being called from multiple connection tasks
/// at once; event ordering within one connection is the caller's concern.
pub trait InputInjector: Send + Sync {
    /// Moves the cursor to an absolute pixel position.
    fn pointer_move(&self, x: i32, y: i32) -> Result<(), InjectError>;

    /// Presses, releases, or clicks a pointer button at the given position.
    fn button(
        &self,
        button: PointerButton,
        action: ButtonAction,
        x: i32,
        y: i32,
    ) -> Result<(), InjectError>;

    /// Scrolls by whole wheel detents.
    fn scroll(&self, dx: i32, dy: i32) -> Result<(), InjectError>;

    /// Presses, releases, or taps a named key.
    fn key(&self, key: &str, action: KeyAction) -> Result<(), InjectError>;

    /// Types a text string as a sequence of key events.
    fn text(&self, text: &str) -> Result<(), InjectError>;
}

/// Degraded-mode injector used when no real backend is available.  Every
/// call errors, which the connection layer surfaces as dropped events with
/// a diagnostic, instead of refusing input connections outright.
pub struct UnavailableInjector;

impl UnavailableInjector {
    fn err(&self) -> Result<(), InjectError> {
        Err(InjectError::Unavailable(
            "no input backend on this host".to_string(),
        ))
    }
}

impl InputInjector for UnavailableInjector {
    fn pointer_move(&self, _x: i32, _y: i32) -> Result<(), InjectError> {
        self.err()
    }

    fn button(
        &self,
        _button: PointerButton,
        _action: ButtonAction,
        _x: i32,
        _y: i32,
    ) -> Result<(), InjectError> {
        self.err()
    }

    fn scroll(&self, _dx: i32, _dy: i32) -> Result<(), InjectError> {
        self.err()
    }

    fn key(&self, _key: &str, _action: KeyAction) -> Result<(), InjectError> {
        self.err()
    }

    fn text(&self, _text: &str) -> Result<(), InjectError> {
        self.err()
    }
}
