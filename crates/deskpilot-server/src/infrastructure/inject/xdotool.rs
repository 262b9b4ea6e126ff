//! `xdotool`-backed injector for X11 desktops.

use std::process::Command;

use tracing::debug;

use deskpilot_core::protocol::messages::{ButtonAction, KeyAction, PointerButton};

use crate::infrastructure::capture::program_on_path;
use crate::infrastructure::inject::{InjectError, InputInjector};

pub struct XdotoolInjector {
    program: String,
}

impl XdotoolInjector {
    /// Fails when `xdotool` is not on PATH, so callers can fall back to a
    /// degraded mode instead of erroring on every event.
    pub fn new() -> Result<Self, InjectError> {
        let program = "xdotool".to_string();
        if !program_on_path(&program) {
            return Err(InjectError::Unavailable(
                "xdotool not found on PATH".to_string(),
            ));
        }
        Ok(XdotoolInjector { program })
    }

    fn run(&self, args: &[&str]) -> Result<(), InjectError> {
        let status = Command::new(&self.program).args(args).status()?;
        if !status.success() {
            debug!(?args, ?status, "xdotool invocation failed");
            return Err(InjectError::Unavailable(format!(
                "xdotool exited with {status}"
            )));
        }
        Ok(())
    }
}

fn button_number(button: PointerButton) -> &'static str {
    match button {
        PointerButton::Left => "1",
        PointerButton::Middle => "2",
        PointerButton::Right => "3",
    }
}

impl InputInjector for XdotoolInjector {
    fn pointer_move(&self, x: i32, y: i32) -> Result<(), InjectError> {
        self.run(&["mousemove", &x.to_string(), &y.to_string()])
    }

    fn button(
        &self,
        button: PointerButton,
        action: ButtonAction,
        x: i32,
        y: i32,
    ) -> Result<(), InjectError> {
        self.pointer_move(x, y)?;
        let n = button_number(button);
        match action {
            ButtonAction::Press => self.run(&["mousedown", n]),
            ButtonAction::Release => self.run(&["mouseup", n]),
            ButtonAction::Click => self.run(&["click", n]),
            ButtonAction::DoubleClick => self.run(&["click", "--repeat", "2", n]),
        }
    }

    fn scroll(&self, dx: i32, dy: i32) -> Result<(), InjectError> {
        // Wheel detents map to X11 buttons 4/5 (vertical) and 6/7 (horizontal).
        if dy != 0 {
            let n = if dy > 0 { "4" } else { "5" };
            self.run(&["click", "--repeat", &dy.unsigned_abs().to_string(), n])?;
        }
        if dx != 0 {
            let n = if dx > 0 { "7" } else { "6" };
            self.run(&["click", "--repeat", &dx.unsigned_abs().to_string(), n])?;
        }
        Ok(())
    }

    fn key(&self, key: &str, action: KeyAction) -> Result<(), InjectError> {
        match action {
            KeyAction::Down => self.run(&["keydown", "--", key]),
            KeyAction::Up => self.run(&["keyup", "--", key]),
            KeyAction::Tap => self.run(&["key", "--", key]),
        }
    }

    fn text(&self, text: &str) -> Result<(), InjectError> {
        self.run(&["type", "--delay", "0", "--", text])
    }
}
