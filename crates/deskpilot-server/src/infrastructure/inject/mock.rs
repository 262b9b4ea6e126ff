//! Recording injector for tests.
//!
//! The real injector drives the host desktop, which a test machine rarely
//! has and a test can never observe.  `MockInjector` records every call in
//! order so assertions can check exactly what would have been injected.
//! Flip `should_fail` to exercise the callers' error paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use deskpilot_core::protocol::messages::{ButtonAction, KeyAction, PointerButton};

use crate::infrastructure::inject::{InjectError, InputInjector};

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedEvent {
    PointerMove { x: i32, y: i32 },
    Button { button: PointerButton, action: ButtonAction, x: i32, y: i32 },
    Scroll { dx: i32, dy: i32 },
    Key { key: String, action: KeyAction },
    Text(String),
}

#[derive(Default)]
pub struct MockInjector {
    events: Mutex<Vec<RecordedEvent>>,
    should_fail: AtomicBool,
}

impl MockInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of everything recorded so far, in injection order.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.guard().clone()
    }

    pub fn event_count(&self) -> usize {
        self.guard().len()
    }

    fn guard(&self) -> MutexGuard<'_, Vec<RecordedEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, event: RecordedEvent) -> Result<(), InjectError> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(InjectError::Unavailable("mock failure".to_string()));
        }
        self.guard().push(event);
        Ok(())
    }
}

impl InputInjector for MockInjector {
    fn pointer_move(&self, x: i32, y: i32) -> Result<(), InjectError> {
        self.record(RecordedEvent::PointerMove { x, y })
    }

    fn button(
        &self,
        button: PointerButton,
        action: ButtonAction,
        x: i32,
        y: i32,
    ) -> Result<(), InjectError> {
        self.record(RecordedEvent::Button { button, action, x, y })
    }

    fn scroll(&self, dx: i32, dy: i32) -> Result<(), InjectError> {
        self.record(RecordedEvent::Scroll { dx, dy })
    }

    fn key(&self, key: &str, action: KeyAction) -> Result<(), InjectError> {
        self.record(RecordedEvent::Key {
            key: key.to_string(),
            action,
        })
    }

    fn text(&self, text: &str) -> Result<(), InjectError> {
        self.record(RecordedEvent::Text(text.to_string()))
    }
}
