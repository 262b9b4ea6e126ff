//! Pointer conditioning and the per-session virtual cursor.
//!
//! Raw pointer deltas from a touch device are noisy: fractional values that
//! would truncate to zero on slow drags, jitter around rest, and huge spikes
//! when the network hiccups and several samples arrive at once.  Before any
//! delta reaches the injection collaborator it passes through
//! [`PointerFilter::condition`]:
//!
//! 1. multiply by the configured gain,
//! 2. add the fractional remainder carried from the previous tick,
//! 3. suppress movement below the deadzone,
//! 4. clamp each axis to the per-tick maximum,
//! 5. round to whole pixels and carry the new remainder.
//!
//! The [`VirtualCursor`] mirrors where the pointer should be on a logical
//! canvas so clients can render an overlay even when the host cannot report
//! the real hardware cursor position.

/// Tunable conditioning parameters; see the server configuration for defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerFilter {
    /// Multiplier applied to every raw delta.
    pub gain: f64,
    /// Per-tick, per-axis clamp in pixels.  Caps lag-spike bursts.
    pub max_step: i32,
    /// Magnitudes below this (after gain) are treated as jitter and dropped.
    pub deadzone: f64,
}

impl Default for PointerFilter {
    fn default() -> Self {
        PointerFilter {
            gain: 1.0,
            max_step: 200,
            deadzone: 0.05,
        }
    }
}

/// Per-connection carry state for [`PointerFilter::condition`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PointerState {
    rem_x: f64,
    rem_y: f64,
}

impl PointerFilter {
    /// Conditions one raw delta into whole-pixel movement.
    ///
    /// Returns `(0, 0)` when the motion is inside the deadzone; the remainder
    /// is still carried so a sequence of tiny drags eventually moves.
    pub fn condition(&self, state: &mut PointerState, dx: f64, dy: f64) -> (i32, i32) {
        let gx = dx * self.gain + state.rem_x;
        let gy = dy * self.gain + state.rem_y;

        if (gx * gx + gy * gy).sqrt() < self.deadzone {
            state.rem_x = gx;
            state.rem_y = gy;
            return (0, 0);
        }

        let max = self.max_step.max(1) as f64;
        let cx = gx.clamp(-max, max);
        let cy = gy.clamp(-max, max);

        let mx = cx.round();
        let my = cy.round();
        state.rem_x = cx - mx;
        state.rem_y = cy - my;
        (mx as i32, my as i32)
    }
}

/// Logical cursor position clamped to a `w × h` canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualCursor {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl VirtualCursor {
    /// Starts centered on the canvas.
    pub fn centered(width: i32, height: i32) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        VirtualCursor {
            x: width / 2,
            y: height / 2,
            width,
            height,
        }
    }

    /// Moves by a conditioned delta, clamping to the canvas bounds.
    pub fn move_by(&mut self, dx: i32, dy: i32) {
        self.x = (self.x + dx).clamp(0, self.width - 1);
        self.y = (self.y + dy).clamp(0, self.height - 1);
    }

    /// Repositions onto a new canvas, preserving the relative location.
    pub fn resize(&mut self, width: i32, height: i32) {
        let width = width.max(1);
        let height = height.max(1);
        self.x = ((self.x as i64 * width as i64) / self.width.max(1) as i64) as i32;
        self.y = ((self.y as i64 * height as i64) / self.height.max(1) as i64) as i32;
        self.width = width;
        self.height = height;
        self.move_by(0, 0);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_gain_passes_whole_deltas_through() {
        let filter = PointerFilter::default();
        let mut state = PointerState::default();
        assert_eq!(filter.condition(&mut state, 10.0, -4.0), (10, -4));
    }

    #[test]
    fn test_gain_scales_deltas() {
        let filter = PointerFilter {
            gain: 2.0,
            ..PointerFilter::default()
        };
        let mut state = PointerState::default();
        assert_eq!(filter.condition(&mut state, 3.0, 1.0), (6, 2));
    }

    #[test]
    fn test_fractional_remainder_accumulates_across_ticks() {
        // Four drags of 0.3px must move 1px total, not 0.
        let filter = PointerFilter {
            deadzone: 0.0,
            ..PointerFilter::default()
        };
        let mut state = PointerState::default();
        let mut moved = 0;
        for _ in 0..4 {
            let (mx, _) = filter.condition(&mut state, 0.3, 0.0);
            moved += mx;
        }
        assert_eq!(moved, 1);
    }

    #[test]
    fn test_deadzone_suppresses_jitter_but_keeps_remainder() {
        let filter = PointerFilter {
            deadzone: 0.5,
            ..PointerFilter::default()
        };
        let mut state = PointerState::default();
        assert_eq!(filter.condition(&mut state, 0.2, 0.0), (0, 0));
        // The suppressed motion still counts toward the next tick.
        assert_eq!(filter.condition(&mut state, 0.4, 0.0), (1, 0));
    }

    #[test]
    fn test_max_step_clamps_spikes_per_axis() {
        let filter = PointerFilter {
            max_step: 50,
            ..PointerFilter::default()
        };
        let mut state = PointerState::default();
        assert_eq!(filter.condition(&mut state, 5_000.0, -5_000.0), (50, -50));
    }

    #[test]
    fn test_virtual_cursor_starts_centered() {
        let cursor = VirtualCursor::centered(1920, 1080);
        assert_eq!((cursor.x, cursor.y), (960, 540));
    }

    #[test]
    fn test_virtual_cursor_clamps_to_canvas() {
        let mut cursor = VirtualCursor::centered(100, 100);
        cursor.move_by(10_000, -10_000);
        assert_eq!((cursor.x, cursor.y), (99, 0));
    }

    #[test]
    fn test_virtual_cursor_resize_preserves_relative_position() {
        let mut cursor = VirtualCursor::centered(1000, 1000);
        cursor.resize(500, 2000);
        assert_eq!((cursor.x, cursor.y), (250, 1000));
        assert_eq!((cursor.width, cursor.height), (500, 2000));
    }

    #[test]
    fn test_degenerate_canvas_is_normalized() {
        let cursor = VirtualCursor::centered(0, -5);
        assert_eq!((cursor.width, cursor.height), (1, 1));
        assert_eq!((cursor.x, cursor.y), (0, 0));
    }
}
