//! Reset button hold detection

use std::time::{Duration, Instant};

pub const RESET_HOLD: Duration = Duration::from_secs(5);

/// Fires once when the button has been held for `hold`; releasing re-arms it
#[derive(Debug, Clone)]
pub struct ResetButton {
    hold: Duration,
    pressed_since: Option<Instant>,
    fired: bool,
}

impl ResetButton {
    pub fn new(hold: Duration) -> Self {
        Self { hold, pressed_since: None, fired: false }
    }

    /// Feed the current level; true on the tick the hold completes
    pub fn update(&mut self, pressed: bool, now: Instant) -> bool {
        if !pressed {
            self.pressed_since = None;
            self.fired = false;
            return false;
        }
        let since = *self.pressed_since.get_or_insert(now);
        if !self.fired && now.duration_since(since) >= self.hold {
            self.fired = true;
            return true;
        }
        false
    }
}

impl Default for ResetButton {
    fn default() -> Self {
        Self::new(RESET_HOLD)
    }
}
