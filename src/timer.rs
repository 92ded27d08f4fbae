//! One-shot deadlines
//!
//! Nothing in this crate blocks. Waiting is expressed by arming a
//! [Deadline] and checking it the next time the owner is polled.

use embassy_time::{Duration, Instant};

/// A one-shot timer that fires once its deadline has passed
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub(crate) struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub const fn new() -> Self {
        Self { at: None }
    }

    /// Arm (or re-arm) the timer to fire `after` from `now`
    pub fn start(&mut self, now: Instant, after: Duration) {
        self.at = Some(now + after);
    }

    pub fn stop(&mut self) {
        self.at = None;
    }

    /// Returns `true` exactly once when the deadline has passed, and
    /// disarms the timer
    pub fn poll_expired(&mut self, now: Instant) -> bool {
        match self.at {
            Some(at) if now >= at => {
                self.at = None;
                true
            }
            _ => false,
        }
    }
}
