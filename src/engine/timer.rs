//! Stack timer.
//!
//! The timer only runs while the TCP handler has connections (including
//! TIME_WAIT), so an idle engine never wakes up for it.

use std::time::Instant;

#[derive(Debug, Default)]
pub(crate) struct StackTimer {
    deadline: Option<Instant>,
}

impl StackTimer {
    pub(crate) fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }

    pub(crate) fn schedule(&mut self, at: Instant) {
        self.deadline = Some(at);
    }

    pub(crate) fn stop(&mut self) {
        self.deadline = None;
    }
}
