//! In-memory session buffer

use std::time::{Duration, Instant};

/// Decoded fragments accumulated since the last flush.
#[derive(Debug)]
pub struct SessionBuffer {
    fragments: Vec<String>,
    last_activity: Instant,
}

impl SessionBuffer {
    pub fn new(now: Instant) -> Self {
        Self {
            fragments: Vec::new(),
            last_activity: now,
        }
    }

    /// Append a decoded fragment and mark the session active at `now`.
    pub fn push(&mut self, fragment: String, now: Instant) {
        self.fragments.push(fragment);
        self.last_activity = now;
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Time since the last decoded fragment (or the last clear).
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Fragments joined in arrival order, without separators.
    pub fn contents(&self) -> String {
        self.fragments.concat()
    }

    /// Drop all fragments after a successful flush.
    pub fn clear(&mut self, now: Instant) {
        self.fragments.clear();
        self.last_activity = now;
    }
}
