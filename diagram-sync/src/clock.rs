//! Client-local version counter attached to outgoing changes.

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds, forced strictly increasing.
///
/// Peers use the value as a tiebreaker between changes; within one client
/// two changes never share a version even inside the same millisecond or
/// across a backwards clock step.
#[derive(Debug, Default)]
pub struct VersionClock {
    last: u64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&mut self) -> u64 {
        self.tick_at(now_millis())
    }

    fn tick_at(&mut self, now: u64) -> u64 {
        self.last = now.max(self.last + 1);
        self.last
    }

    pub fn last(&self) -> u64 {
        self.last
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
