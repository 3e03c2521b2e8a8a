//! Session clock.
//!
//! Deadlines are scheduled on tokio's monotonic clock, while payloads carry
//! wall-clock timestamps. Deriving the wall clock from the monotonic one keeps
//! both views consistent, including under tokio's paused test clock.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
    origin_wall: DateTime<Utc>,
}

impl Clock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Clock whose wall time reads `wall` right now.
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            origin: Instant::now(),
            origin_wall: wall,
        }
    }

    pub fn instant(&self) -> Instant {
        Instant::now()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.wall_at(Instant::now())
    }

    /// Wall time corresponding to a monotonic instant.
    pub fn wall_at(&self, at: Instant) -> DateTime<Utc> {
        let elapsed = at.saturating_duration_since(self.origin);
        self.origin_wall
            .checked_add_signed(to_chrono(elapsed))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
