//! Paired monotonic and wall clocks.
//!
//! Durations are always measured on the monotonic clock (`perf_ns`, nanoseconds since the clock
//! was created). Wall-clock timestamps for records are derived from a single wall anchor taken at
//! the same moment, so `wall_ns(a) - wall_ns(b) == a - b` exactly and no record can observe the
//! wall clock stepping backwards.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    perf_anchor: Instant,
    wall_anchor_ns: u64,
}

impl Clock {
    pub fn new() -> Self {
        let wall_anchor_ns = chrono::Utc::now()
            .timestamp_nanos_opt()
            .and_then(|ns| u64::try_from(ns).ok())
            .unwrap_or_default();
        Self::with_wall_anchor(wall_anchor_ns)
    }

    /// A clock whose perf zero maps to the given wall-clock nanoseconds.
    pub fn with_wall_anchor(wall_anchor_ns: u64) -> Self {
        Self {
            perf_anchor: Instant::now(),
            wall_anchor_ns,
        }
    }

    /// Monotonic nanoseconds since the clock was created.
    pub fn perf_ns(&self) -> u64 {
        self.perf_ns_at(Instant::now())
    }

    pub fn perf_ns_at(&self, instant: Instant) -> u64 {
        duration_ns(instant.saturating_duration_since(self.perf_anchor))
    }

    /// Wall-clock nanoseconds since the Unix epoch for a perf reading.
    pub fn wall_ns(&self, perf_ns: u64) -> u64 {
        self.wall_anchor_ns.saturating_add(perf_ns)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wall_tracks_perf_exactly() {
        let clock = Clock::with_wall_anchor(1_000_000);
        let before = clock.perf_ns();
        tokio::time::sleep(Duration::from_millis(250)).await;
        let after = clock.perf_ns();

        assert_eq!(after - before, 250_000_000);
        assert_eq!(clock.wall_ns(after) - clock.wall_ns(before), after - before);
        assert_eq!(clock.wall_ns(0), 1_000_000);
    }
}
