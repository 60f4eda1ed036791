//! Adaptive-backoff polling, the always-authoritative fallback path behind
//! the notification bus.

use std::time::Duration;

/// Polling cadence: starts at `min`, doubles (by default) on every empty
/// poll, caps at `max`, and resets to `min` the moment an update is observed.
#[derive(Debug, Clone, Copy)]
pub struct PollBackoff {
    pub min: Duration,
    pub max: Duration,
    pub factor: f64,
    current: Duration,
}

impl PollBackoff {
    pub fn new(min: Duration, max: Duration, factor: f64) -> Self {
        Self {
            min,
            max,
            factor,
            current: min,
        }
    }

    /// Default cadence per the notification bus spec: 100ms -> 5s, doubling.
    pub fn default_cadence() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5), 2.0)
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Call after an empty poll (no update observed); returns the interval to
    /// sleep for before the next poll.
    pub fn backoff(&mut self) -> Duration {
        let next_secs = (self.current.as_secs_f64() * self.factor).min(self.max.as_secs_f64());
        self.current = Duration::from_secs_f64(next_secs);
        self.current
    }

    /// Call after observing an update; resets the cadence back to `min`.
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self::default_cadence()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = PollBackoff::new(Duration::from_millis(100), Duration::from_millis(500), 2.0);
        assert_eq!(b.current(), Duration::from_millis(100));
        assert_eq!(b.backoff(), Duration::from_millis(200));
        assert_eq!(b.backoff(), Duration::from_millis(400));
        assert_eq!(b.backoff(), Duration::from_millis(500)); // capped
        assert_eq!(b.backoff(), Duration::from_millis(500));
        b.reset();
        assert_eq!(b.current(), Duration::from_millis(100));
    }
}
