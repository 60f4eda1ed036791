//! Retry policy: next-attempt delay and terminal/retryable error classification.

use crate::error::SenpukiError;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;

/// Classifies an error raised by a durable function body and computes how
/// long to wait before the next attempt.
///
/// `next_delay(attempt) = clamp(base_delay * multiplier^attempt * (1 +/- jitter * rand), 0, max_delay)`.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// In `[0, 1]`; fraction of the computed delay randomly added or
    /// subtracted to avoid thundering-herd retries.
    pub jitter: f64,
    /// When present, classifies a user error as terminal (never retried)
    /// independent of `max_attempts`. Errors not matched by this predicate
    /// are retryable.
    terminal: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .field("terminal", &self.terminal.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
            terminal: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            multiplier,
            jitter: jitter.clamp(0.0, 1.0),
            terminal: None,
        }
    }

    /// Registers a predicate that marks matching error messages as terminal
    /// (routed straight to dead-letter, bypassing remaining attempts).
    pub fn with_terminal_predicate(mut self, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.terminal = Some(Arc::new(predicate));
        self
    }

    pub fn is_terminal(&self, message: &str) -> bool {
        self.terminal.as_ref().is_some_and(|p| p(message))
    }

    /// Computes the delay before the attempt *after* `attempt` (0-indexed).
    /// Jitter is applied symmetrically via `fastrand`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let scaled = base * self.multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let sign = if fastrand::bool() { 1.0 } else { -1.0 };
            let magnitude = capped * self.jitter * fastrand::f64();
            (capped + sign * magnitude).max(0.0)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }

    pub fn next_delay_chrono(&self, attempt: u32) -> ChronoDuration {
        ChronoDuration::from_std(self.next_delay(attempt)).unwrap_or(ChronoDuration::zero())
    }

    /// Whether attempt `attempt` (0-indexed, about to become `attempt + 1`)
    /// should be retried given the supplied error message, or dead-lettered.
    pub fn should_retry(&self, attempt: u32, error_message: &str) -> bool {
        if self.is_terminal(error_message) {
            return false;
        }
        attempt + 1 < self.max_attempts
    }

    /// Classifies an error raised by a durable function body into the
    /// [`SenpukiError::Retryable`] or [`SenpukiError::Terminal`] wrapper,
    /// given the task's current attempt count.
    pub fn classify(&self, attempt: u32, error_message: impl Into<String>) -> SenpukiError {
        let message = error_message.into();
        if self.should_retry(attempt, &message) {
            SenpukiError::Retryable(message)
        } else {
            SenpukiError::Terminal(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_bounded_by_max_delay() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_secs(1), 2.0, 0.0);
        for attempt in 0..10 {
            assert!(policy.next_delay(attempt) <= Duration::from_secs(1));
        }
    }

    #[test]
    fn max_attempts_routes_to_dead_letter() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(1), 2.0, 0.0);
        assert!(policy.should_retry(0, "boom"));
        assert!(policy.should_retry(1, "boom"));
        assert!(!policy.should_retry(2, "boom")); // attempt 2 -> would be 3rd, == max_attempts
    }

    #[test]
    fn terminal_predicate_overrides_attempt_budget() {
        let policy = RetryPolicy::default().with_terminal_predicate(|m| m.contains("fatal"));
        assert!(!policy.should_retry(0, "fatal: bad input"));
        assert!(policy.should_retry(0, "transient timeout"));
    }
}
