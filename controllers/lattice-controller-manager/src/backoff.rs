//! # Exponential Backoff
//!
//! Per-key retry delays for failed reconciles.
//!
//! The delay starts at a base, doubles on every consecutive failure and is
//! capped. Controllers use a 5 second base and a 5 minute cap:
//! 5s, 10s, 20s, 40s, 80s, 160s, 300s (max).

use std::time::Duration;

/// Base delay used by the controllers, in seconds
pub const DEFAULT_BASE_SECONDS: u64 = 5;

/// Maximum delay used by the controllers, in seconds
pub const DEFAULT_MAX_SECONDS: u64 = 300;

/// Exponential backoff calculator
///
/// Each call to [`ExponentialBackoff::next_backoff_seconds`] returns the
/// current delay and doubles it for the next call, up to `max_seconds`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay returned by the next call
    current_seconds: u64,
    /// Upper bound on any delay
    max_seconds: u64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_SECONDS, DEFAULT_MAX_SECONDS)
    }
}

impl ExponentialBackoff {
    /// Create a backoff starting at `base_seconds` and capped at `max_seconds`
    #[must_use]
    pub fn new(base_seconds: u64, max_seconds: u64) -> Self {
        Self {
            current_seconds: base_seconds.min(max_seconds),
            max_seconds,
        }
    }

    /// Get the next delay in seconds and advance the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let result = self.current_seconds;
        self.current_seconds = self.current_seconds.saturating_mul(2).min(self.max_seconds);
        result
    }

    /// Get the next delay as a `Duration` and advance the sequence
    #[must_use]
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_secs(self.next_backoff_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let mut backoff = ExponentialBackoff::default();

        assert_eq!(backoff.next_backoff_seconds(), 5);
        assert_eq!(backoff.next_backoff_seconds(), 10);
        assert_eq!(backoff.next_backoff_seconds(), 20);
        assert_eq!(backoff.next_backoff_seconds(), 40);
        assert_eq!(backoff.next_backoff_seconds(), 80);
        assert_eq!(backoff.next_backoff_seconds(), 160);
        assert_eq!(backoff.next_backoff_seconds(), 300); // capped
        assert_eq!(backoff.next_backoff_seconds(), 300);
    }

    #[test]
    fn test_base_above_max_is_capped() {
        let mut backoff = ExponentialBackoff::new(600, 300);
        assert_eq!(backoff.next_backoff_seconds(), 300);
    }
}
