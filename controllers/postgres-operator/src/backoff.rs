//! # Fibonacci Backoff
//!
//! Requeue delays for clusters whose sync keeps failing. The delay grows
//! along the Fibonacci sequence, slower than exponential backoff, so a
//! cluster stuck on a transient backend problem is retried often at first
//! without hammering the API server later.
//!
//! With the operator defaults (10s minimum, 5m maximum) the sequence is
//! 10s, 10s, 20s, 30s, 50s, 80s, 130s, 210s, 300s.

use std::time::Duration;

/// Fibonacci backoff calculator, in whole seconds.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_seconds: u64,
    prev_seconds: u64,
    current_seconds: u64,
    max_seconds: u64,
}

impl FibonacciBackoff {
    /// Creates a backoff starting at `min` and capped at `max`.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        let min_seconds = min.as_secs().max(1);
        Self {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds: max.as_secs().max(min_seconds),
        }
    }

    /// Returns the current delay and advances the sequence.
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current_seconds;
        let next = self.prev_seconds + self.current_seconds;
        self.prev_seconds = self.current_seconds;
        self.current_seconds = next.min(self.max_seconds);
        Duration::from_secs(result)
    }

    /// Restarts the sequence after a successful sync.
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }

    /// Delay for the `error_count`-th consecutive failure (0-indexed),
    /// without keeping state.
    #[must_use]
    pub fn calculate_for_error_count(error_count: u32, min: Duration, max: Duration) -> Duration {
        let mut backoff = Self::new(min, max);
        let mut delay = backoff.next_backoff();
        for _ in 0..error_count {
            delay = backoff.next_backoff();
            if delay.as_secs() >= backoff.max_seconds {
                break;
            }
        }
        delay
    }
}
