//! # Fibonacci Backoff
//!
//! Delay sequence for re-opening a watch after its stream ends.
//! Grows more slowly than exponential backoff, so a flapping API server is
//! retried promptly a few times before the delay settles at the cap.
//!
//! Sequence with `new(1, 60)`: 1s, 1s, 2s, 3s, 5s, 8s, 13s, 21s, 34s, 55s, 60s (max).

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each delay is the sum of the previous two, capped at `max_secs`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Minimum delay in seconds (for reset)
    min_secs: u64,
    /// Previous delay in seconds
    prev_secs: u64,
    /// Next delay to hand out, in seconds
    current_secs: u64,
    /// Maximum delay in seconds
    max_secs: u64,
}

impl FibonacciBackoff {
    /// Create a backoff starting at `min_secs` and capped at `max_secs`
    #[must_use]
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self {
            min_secs,
            prev_secs: 0,
            current_secs: min_secs,
            max_secs,
        }
    }

    /// Get the next delay and advance the sequence
    pub fn next_delay(&mut self) -> Duration {
        let result = self.current_secs;

        let next = self.prev_secs + self.current_secs;
        self.prev_secs = self.current_secs;
        self.current_secs = std::cmp::min(next, self.max_secs);

        Duration::from_secs(result)
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_secs = 0;
        self.current_secs = self.min_secs;
    }
}
