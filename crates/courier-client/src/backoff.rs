//! Exponential reconnect backoff.
//!
//! Delays double from the base on every failed attempt (1s, 2s, 4s, ...)
//! up to a fixed attempt cap; exhausting the cap is the signal to stop
//! reconnecting and fall back to polling.

use std::time::Duration;

use courier_shared::constants::{RECONNECT_BASE_DELAY_MS, RECONNECT_MAX_ATTEMPTS};

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay to wait before the next attempt, or `None` once the attempt
    /// budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self.base * 2u32.saturating_pow(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// A successful connection resets the budget.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(RECONNECT_BASE_DELAY_MS),
            RECONNECT_MAX_ATTEMPTS,
        )
    }
}
