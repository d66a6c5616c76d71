// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Reconnection policy injected into the connection supervisor.

use std::time::Duration;

/// Delay schedule between reconnection attempts.
///
/// Attempts are numbered from 1. The delay before attempt `n` is
/// `initial_delay * multiplier^(n-1)`, capped at `max_delay`; a multiplier of
/// `1.0` gives a fixed delay.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::exponential(Duration::from_secs(1), 2.0, Duration::from_secs(30))
    }
}

impl RetryPolicy {
    /// Retries forever, waiting `delay` between attempts.
    pub fn fixed(delay: Duration) -> RetryPolicy {
        RetryPolicy {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            max_attempts: None,
        }
    }

    /// Retries forever with exponentially growing delays.
    pub fn exponential(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> RetryPolicy {
        RetryPolicy {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            multiplier: multiplier.max(1.0),
            max_attempts: None,
        }
    }

    /// Gives up after `attempts` failed reconnection attempts.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn attempt_limit(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Whether attempt number `attempt` may still be made.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }

    /// Delay to wait before attempt number `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        let millis = self.initial_delay.as_millis() as f64 * factor;

        if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }

        Duration::from_millis(millis as u64)
    }
}
