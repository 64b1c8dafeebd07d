//! Reconnect backoff.
//!
//! [`ReconnectPolicy`] is a pure function from consecutive failure count to
//! delay; [`Backoff`] tracks the failure count across attempts. There is no
//! retry ceiling, only a delay ceiling.

use std::time::Duration;

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any delay.
    pub ceiling: Duration,
    /// Multiplier applied per consecutive failure.
    pub factor: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            ceiling: Duration::from_secs(30),
            factor: 2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait after `failures` consecutive failed attempts.
    ///
    /// Monotonically non-decreasing in `failures` and never above `ceiling`.
    pub fn delay(&self, failures: u32) -> Duration {
        let mut delay = self.base.min(self.ceiling);
        for _ in 0..failures {
            if delay >= self.ceiling {
                break;
            }
            delay = delay
                .checked_mul(self.factor.max(1))
                .unwrap_or(self.ceiling)
                .min(self.ceiling);
        }
        delay
    }
}

/// Failure counter driven by a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Delay for the next attempt; counts one more failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Delay the next attempt would use, without counting a failure.
    pub fn current_delay(&self) -> Duration {
        self.policy.delay(self.failures)
    }

    /// Back to the base delay (after a successful open).
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}
