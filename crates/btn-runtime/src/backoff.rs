//! Bounded exponential backoff for transient I/O failures.
//!
//! The n-th consecutive failure (1-based) waits
//! `min(max_delay, base * 2^(n-1))`. Failure number `max_attempts + 1` is
//! fatal. Any success resets the count.

use std::time::Duration;

use btn_config::ServiceSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay,
            max_attempts,
        }
    }

    pub fn from_settings(s: &ServiceSettings) -> Self {
        Self::new(s.backoff_base, s.backoff_max, s.backoff_max_attempts)
    }

    /// Delay before retrying after failure number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Consecutive-failure counter over a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Record a failure. `Some(delay)` to retry, `None` once attempts are
    /// exhausted.
    pub fn on_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.policy.max_attempts {
            None
        } else {
            Some(self.policy.delay_for(self.failures))
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
