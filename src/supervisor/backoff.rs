use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the supervisor reacts to a failed capture run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    #[serde(with = "crate::config::secs")]
    pub first_backoff: Duration,

    /// Upper bound for the doubling delay.
    #[serde(with = "crate::config::secs")]
    pub max_backoff: Duration,

    /// Number of retries allowed before giving up. 0 = unlimited.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            first_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            max_retries: 0,
        }
    }
}

impl RetryPolicy {
    /// Sleep before retry number `attempt` (1-based):
    /// `min(first * 2^(attempt-1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.first_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// True once `retries` exceeds a configured budget.
    pub fn exhausted(&self, retries: u32) -> bool {
        self.max_retries > 0 && retries > self.max_retries
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
        }
    }
}

/// Stateful retry counter that yields successive delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    /// Records one failure and returns the delay to wait, or `None` when the
    /// retry budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        if self.policy.exhausted(self.attempt) {
            return None;
        }
        Some(self.policy.delay_for(self.attempt))
    }

    /// Failures recorded so far.
    pub fn retries(&self) -> u32 {
        self.attempt
    }
}
