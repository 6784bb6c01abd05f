use std::time;

use serde::{Deserialize, Serialize};

use crate::duration_ms;

/// Bounded exponential backoff used when an output rejects a delivery.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval after the first failed attempt.
    #[serde(with = "duration_ms")]
    initial_interval: time::Duration,
    /// The maximum possible backoff between attempts.
    #[serde(default, with = "duration_ms::option")]
    maximum_interval: Option<time::Duration>,
    /// Total number of attempts, the first one included.
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Time to wait after `attempt` failed attempts before the next one.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self
            .backoff_coefficient
            .checked_pow(exponent)
            .unwrap_or(u32::MAX);
        let candidate_interval = self.initial_interval.saturating_mul(factor);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff_coefficient(&self) -> u32 {
        self.backoff_coefficient
    }

    pub fn initial_interval(&self) -> time::Duration {
        self.initial_interval
    }

    pub fn maximum_interval(&self) -> Option<time::Duration> {
        self.maximum_interval
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

pub struct RetryPolicyBuilder {
    backoff_coefficient: u32,
    initial_interval: time::Duration,
    maximum_interval: Option<time::Duration>,
    max_attempts: u32,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
            max_attempts: 3,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> RetryPolicyBuilder {
        self.max_attempts = attempts;
        self
    }

    /// Provide a RetryPolicy according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            max_attempts: self.max_attempts,
        }
    }
}
