//! Exponential backoff for deferred messages.

use std::time::{Duration, SystemTime};

use rand::Rng;
use serde::Deserialize;

mod defaults {
    pub const fn base_delay_secs() -> u64 {
        60
    }

    pub const fn max_delay_secs() -> u64 {
        3600
    }

    pub const fn jitter() -> f64 {
        0.1
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry; doubles per attempt
    #[serde(default = "defaults::base_delay_secs")]
    pub base_delay_secs: u64,

    #[serde(default = "defaults::max_delay_secs")]
    pub max_delay_secs: u64,

    /// Delays are randomised within ±`jitter` of their value
    #[serde(default = "defaults::jitter")]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: defaults::base_delay_secs(),
            max_delay_secs: defaults::max_delay_secs(),
            jitter: defaults::jitter(),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^(attempt - 1)` capped at the maximum, before jitter.
    /// `attempt` counts from 1.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let secs = if exponent >= 63 {
            self.max_delay_secs
        } else {
            self.base_delay_secs
                .saturating_mul(1u64 << exponent)
                .min(self.max_delay_secs)
        };

        Duration::from_secs(secs)
    }

    /// When attempt number `attempt` should be retried, counted from `now`.
    ///
    /// The result never lies past `deadline`, the moment the message would
    /// exceed its maximum queue residence.
    #[must_use]
    pub fn next_attempt(&self, attempt: u32, now: SystemTime, deadline: SystemTime) -> SystemTime {
        let delay = self.delay(attempt);

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let jittered = {
            let secs = delay.as_secs_f64();
            let range = (secs * self.jitter).abs();
            let jitter = if range > 0.0 {
                rand::rng().random_range(-range..=range)
            } else {
                0.0
            };
            Duration::from_secs_f64((secs + jitter).max(0.0))
        };

        (now + jittered).min(deadline.max(now))
    }
}
