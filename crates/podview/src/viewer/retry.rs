//! Retry bookkeeping
//!
//! Attempt counter plus a multiplicative backoff delay with a cap.

use std::time::Duration;

use crate::config::retry::{BACKOFF_FACTOR, INITIAL_DELAY_MS, MAX_DELAY_MS, MAX_RETRIES};

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            initial_delay: Duration::from_millis(INITIAL_DELAY_MS),
            factor: BACKOFF_FACTOR,
            max_delay: Duration::from_millis(MAX_DELAY_MS),
        }
    }
}

/// Mutable retry state of one controller
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryState {
    policy: RetryPolicy,
    count: u32,
    delay: Duration,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            count: 0,
            delay: policy.initial_delay,
        }
    }

    /// Attempts made since the last reset
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Delay the next scheduled retry will wait
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Count one attempt
    pub fn record_attempt(&mut self) {
        self.count = self.count.saturating_add(1);
    }

    /// True while another automatic attempt is allowed
    pub fn can_retry(&self) -> bool {
        self.count < self.policy.max_retries
    }

    /// Hand out the current delay and grow it for the next failure:
    /// `min(delay * factor, max_delay)`
    pub fn take_delay(&mut self) -> Duration {
        let current = self.delay;
        let max = self.policy.max_delay;
        self.delay = Duration::try_from_secs_f64(current.as_secs_f64() * self.policy.factor)
            .unwrap_or(max)
            .min(max);
        current
    }

    /// Back to zero attempts and the initial delay
    pub fn reset(&mut self) {
        self.count = 0;
        self.delay = self.policy.initial_delay;
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn starts_at_initial_values() {
        let retry = RetryState::default();
        assert_eq!(retry.count(), 0);
        assert_eq!(retry.delay(), ms(2000));
        assert!(retry.can_retry());
    }

    #[test]
    fn delay_sequence_grows_by_half() {
        let mut retry = RetryState::default();
        assert_eq!(retry.take_delay(), ms(2000));
        assert_eq!(retry.take_delay(), ms(3000));
        assert_eq!(retry.take_delay(), ms(4500));
        assert_eq!(retry.take_delay(), ms(6750));
        assert_eq!(retry.delay(), ms(10125));
    }

    #[test]
    fn delay_is_capped() {
        let mut retry = RetryState::default();
        for _ in 0..20 {
            retry.take_delay();
        }
        assert_eq!(retry.delay(), ms(30_000));
        assert_eq!(retry.take_delay(), ms(30_000));
        assert_eq!(retry.delay(), ms(30_000));
    }

    #[test]
    fn can_retry_until_max() {
        let mut retry = RetryState::default();
        for _ in 0..4 {
            retry.record_attempt();
            assert!(retry.can_retry());
        }
        retry.record_attempt();
        assert_eq!(retry.count(), 5);
        assert!(!retry.can_retry());
    }

    #[test]
    fn reset_restores_initial_values() {
        let mut retry = RetryState::default();
        retry.record_attempt();
        retry.record_attempt();
        retry.take_delay();
        retry.take_delay();
        retry.reset();
        assert_eq!(retry.count(), 0);
        assert_eq!(retry.delay(), ms(2000));
    }

    #[test]
    fn huge_factor_saturates_at_cap() {
        let mut retry = RetryState::new(RetryPolicy {
            factor: 1e300,
            ..RetryPolicy::default()
        });
        assert_eq!(retry.take_delay(), ms(2000));
        assert_eq!(retry.take_delay(), ms(30_000));
        assert_eq!(retry.take_delay(), ms(30_000));
    }

    #[test]
    fn non_finite_factor_saturates_at_cap() {
        let mut retry = RetryState::new(RetryPolicy {
            factor: f64::INFINITY,
            ..RetryPolicy::default()
        });
        retry.take_delay();
        assert_eq!(retry.delay(), ms(30_000));

        let mut retry = RetryState::new(RetryPolicy {
            factor: f64::NAN,
            ..RetryPolicy::default()
        });
        retry.take_delay();
        assert_eq!(retry.delay(), ms(30_000));
    }

    #[test]
    fn custom_policy_is_respected() {
        let mut retry = RetryState::new(RetryPolicy {
            max_retries: 2,
            initial_delay: ms(100),
            factor: 2.0,
            max_delay: ms(250),
        });
        assert_eq!(retry.take_delay(), ms(100));
        assert_eq!(retry.take_delay(), ms(200));
        assert_eq!(retry.take_delay(), ms(250));
        retry.record_attempt();
        retry.record_attempt();
        assert!(!retry.can_retry());
    }
}
