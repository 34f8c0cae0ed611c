//! Automatic retry policy for failures before the first token

use rand::Rng;
use std::time::Duration;

use crate::store::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Re-issues allowed after the first attempt
    pub max_auto_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_auto_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never re-issues a request
    pub fn disabled() -> Self {
        Self {
            max_auto_retries: 0,
            ..Self::default()
        }
    }

    /// Whether a failure on attempt `retries_so_far + 1` may be re-issued
    pub fn allows(&self, kind: FailureKind, retries_so_far: u32) -> bool {
        kind.is_retryable() && retries_so_far < self.max_auto_retries
    }

    /// Exponential backoff with jitter for the given retry number (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let jitter: f64 = {
            let mut rng = rand::thread_rng();
            rng.gen_range(0.0..=1.0)
        };
        let exponent = retry.saturating_sub(1).min(16) as i32;
        let delay_ms = self.base_delay.as_millis() as f64 * 2.0_f64.powi(exponent) * (1.0 + jitter);
        Duration::from_millis(delay_ms as u64).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_only_retryable_kinds() {
        let policy = RetryPolicy::default();
        assert!(policy.allows(FailureKind::Timeout, 0));
        assert!(policy.allows(FailureKind::RateLimited, 1));
        assert!(!policy.allows(FailureKind::Transport, 2));
        assert!(!policy.allows(FailureKind::Rejected, 0));
        assert!(!policy.allows(FailureKind::Cancelled, 0));
        assert!(!RetryPolicy::disabled().allows(FailureKind::Timeout, 0));
    }

    #[test]
    fn test_delay_grows_and_is_capped() {
        let policy = RetryPolicy::default();
        let first = policy.delay_for(1);
        assert!(first >= Duration::from_millis(500) && first <= Duration::from_millis(1000));

        let third = policy.delay_for(3);
        assert!(third >= Duration::from_millis(2000) && third <= Duration::from_millis(4000));

        assert_eq!(policy.delay_for(20), Duration::from_secs(30));
    }
}
