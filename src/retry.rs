use std::time::Duration;

use crate::error::Failure;

/// Retry behavior for transport failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for every further retry.
    pub base_delay: Duration,
    /// Response statuses that may be retried.
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(2_000),
            retryable_status_codes: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_status_codes(mut self, codes: impl Into<Vec<u16>>) -> Self {
        self.retryable_status_codes = codes.into();
        self
    }

    /// A failure without any response is always retryable; a response is
    /// retryable only when its status is listed. Cancellation never is.
    pub fn is_retryable(&self, failure: &Failure) -> bool {
        match failure {
            Failure::NoResponse { .. } => true,
            Failure::Response { status, .. } => self.retryable_status_codes.contains(status),
            Failure::Cancelled(_) | Failure::Other(_) => false,
        }
    }

    /// Delay before retry number `attempt` (starting at 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }
}

/// Next step after a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait for the delay, then attempt again.
    Retry { attempt: u32, delay: Duration },
    /// Give up and surface the failure.
    Exhausted,
}

/// Attempt bookkeeping for one logical request.
#[derive(Debug)]
pub struct RetryState<'a> {
    policy: &'a RetryPolicy,
    retries: u32,
}

impl<'a> RetryState<'a> {
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Self { policy, retries: 0 }
    }

    /// Retries performed so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Total attempts made so far, counting the one that just failed.
    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }

    pub fn max_retries(&self) -> u32 {
        self.policy.max_retries
    }

    /// Records a failed attempt and decides what to do next.
    pub fn on_failure(&mut self, failure: &Failure) -> RetryDecision {
        if self.retries >= self.policy.max_retries || !self.policy.is_retryable(failure) {
            return RetryDecision::Exhausted;
        }
        self.retries += 1;
        RetryDecision::Retry {
            attempt: self.retries,
            delay: self.policy.backoff(self.retries),
        }
    }
}
