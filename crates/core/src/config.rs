//! Publish policies.
//!
//! [`BatchPolicy`] shapes one attempt (checkpoint spacing, safety
//! period, confirmation timeout) and is validated at construction;
//! [`RetryPolicy`] bounds the campaign's attempts.

use std::time::Duration;

/// Invalid [`BatchPolicy`] parameters.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("message batch size must be at least 1")]
    ZeroBatchSize,

    #[error("safety period may be zero only when the message batch size is 1")]
    MissingSafetyPeriod,
}

/// Per-attempt publishing policy.
///
/// Every `message_batch_size` transmissions the driver pauses until all
/// outstanding messages are confirmed; larger batches trade
/// confirmation latency for throughput. After the last checkpoint the
/// session is held open for `safety_period` to absorb confirmations the
/// broker emits out of order relative to the final batch; without it,
/// messages confirmed in flight would be misreported as possibly lost.
/// With a batch size of 1 nothing is ever outstanding after the final
/// checkpoint, which is the only configuration where a zero safety
/// period is accepted.
#[derive(Debug, Clone)]
pub struct BatchPolicy {
    message_batch_size: usize,
    safety_period: Duration,
    confirm_timeout: Duration,
}

impl BatchPolicy {
    /// Create a policy, enforcing the batch-size/safety-period rules.
    pub fn new(message_batch_size: usize, safety_period: Duration) -> Result<Self, PolicyError> {
        if message_batch_size == 0 {
            return Err(PolicyError::ZeroBatchSize);
        }
        if safety_period.is_zero() && message_batch_size != 1 {
            return Err(PolicyError::MissingSafetyPeriod);
        }
        Ok(Self {
            message_batch_size,
            safety_period,
            confirm_timeout: Duration::from_secs(60),
        })
    }

    /// Replace the bound on each confirmation checkpoint wait. A
    /// checkpoint that exceeds this bound interrupts the attempt.
    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub fn message_batch_size(&self) -> usize {
        self.message_batch_size
    }

    pub fn safety_period(&self) -> Duration {
        self.safety_period
    }

    pub fn confirm_timeout(&self) -> Duration {
        self.confirm_timeout
    }
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            message_batch_size: 50,
            safety_period: Duration::from_secs(1),
            confirm_timeout: Duration::from_secs(60),
        }
    }
}

/// Campaign retry policy for the multi-attempt entry points.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt: up to `retry_limit + 1` attempts
    /// are made in total.
    pub retry_limit: u32,
    /// Pause between the end of one attempt and the start of the next.
    pub retry_period: Duration,
}

impl RetryPolicy {
    pub fn new(retry_limit: u32, retry_period: Duration) -> Self {
        Self {
            retry_limit,
            retry_period,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_limit: 2,
            retry_period: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_policy_rejects_zero_batch_size() {
        assert_eq!(
            BatchPolicy::new(0, Duration::from_secs(1)).unwrap_err(),
            PolicyError::ZeroBatchSize
        );
    }

    #[test]
    fn test_zero_safety_period_needs_batch_size_one() {
        assert_eq!(
            BatchPolicy::new(10, Duration::ZERO).unwrap_err(),
            PolicyError::MissingSafetyPeriod
        );
        assert!(BatchPolicy::new(1, Duration::ZERO).is_ok());
    }

    #[test]
    fn test_confirm_timeout_override() {
        let policy = BatchPolicy::new(5, Duration::from_millis(200))
            .unwrap()
            .with_confirm_timeout(Duration::from_secs(5));
        assert_eq!(policy.confirm_timeout(), Duration::from_secs(5));
        assert_eq!(policy.message_batch_size(), 5);
    }

    #[test]
    fn test_defaults() {
        let policy = BatchPolicy::default();
        assert_eq!(policy.message_batch_size(), 50);
        assert!(!policy.safety_period().is_zero());

        let retry = RetryPolicy::default();
        assert_eq!(retry.retry_limit, 2);
        assert_eq!(retry.retry_period, Duration::from_secs(1));
    }
}
