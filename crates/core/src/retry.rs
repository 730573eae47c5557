//! Retry budget and backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OutboxError, OutboxResult};

/// Delay before retry number `n` (1-indexed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay for every retry.
    Fixed(Duration),
    /// `base * 2^(n-1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
    /// `step * n`, capped at `max`.
    Linear { step: Duration, max: Duration },
    /// Explicit delays; the last entry repeats once exhausted.
    Schedule(Vec<Duration>),
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(2),
            max: Duration::from_secs(300),
        }
    }
}

impl Backoff {
    /// Delay for retry number `retry` (1-indexed). Retry 0 is immediate.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential { base, max } => {
                let factor = 2u32.checked_pow(retry - 1).unwrap_or(u32::MAX);
                base.checked_mul(factor).map_or(*max, |d| d.min(*max))
            }
            Backoff::Linear { step, max } => {
                step.checked_mul(retry).map_or(*max, |d| d.min(*max))
            }
            Backoff::Schedule(delays) => {
                let idx = (retry as usize - 1).min(delays.len().saturating_sub(1));
                delays.get(idx).copied().unwrap_or(Duration::ZERO)
            }
        }
    }

    pub fn validate(&self) -> OutboxResult<()> {
        match self {
            Backoff::Fixed(delay) if delay.is_zero() => {
                Err(OutboxError::validation("fixed backoff must be positive"))
            }
            Backoff::Exponential { base, max } | Backoff::Linear { step: base, max }
                if base.is_zero() || max < base =>
            {
                Err(OutboxError::validation(
                    "backoff base must be positive and not exceed max",
                ))
            }
            Backoff::Schedule(delays) if delays.is_empty() => {
                Err(OutboxError::validation("backoff schedule must not be empty"))
            }
            Backoff::Schedule(delays)
                if delays[0].is_zero() || delays.windows(2).any(|w| w[1] < w[0]) =>
            {
                Err(OutboxError::validation(
                    "backoff schedule must be positive and non-decreasing",
                ))
            }
            _ => Ok(()),
        }
    }
}

/// What to do with a task after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Mark FAILED with `retry_count` and re-offer after `delay`.
    Retry { retry_count: u32, delay: Duration },
    /// Budget exhausted (or the failure was permanent): mark DEAD.
    Dead { retry_count: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// A task goes DEAD once its failure count reaches this value.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 20,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Decide the follow-up for a task that failed with `previous_retries`
    /// failures already recorded.
    pub fn on_failure(&self, previous_retries: u32, permanent: bool) -> RetryDecision {
        let retry_count = previous_retries.saturating_add(1);
        if permanent || retry_count >= self.max_retries {
            RetryDecision::Dead { retry_count }
        } else {
            RetryDecision::Retry {
                retry_count,
                delay: self.backoff.delay_for(retry_count),
            }
        }
    }

    pub fn validate(&self) -> OutboxResult<()> {
        if self.max_retries == 0 {
            return Err(OutboxError::validation("max_retries must be at least 1"));
        }
        self.backoff.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_until_cap() {
        let backoff = Backoff::default();

        assert_eq!(backoff.delay_for(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(8));
        assert_eq!(backoff.delay_for(8), Duration::from_secs(256));
        assert_eq!(backoff.delay_for(9), Duration::from_secs(300));
        assert_eq!(backoff.delay_for(64), Duration::from_secs(300));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = Backoff::Fixed(Duration::from_millis(500));

        assert_eq!(backoff.delay_for(1), Duration::from_millis(500));
        assert_eq!(backoff.delay_for(7), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let backoff = Backoff::Linear {
            step: Duration::from_millis(100),
            max: Duration::from_secs(10),
        };

        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(300));
        assert_eq!(backoff.delay_for(1000), Duration::from_secs(10));
    }

    #[test]
    fn schedule_repeats_last_entry() {
        let backoff = Backoff::Schedule(vec![Duration::from_secs(1), Duration::from_secs(2)]);

        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(5), Duration::from_secs(2));
    }

    #[test]
    fn policy_goes_dead_when_count_reaches_max() {
        let policy = RetryPolicy::new(
            3,
            Backoff::Schedule(vec![Duration::from_secs(1), Duration::from_secs(2)]),
        );

        assert_eq!(
            policy.on_failure(0, false),
            RetryDecision::Retry {
                retry_count: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            policy.on_failure(1, false),
            RetryDecision::Retry {
                retry_count: 2,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(policy.on_failure(2, false), RetryDecision::Dead { retry_count: 3 });
    }

    #[test]
    fn permanent_failure_skips_remaining_budget() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.on_failure(0, true), RetryDecision::Dead { retry_count: 1 });
    }

    #[test]
    fn validation_rejects_degenerate_policies() {
        assert!(RetryPolicy::new(0, Backoff::default()).validate().is_err());
        assert!(Backoff::Fixed(Duration::ZERO).validate().is_err());
        assert!(Backoff::Schedule(vec![]).validate().is_err());
        assert!(
            Backoff::Schedule(vec![Duration::from_secs(3), Duration::from_secs(1)])
                .validate()
                .is_err()
        );
        assert!(
            Backoff::Exponential {
                base: Duration::from_secs(10),
                max: Duration::from_secs(1)
            }
            .validate()
            .is_err()
        );
        assert!(RetryPolicy::default().validate().is_ok());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Delays never shrink as the retry count grows.
            #[test]
            fn exponential_delays_are_non_decreasing(
                base_ms in 1u64..5_000,
                cap_factor in 1u32..512,
                retry in 1u32..40,
            ) {
                let base = Duration::from_millis(base_ms);
                let backoff = Backoff::Exponential { base, max: base * cap_factor };
                prop_assert!(backoff.delay_for(retry + 1) >= backoff.delay_for(retry));
                prop_assert!(backoff.delay_for(retry) <= base * cap_factor);
            }
        }
    }
}
