//! Exponential backoff used by the queue dispatcher's job options (§4.5) and
//! by `handleStateFailure`'s fix-attempt backoff (§4.6).

use crate::error::HealError;
use std::time::Duration;

/// Retry policy: decides whether an error is worth retrying.
pub trait RetryPolicy {
    /// Whether `error` should be retried.
    fn should_retry(&self, error: &HealError) -> bool;
}

/// Default policy: only transient errors are retried (§7).
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn should_retry(&self, error: &HealError) -> bool {
        error.is_transient()
    }
}

/// Exponential backoff with a cap, `delay = min(base * 2^attempt, max)`.
///
/// `attempt` is zero-based (the delay before the *first* retry uses
/// `attempt = 0`). Used both for generic per-queue backoff (base 2s/5s) and
/// for `handleStateFailure`'s `min(1000 * 2^fixAttempts, 30000)` ms rule.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    let candidate = base.as_millis().saturating_mul(factor as u128);
    Duration::from_millis(candidate.min(max.as_millis()) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_at_max() {
        let base = Duration::from_millis(1000);
        let max = Duration::from_millis(30_000);
        assert_eq!(backoff_delay(base, max, 0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(base, max, 4), Duration::from_millis(16_000));
        assert_eq!(backoff_delay(base, max, 10), Duration::from_millis(30_000));
    }

    #[test]
    fn default_policy_retries_only_transient() {
        let policy = DefaultRetryPolicy;
        assert!(policy.should_retry(&HealError::Queue("x".into())));
        assert!(!policy.should_retry(&HealError::Validation("x".into())));
    }
}
