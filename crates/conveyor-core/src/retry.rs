use serde::{Deserialize, Serialize};

/// How failed attempts of a work item are retried.
///
/// With `Backoff`, attempt *n* (1-indexed, n ≥ 2) is delayed by
/// `initial_backoff_ms * base^(n-2)`; attempt 1 runs without a preceding
/// delay. `max_attempts` counts every attempt, including the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RetryBehavior {
    /// The first failure is terminal.
    None,
    Backoff {
        max_attempts: u32,
        initial_backoff_ms: u64,
        base: f64,
    },
}

impl RetryBehavior {
    /// Exponential backoff retry. `max_attempts` below 1 is normalized
    /// to 1 (the invariant `max_attempts >= 1` always holds).
    pub fn backoff(max_attempts: u32, initial_backoff_ms: u64, base: f64) -> Self {
        Self::Backoff {
            max_attempts: max_attempts.max(1),
            initial_backoff_ms,
            base,
        }
    }
}

/// Outcome of consulting the retry policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    Retry { delay_ms: u64 },
    /// The failure is terminal.
    GiveUp,
}

/// Decide whether a work item with `attempts_so_far` completed attempts
/// should be retried.
///
/// Pure and deterministic. The delay is computed in `f64` and rounded
/// with [`f64::round`] (half away from zero), saturating at `u64::MAX`;
/// this is reproducible across platforms for any realistic backoff.
pub fn decide(attempts_so_far: u32, behavior: &RetryBehavior) -> RetryDecision {
    match behavior {
        RetryBehavior::None => RetryDecision::GiveUp,
        RetryBehavior::Backoff {
            max_attempts,
            initial_backoff_ms,
            base,
        } => {
            if attempts_so_far >= *max_attempts {
                return RetryDecision::GiveUp;
            }
            // The next attempt is number attempts_so_far + 1, so its
            // delay exponent is attempts_so_far - 1.
            let exponent = attempts_so_far.saturating_sub(1);
            let delay = (*initial_backoff_ms as f64) * base.powi(exponent as i32);
            let delay_ms = if delay.is_finite() && delay < u64::MAX as f64 {
                delay.round() as u64
            } else {
                u64::MAX
            };
            RetryDecision::Retry { delay_ms }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_retry_gives_up_immediately() {
        assert_eq!(decide(1, &RetryBehavior::None), RetryDecision::GiveUp);
    }

    #[test]
    fn test_backoff_sequence() {
        let behavior = RetryBehavior::backoff(4, 100, 2.0);
        assert_eq!(
            decide(1, &behavior),
            RetryDecision::Retry { delay_ms: 100 }
        );
        assert_eq!(
            decide(2, &behavior),
            RetryDecision::Retry { delay_ms: 200 }
        );
        assert_eq!(
            decide(3, &behavior),
            RetryDecision::Retry { delay_ms: 400 }
        );
        assert_eq!(decide(4, &behavior), RetryDecision::GiveUp);
        assert_eq!(decide(5, &behavior), RetryDecision::GiveUp);
    }

    #[test]
    fn test_fractional_base_rounds() {
        let behavior = RetryBehavior::backoff(3, 100, 1.5);
        assert_eq!(
            decide(2, &behavior),
            RetryDecision::Retry { delay_ms: 150 }
        );
    }

    #[test]
    fn test_max_attempts_normalized_to_one() {
        let behavior = RetryBehavior::backoff(0, 100, 2.0);
        assert_eq!(decide(1, &behavior), RetryDecision::GiveUp);
    }

    #[test]
    fn test_huge_exponent_saturates() {
        let behavior = RetryBehavior::backoff(u32::MAX, 1_000, 10.0);
        assert_eq!(
            decide(1_000, &behavior),
            RetryDecision::Retry { delay_ms: u64::MAX }
        );
    }
}
