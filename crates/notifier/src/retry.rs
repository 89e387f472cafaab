//! Retry policy — decides whether a failed attempt is retried and after how long.
//!
//! Delays grow as `base × factor^(attempt-1)` and are capped at `max_delay`.
//! Permanent failures are never retried; timeouts and unavailable transports
//! are treated like transient failures.

use std::time::Duration;

use herald_common::config::RetryConfig;
use herald_common::types::ErrorKind;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Abandon,
}

/// Stateless retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Decide the fate of `attempt_number` (1-based) which failed with `kind`.
    pub fn decide(&self, kind: ErrorKind, attempt_number: u32) -> RetryDecision {
        match kind {
            ErrorKind::Transient | ErrorKind::Timeout | ErrorKind::AdapterUnavailable => {
                if attempt_number >= self.config.max_attempts {
                    RetryDecision::Abandon
                } else {
                    RetryDecision::RetryAfter(self.backoff(attempt_number))
                }
            }
            ErrorKind::Permanent | ErrorKind::QueueFull | ErrorKind::Cancelled => {
                RetryDecision::Abandon
            }
        }
    }

    /// Like [`decide`](Self::decide), but never waits less than a delay the
    /// remote side asked for (e.g. Telegram's `retry_after`).
    pub fn decide_with_hint(
        &self,
        kind: ErrorKind,
        attempt_number: u32,
        hint: Option<Duration>,
    ) -> RetryDecision {
        match (self.decide(kind, attempt_number), hint) {
            (RetryDecision::RetryAfter(delay), Some(hint)) => {
                RetryDecision::RetryAfter(delay.max(hint))
            }
            (decision, _) => decision,
        }
    }

    /// Backoff after the given failed attempt.
    pub fn backoff(&self, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.config.base_delay.as_millis() as f64;
        let delay_ms = base_ms * self.config.factor.powi(exponent);
        let cap_ms = self.config.max_delay.as_millis() as f64;

        if !delay_ms.is_finite() || delay_ms >= cap_ms {
            self.config.max_delay
        } else {
            Duration::from_millis(delay_ms as u64)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32, max_delay_secs: u64) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(max_delay_secs),
            max_attempts,
        })
    }

    #[test]
    fn test_backoff_is_exponential() {
        let p = policy(10, 3600);
        assert_eq!(p.backoff(1), Duration::from_secs(1));
        assert_eq!(p.backoff(2), Duration::from_secs(2));
        assert_eq!(p.backoff(3), Duration::from_secs(4));
        assert_eq!(p.backoff(5), Duration::from_secs(16));
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = policy(10, 5);
        assert_eq!(p.backoff(3), Duration::from_secs(4));
        assert_eq!(p.backoff(4), Duration::from_secs(5));
        assert_eq!(p.backoff(60), Duration::from_secs(5));
        assert_eq!(p.backoff(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_transient_and_timeout_retry() {
        let p = policy(5, 60);
        assert_eq!(
            p.decide(ErrorKind::Transient, 1),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            p.decide(ErrorKind::Timeout, 2),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            p.decide(ErrorKind::AdapterUnavailable, 3),
            RetryDecision::RetryAfter(Duration::from_secs(4))
        );
    }

    #[test]
    fn test_permanent_abandons_immediately() {
        let p = policy(5, 60);
        assert_eq!(p.decide(ErrorKind::Permanent, 1), RetryDecision::Abandon);
        assert_eq!(p.decide(ErrorKind::Cancelled, 1), RetryDecision::Abandon);
    }

    #[test]
    fn test_abandon_at_and_beyond_max_attempts() {
        let p = policy(5, 60);
        assert!(matches!(
            p.decide(ErrorKind::Transient, 4),
            RetryDecision::RetryAfter(_)
        ));
        for attempt in 5..12 {
            assert_eq!(p.decide(ErrorKind::Transient, attempt), RetryDecision::Abandon);
            assert_eq!(p.decide(ErrorKind::Timeout, attempt), RetryDecision::Abandon);
        }
    }

    #[test]
    fn test_hint_raises_delay_only() {
        let p = policy(5, 60);
        assert_eq!(
            p.decide_with_hint(ErrorKind::Transient, 1, Some(Duration::from_secs(7))),
            RetryDecision::RetryAfter(Duration::from_secs(7))
        );
        assert_eq!(
            p.decide_with_hint(ErrorKind::Transient, 3, Some(Duration::from_millis(10))),
            RetryDecision::RetryAfter(Duration::from_secs(4))
        );
        assert_eq!(
            p.decide_with_hint(ErrorKind::Permanent, 1, Some(Duration::from_secs(7))),
            RetryDecision::Abandon
        );
    }
}
