//! Per-URL retry decisions.

use std::time::Duration;

use crate::config::RetryConfig;
use crate::retry::FailureKind;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again immediately with the same account.
    RetrySame,
    /// Wait, then try again with the same account if it is still eligible.
    RetryBackoff(Duration),
    /// Try again at once with a different account.
    RetryNewAccount,
    /// Give up on the URL.
    Abandon,
}

/// Exponential backoff bounded by an attempt ceiling.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    account_backoff: Duration,
    jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            account_backoff: Duration::from_millis(config.account_backoff_ms),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decides the next step after `attempt` attempts (1-based) have failed.
    pub fn decide(&self, attempt: u32, kind: FailureKind, has_alternate: bool) -> RetryDecision {
        if attempt >= self.max_retries {
            return RetryDecision::Abandon;
        }
        match kind {
            FailureKind::Validation => RetryDecision::Abandon,
            FailureKind::Transient | FailureKind::Unknown => {
                let delay = self.backoff_delay(attempt);
                if delay.is_zero() {
                    RetryDecision::RetrySame
                } else {
                    RetryDecision::RetryBackoff(delay + self.jitter(delay))
                }
            }
            FailureKind::RateLimit | FailureKind::Authentication | FailureKind::Blocked => {
                if has_alternate {
                    RetryDecision::RetryNewAccount
                } else {
                    RetryDecision::RetryBackoff(
                        self.account_backoff + self.jitter(self.account_backoff),
                    )
                }
            }
        }
    }

    /// `min(base * 2^(attempt-1), max)` without jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn jitter(&self, delay: Duration) -> Duration {
        if self.jitter_ratio <= 0.0 || delay.is_zero() {
            return Duration::ZERO;
        }
        delay.mul_f64(self.jitter_ratio * random_fraction())
    }
}

/// A uniformly distributed value in `[0, 1)`; zero if the OS source fails.
fn random_fraction() -> f64 {
    let mut buf = [0u8; 8];
    match getrandom::fill(&mut buf) {
        Ok(()) => (u64::from_le_bytes(buf) >> 11) as f64 / (1u64 << 53) as f64,
        Err(_) => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter_ratio: f64) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_retries: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            account_backoff_ms: 300_000,
            jitter_ratio,
        })
    }

    #[test]
    fn test_ceiling_abandons_every_kind() {
        let p = policy(0.0);
        for kind in [
            FailureKind::Transient,
            FailureKind::RateLimit,
            FailureKind::Authentication,
            FailureKind::Blocked,
            FailureKind::Unknown,
        ] {
            assert_eq!(p.decide(3, kind, true), RetryDecision::Abandon);
            assert_eq!(p.decide(7, kind, false), RetryDecision::Abandon);
        }
    }

    #[test]
    fn test_validation_abandons_immediately() {
        assert_eq!(
            policy(0.0).decide(1, FailureKind::Validation, true),
            RetryDecision::Abandon
        );
    }

    #[test]
    fn test_transient_backs_off_exponentially() {
        let p = policy(0.0);
        assert_eq!(
            p.decide(1, FailureKind::Transient, true),
            RetryDecision::RetryBackoff(Duration::from_secs(2))
        );
        assert_eq!(
            p.decide(2, FailureKind::Unknown, false),
            RetryDecision::RetryBackoff(Duration::from_secs(4))
        );
    }

    #[test]
    fn test_account_failures_rotate_or_wait() {
        let p = policy(0.0);
        assert_eq!(
            p.decide(1, FailureKind::RateLimit, true),
            RetryDecision::RetryNewAccount
        );
        assert_eq!(
            p.decide(1, FailureKind::Authentication, false),
            RetryDecision::RetryBackoff(Duration::from_secs(300))
        );
    }

    #[test]
    fn test_zero_delay_retries_same() {
        let p = RetryPolicy::new(&RetryConfig {
            base_delay_ms: 0,
            ..RetryConfig::default()
        });
        assert_eq!(
            p.decide(1, FailureKind::Transient, false),
            RetryDecision::RetrySame
        );
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let p = policy(0.0);
        let mut previous = Duration::ZERO;
        for attempt in 1..=64 {
            let delay = p.backoff_delay(attempt);
            assert!(delay >= previous, "attempt {}", attempt);
            assert!(delay <= Duration::from_secs(60));
            previous = delay;
        }
        assert_eq!(p.backoff_delay(64), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let p = policy(0.1);
        for _ in 0..50 {
            match p.decide(1, FailureKind::Transient, false) {
                RetryDecision::RetryBackoff(delay) => {
                    assert!(delay >= Duration::from_secs(2));
                    assert!(delay <= Duration::from_millis(2_200));
                }
                other => panic!("unexpected decision {:?}", other),
            }
        }
    }
}
