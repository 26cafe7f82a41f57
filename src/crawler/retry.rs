//! Retry controller
//!
//! Maps a classified failure and the attempt that just failed onto a
//! verdict the scheduler honors:
//!
//! | Class   | Verdict |
//! |---------|---------|
//! | Network | `RetryAfter(base * 2^(attempt-1) + jitter)` until `max_retries` |
//! | Logic   | `CleanSlateRetry` until `max_retries`, then escalated |
//! | Fatal   | `GiveUp` |
//!
//! Delays are honored by re-enqueueing with a wake-up deadline, never by
//! sleeping on the dispatcher.

use crate::config::EngineConfig;
use crate::crawler::FetchError;
use rand::Rng;
use std::time::Duration;

/// What to do with a failed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    RetryNow,
    RetryAfter(Duration),
    /// Discard the source's session, then retry from a fresh state
    CleanSlateRetry,
    GiveUp,
}

/// Backoff and attempt limits
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first one
    max_retries: u32,
    base_delay: Duration,
    max_jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_jitter: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            base_delay,
            max_jitter,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_jitter_ms),
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decides how to proceed after `attempt` (1-based) failed with `error`
    pub fn decide(&self, error: &FetchError, attempt: u32) -> RetryVerdict {
        match error {
            FetchError::Fatal { .. } => RetryVerdict::GiveUp,
            _ if attempt >= self.max_retries => RetryVerdict::GiveUp,
            FetchError::Logic { .. } => RetryVerdict::CleanSlateRetry,
            FetchError::Network { .. } => {
                let delay = self.backoff_delay(attempt);
                if delay.is_zero() {
                    RetryVerdict::RetryNow
                } else {
                    RetryVerdict::RetryAfter(delay + self.jitter())
                }
            }
        }
    }

    /// Backoff before the attempt following `attempt`, without jitter
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }

    fn jitter(&self) -> Duration {
        let max = self.max_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(1), Duration::ZERO)
    }

    fn network() -> FetchError {
        FetchError::network("https://api.example.gov/list", "connection reset")
    }

    fn logic() -> FetchError {
        FetchError::logic("https://api.example.gov/list", "code 160003")
    }

    #[test]
    fn test_network_backoff_doubles() {
        let policy = policy();
        assert_eq!(
            policy.decide(&network(), 1),
            RetryVerdict::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            policy.decide(&network(), 2),
            RetryVerdict::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(policy.decide(&network(), 3), RetryVerdict::GiveUp);
    }

    #[test]
    fn test_backoff_schedule_with_more_retries() {
        let policy = RetryPolicy::new(6, Duration::from_secs(1), Duration::ZERO);
        let delays: Vec<u64> = (1..6).map(|a| policy.backoff_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_millis(50));
        for _ in 0..50 {
            match policy.decide(&network(), 1) {
                RetryVerdict::RetryAfter(delay) => {
                    assert!(delay >= Duration::from_secs(1));
                    assert!(delay <= Duration::from_millis(1050));
                }
                other => panic!("unexpected verdict {:?}", other),
            }
        }
    }

    #[test]
    fn test_zero_base_delay_retries_now() {
        let policy = RetryPolicy::new(3, Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.decide(&network(), 1), RetryVerdict::RetryNow);
    }

    #[test]
    fn test_logic_error_clean_slate_then_give_up() {
        let policy = policy();
        assert_eq!(policy.decide(&logic(), 1), RetryVerdict::CleanSlateRetry);
        assert_eq!(policy.decide(&logic(), 2), RetryVerdict::CleanSlateRetry);
        assert_eq!(policy.decide(&logic(), 3), RetryVerdict::GiveUp);
    }

    #[test]
    fn test_fatal_never_retried() {
        let fatal = FetchError::fatal("https://api.example.gov/list", "HTTP 404");
        assert_eq!(policy().decide(&fatal, 1), RetryVerdict::GiveUp);
    }

    #[test]
    fn test_max_retries_clamped() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1), Duration::ZERO);
        assert_eq!(policy.max_retries(), 1);
        assert_eq!(policy.decide(&network(), 1), RetryVerdict::GiveUp);
    }
}
