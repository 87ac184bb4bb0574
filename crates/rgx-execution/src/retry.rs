//! Bounded exponential backoff.
//!
//! | Error class | Decision |
//! |---|---|
//! | Permanent | GiveUp immediately |
//! | Transient, attempts exhausted | GiveUp |
//! | Transient, next delay would overrun the total budget | GiveUp |
//! | Transient otherwise | Retry after `min(base * 2^(n-1), max) * (1 - ratio * u)` |
//!
//! `u` is drawn from a `StdRng` seeded by `(seed, attempt)`, so a given policy
//! produces the same delay sequence on every run. Rate limits use their own
//! (larger) base delay.
//!
//! The policy only decides. Waiting is the caller's job, through its clock.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use rgx_config::SessionConfig;

use crate::error::{ErrorKind, TransientKind};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GiveUpReason {
    PermanentError,
    MaxAttempts,
    MaxTotalDuration,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp(GiveUpReason),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_total_duration: Duration,
    pub base_delay: Duration,
    pub rate_limit_base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the capped delay that jitter may shave off, in `[0, 1]`.
    pub jitter_ratio: f64,
    pub seed: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &SessionConfig) -> Self {
        Self {
            max_attempts: cfg.max_retry_attempts.max(1),
            max_total_duration: Duration::from_millis(cfg.max_total_retry_duration_ms),
            base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
            rate_limit_base_delay: Duration::from_millis(cfg.rate_limit_base_delay_ms),
            max_delay: Duration::from_millis(cfg.retry_max_delay_ms),
            jitter_ratio: cfg.retry_jitter_ratio.clamp(0.0, 1.0),
            seed: cfg.retry_jitter_seed,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }

    /// Decide what to do after `attempt` tries (1-based) have failed with
    /// `kind`, having spent `elapsed` since the first try.
    pub fn decide(&self, kind: ErrorKind, attempt: u32, elapsed: Duration) -> RetryDecision {
        let transient = match kind {
            ErrorKind::Permanent(_) => return RetryDecision::GiveUp(GiveUpReason::PermanentError),
            ErrorKind::Transient(t) => t,
        };
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp(GiveUpReason::MaxAttempts);
        }
        let delay = self.delay_for(transient, attempt);
        if elapsed.saturating_add(delay) > self.max_total_duration {
            return RetryDecision::GiveUp(GiveUpReason::MaxTotalDuration);
        }
        RetryDecision::Retry(delay)
    }

    /// Backoff before attempt `attempt + 1`.
    pub fn delay_for(&self, kind: TransientKind, attempt: u32) -> Duration {
        let base = match kind {
            TransientKind::RateLimited => self.rate_limit_base_delay,
            TransientKind::Timeout | TransientKind::Unavailable => self.base_delay,
        };
        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let capped = base_ms.saturating_mul(factor).min(max_ms);

        if self.jitter_ratio <= 0.0 || capped == 0 {
            return Duration::from_millis(capped);
        }
        let u: f64 = self.rng_for(attempt).gen();
        let shave = (capped as f64 * self.jitter_ratio * u).floor() as u64;
        Duration::from_millis(capped - shave.min(capped))
    }

    fn rng_for(&self, attempt: u32) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PermanentKind;

    const TIMEOUT: ErrorKind = ErrorKind::Transient(TransientKind::Timeout);

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            max_total_duration: Duration::from_secs(30),
            base_delay: Duration::from_millis(100),
            rate_limit_base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
            jitter_ratio: 0.0,
            seed: 0,
        }
    }

    #[test]
    fn permanent_never_retries() {
        let p = policy();
        assert_eq!(
            p.decide(ErrorKind::Permanent(PermanentKind::Rejected), 1, Duration::ZERO),
            RetryDecision::GiveUp(GiveUpReason::PermanentError)
        );
    }

    #[test]
    fn exponential_without_jitter() {
        let p = policy();
        let delays: Vec<_> = (1..5)
            .map(|n| match p.decide(TIMEOUT, n, Duration::ZERO) {
                RetryDecision::Retry(d) => d.as_millis(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800]);
        assert_eq!(
            p.decide(TIMEOUT, 5, Duration::ZERO),
            RetryDecision::GiveUp(GiveUpReason::MaxAttempts)
        );
    }

    #[test]
    fn delay_is_capped() {
        let mut p = policy();
        p.max_attempts = 100;
        assert_eq!(p.delay_for(TransientKind::Timeout, 40), Duration::from_millis(10_000));
        assert_eq!(p.delay_for(TransientKind::Timeout, 80), Duration::from_millis(10_000));
    }

    #[test]
    fn rate_limit_uses_its_own_base() {
        let p = policy();
        assert_eq!(
            p.decide(ErrorKind::Transient(TransientKind::RateLimited), 1, Duration::ZERO),
            RetryDecision::Retry(Duration::from_millis(1_000))
        );
    }

    #[test]
    fn total_duration_budget() {
        let mut p = policy();
        p.max_total_duration = Duration::from_millis(250);
        assert_eq!(
            p.decide(TIMEOUT, 1, Duration::ZERO),
            RetryDecision::Retry(Duration::from_millis(100))
        );
        assert_eq!(
            p.decide(TIMEOUT, 2, Duration::from_millis(100)),
            RetryDecision::GiveUp(GiveUpReason::MaxTotalDuration)
        );
    }

    #[test]
    fn jitter_is_deterministic_and_bounded() {
        let mut a = policy();
        a.jitter_ratio = 0.5;
        a.seed = 42;
        let b = a.clone();
        for n in 1..5 {
            let da = a.delay_for(TransientKind::Timeout, n);
            assert_eq!(da, b.delay_for(TransientKind::Timeout, n));
            let capped = 100u64 << (n - 1);
            let ms = da.as_millis() as u64;
            assert!(ms <= capped && ms >= capped / 2, "attempt {n}: {ms}");
        }
    }

    #[test]
    fn from_config_maps_fields() {
        let p = RetryPolicy::from_config(&SessionConfig::default());
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.base_delay, Duration::from_millis(100));
        assert_eq!(p.rate_limit_base_delay, Duration::from_millis(1_000));
        assert_eq!(p.max_total_duration, Duration::from_secs(30));
    }
}
