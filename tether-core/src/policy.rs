//! Reconnection policy: a pure decision function, no I/O.
//!
//! Given the number of consecutive failed attempts and how long the
//! failure streak has lasted, decide whether to retry now, retry after
//! a delay, or give up. Delays grow geometrically from `base` by
//! `multiplier` and are capped at `max_delay`.
//!
//! ```text
//! failures:  1     2     3     4     5 ...
//! delay:     base  b*m   b*m²  b*m³  ... ≤ max_delay
//! ```

use std::time::{Duration, Instant};

use crate::config::ReconnectConfig;

/// Outcome of consulting the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    RetryNow,
    RetryAfter(Duration),
    GiveUp,
}

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// `0` means unlimited.
    pub max_attempts: u32,
    pub max_elapsed: Option<Duration>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(cfg: &ReconnectConfig) -> Self {
        Self {
            base: Duration::from_millis(cfg.base_delay_ms),
            multiplier: cfg.multiplier,
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            max_attempts: cfg.max_attempts,
            max_elapsed: (cfg.max_elapsed_secs > 0)
                .then(|| Duration::from_secs(cfg.max_elapsed_secs)),
        }
    }
}

impl ReconnectPolicy {
    /// Decide what to do after `failures` consecutive failed attempts
    /// (`failures >= 1`) spanning `elapsed`.
    pub fn decide(&self, failures: u32, elapsed: Duration) -> ReconnectDecision {
        if self.max_attempts > 0 && failures >= self.max_attempts {
            return ReconnectDecision::GiveUp;
        }
        if self.max_elapsed.is_some_and(|max| elapsed >= max) {
            return ReconnectDecision::GiveUp;
        }
        let delay = self.delay_for(failures);
        if delay.is_zero() {
            ReconnectDecision::RetryNow
        } else {
            ReconnectDecision::RetryAfter(delay)
        }
    }

    /// Backoff delay after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.powi(exponent);
        let millis = self.base.as_millis() as f64 * factor;
        let cap = self.max_delay.as_millis() as f64;
        if !millis.is_finite() || millis >= cap {
            self.max_delay
        } else {
            Duration::from_millis(millis as u64)
        }
    }
}

// ── ReconnectAttempt ─────────────────────────────────────────────

/// Derived retry bookkeeping, recomputed on each failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectAttempt {
    /// Consecutive failed attempts so far.
    pub attempt: u32,
    /// Earliest instant the next attempt may start.
    pub next_allowed: Instant,
}

impl ReconnectAttempt {
    /// Apply `decision` made at `now`. Returns `None` when giving up.
    pub fn schedule(attempt: u32, decision: ReconnectDecision, now: Instant) -> Option<Self> {
        let next_allowed = match decision {
            ReconnectDecision::RetryNow => now,
            ReconnectDecision::RetryAfter(d) => now + d,
            ReconnectDecision::GiveUp => return None,
        };
        Some(Self {
            attempt,
            next_allowed,
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            max_attempts: 0,
            max_elapsed: None,
        }
    }

    #[test]
    fn geometric_growth_with_cap() {
        let p = policy();
        let delays: Vec<u64> = (1..=6).map(|n| p.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn schedule_matches_attempt_times() {
        // Attempts at t = 0, 1, 3, 7.
        let p = policy();
        let mut t = Duration::ZERO;
        let mut times = vec![t];
        for failures in 1..=3 {
            match p.decide(failures, t) {
                ReconnectDecision::RetryAfter(d) => t += d,
                other => panic!("unexpected {other:?}"),
            }
            times.push(t);
        }
        let secs: Vec<u64> = times.iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![0, 1, 3, 7]);
    }

    #[test]
    fn gives_up_at_max_attempts() {
        let p = ReconnectPolicy {
            max_attempts: 3,
            ..policy()
        };
        assert!(matches!(p.decide(2, Duration::ZERO), ReconnectDecision::RetryAfter(_)));
        assert_eq!(p.decide(3, Duration::ZERO), ReconnectDecision::GiveUp);
    }

    #[test]
    fn gives_up_after_max_elapsed() {
        let p = ReconnectPolicy {
            max_elapsed: Some(Duration::from_secs(30)),
            ..policy()
        };
        assert!(matches!(p.decide(1, Duration::from_secs(29)), ReconnectDecision::RetryAfter(_)));
        assert_eq!(p.decide(1, Duration::from_secs(30)), ReconnectDecision::GiveUp);
    }

    #[test]
    fn zero_base_retries_now() {
        let p = ReconnectPolicy {
            base: Duration::ZERO,
            ..policy()
        };
        assert_eq!(p.decide(4, Duration::ZERO), ReconnectDecision::RetryNow);
    }

    #[test]
    fn huge_failure_counts_stay_capped() {
        assert_eq!(policy().delay_for(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn attempt_schedule() {
        let now = Instant::now();
        let a = ReconnectAttempt::schedule(2, ReconnectDecision::RetryAfter(Duration::from_secs(2)), now)
            .unwrap();
        assert_eq!(a.next_allowed, now + Duration::from_secs(2));
        assert!(ReconnectAttempt::schedule(9, ReconnectDecision::GiveUp, now).is_none());
    }

    #[test]
    fn from_config_maps_zero_elapsed_to_unlimited() {
        let p = ReconnectPolicy::from(&ReconnectConfig::default());
        assert_eq!(p.max_elapsed, None);
        assert_eq!(p.max_attempts, 10);
        assert_eq!(p.base, Duration::from_secs(1));
    }
}
