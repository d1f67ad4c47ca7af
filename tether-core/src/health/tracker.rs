//! Heartbeat bookkeeping and health signals.
//!
//! Records probe outcomes over a rolling window and derives the
//! [`HealthSnapshot`] exposed to observers. Each recorded outcome also
//! yields a [`HealthSignal`] for the state machine. The tracker is plain
//! data; the timing lives in the monitor task.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant, SystemTime};

/// Thresholds that turn probe outcomes into signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    /// Round-trips above this degrade the link.
    pub latency: Duration,
    /// Consecutive failures that make the link unhealthy.
    pub failure_threshold: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            latency: Duration::from_secs(1),
            failure_threshold: 3,
        }
    }
}

/// Why the link is degraded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DegradeReason {
    HighLatency(Duration),
    ProbeFailed { consecutive: u32 },
    TokenRefreshFailed(String),
}

impl fmt::Display for DegradeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HighLatency(rtt) => write!(f, "heartbeat latency {rtt:?} above threshold"),
            Self::ProbeFailed { consecutive } => {
                write!(f, "heartbeat failed ({consecutive} consecutive)")
            }
            Self::TokenRefreshFailed(why) => write!(f, "token refresh failed: {why}"),
        }
    }
}

/// What a probe outcome means for the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthSignal {
    /// Nothing changed.
    Healthy,
    Degraded(DegradeReason),
    /// A good probe after an impaired stretch.
    Recovered,
    /// Consecutive failures reached the threshold.
    Unhealthy { consecutive: u32 },
}

/// Read-only view of connection health.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HealthSnapshot {
    /// Most recent round-trip.
    pub latency: Option<Duration>,
    /// EWMA of round-trips (α = 1/8).
    pub smoothed_latency: Option<Duration>,
    /// Failed probes within the rolling window.
    pub error_count: usize,
    /// Failed / total probes within the rolling window.
    pub error_rate: f64,
    pub consecutive_failures: u32,
    /// Wall time of the last successful heartbeat.
    pub last_heartbeat: Option<SystemTime>,
    /// Time since the current session reached Connected.
    pub uptime: Duration,
}

/// Rolling-window probe tracker.
#[derive(Debug)]
pub struct HealthTracker {
    thresholds: HealthThresholds,
    window: Duration,
    /// Probe outcomes: `(when, succeeded)`.
    samples: VecDeque<(Instant, bool)>,
    consecutive_failures: u32,
    latency: Option<Duration>,
    smoothed_rtt_us: u64,
    last_heartbeat: Option<SystemTime>,
    connected_since: Option<Instant>,
    impaired: bool,
}

impl HealthTracker {
    pub fn new(thresholds: HealthThresholds, window: Duration) -> Self {
        Self {
            thresholds,
            window,
            samples: VecDeque::with_capacity(64),
            consecutive_failures: 0,
            latency: None,
            smoothed_rtt_us: 0,
            last_heartbeat: None,
            connected_since: None,
            impaired: false,
        }
    }

    pub fn thresholds(&self) -> HealthThresholds {
        self.thresholds
    }

    /// A session reached Connected at `now`.
    pub fn session_started(&mut self, now: Instant) {
        self.connected_since = Some(now);
        self.consecutive_failures = 0;
        self.impaired = false;
    }

    /// The session ended; uptime stops counting.
    pub fn session_ended(&mut self) {
        self.connected_since = None;
    }

    /// Record a successful probe with round-trip `rtt`.
    pub fn record_success(&mut self, now: Instant, wall: SystemTime, rtt: Duration) -> HealthSignal {
        self.push(now, true);
        self.consecutive_failures = 0;
        self.latency = Some(rtt);
        self.last_heartbeat = Some(wall);
        self.smooth(rtt);

        if rtt > self.thresholds.latency {
            self.impaired = true;
            HealthSignal::Degraded(DegradeReason::HighLatency(rtt))
        } else if std::mem::take(&mut self.impaired) {
            HealthSignal::Recovered
        } else {
            HealthSignal::Healthy
        }
    }

    /// Record a probe that timed out or could not be sent.
    pub fn record_failure(&mut self, now: Instant) -> HealthSignal {
        self.push(now, false);
        self.consecutive_failures += 1;
        self.impaired = true;
        let consecutive = self.consecutive_failures;
        if consecutive >= self.thresholds.failure_threshold {
            HealthSignal::Unhealthy { consecutive }
        } else {
            HealthSignal::Degraded(DegradeReason::ProbeFailed { consecutive })
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Snapshot as of `now`.
    pub fn snapshot(&self, now: Instant) -> HealthSnapshot {
        let in_window = self
            .samples
            .iter()
            .filter(|(ts, _)| now.saturating_duration_since(*ts) <= self.window);
        let (total, errors) = in_window.fold((0usize, 0usize), |(t, e), (_, ok)| {
            (t + 1, e + usize::from(!ok))
        });
        HealthSnapshot {
            latency: self.latency,
            smoothed_latency: (self.smoothed_rtt_us > 0)
                .then(|| Duration::from_micros(self.smoothed_rtt_us)),
            error_count: errors,
            error_rate: if total == 0 {
                0.0
            } else {
                errors as f64 / total as f64
            },
            consecutive_failures: self.consecutive_failures,
            last_heartbeat: self.last_heartbeat,
            uptime: self
                .connected_since
                .map(|since| now.saturating_duration_since(since))
                .unwrap_or(Duration::ZERO),
        }
    }

    // ── Internal ─────────────────────────────────────────────────

    fn push(&mut self, now: Instant, ok: bool) {
        self.samples.push_back((now, ok));
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(ts, _)) = self.samples.front() {
            if now.saturating_duration_since(ts) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn smooth(&mut self, rtt: Duration) {
        let rtt_us = rtt.as_micros() as u64;
        if self.smoothed_rtt_us == 0 {
            self.smoothed_rtt_us = rtt_us.max(1);
        } else {
            // srtt = 7/8 * srtt + 1/8 * sample
            self.smoothed_rtt_us = self.smoothed_rtt_us * 7 / 8 + rtt_us / 8;
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthThresholds::default(), Duration::from_secs(300))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut t = HealthTracker::default();
        let now = Instant::now();
        t.record_failure(now);
        t.record_failure(now);
        assert_eq!(t.consecutive_failures(), 2);

        let sig = t.record_success(now, SystemTime::now(), ms(20));
        assert_eq!(sig, HealthSignal::Recovered);
        assert_eq!(t.consecutive_failures(), 0);
        assert_eq!(t.snapshot(now).consecutive_failures, 0);
    }

    #[test]
    fn third_failure_is_unhealthy() {
        let mut t = HealthTracker::default();
        let now = Instant::now();
        assert_eq!(
            t.record_failure(now),
            HealthSignal::Degraded(DegradeReason::ProbeFailed { consecutive: 1 })
        );
        assert_eq!(
            t.record_failure(now),
            HealthSignal::Degraded(DegradeReason::ProbeFailed { consecutive: 2 })
        );
        assert_eq!(t.record_failure(now), HealthSignal::Unhealthy { consecutive: 3 });
    }

    #[test]
    fn slow_probe_degrades_then_recovers() {
        let mut t = HealthTracker::default();
        let now = Instant::now();
        assert_eq!(t.record_success(now, SystemTime::now(), ms(10)), HealthSignal::Healthy);
        assert_eq!(
            t.record_success(now, SystemTime::now(), ms(1500)),
            HealthSignal::Degraded(DegradeReason::HighLatency(ms(1500)))
        );
        assert_eq!(t.record_success(now, SystemTime::now(), ms(10)), HealthSignal::Recovered);
        assert_eq!(t.record_success(now, SystemTime::now(), ms(10)), HealthSignal::Healthy);
    }

    #[test]
    fn error_window_evicts_old_failures() {
        let mut t = HealthTracker::new(HealthThresholds::default(), Duration::from_secs(60));
        let t0 = Instant::now();
        t.record_failure(t0);
        t.record_success(t0 + Duration::from_secs(30), SystemTime::now(), ms(5));
        let snap = t.snapshot(t0 + Duration::from_secs(30));
        assert_eq!(snap.error_count, 1);
        assert!((snap.error_rate - 0.5).abs() < f64::EPSILON);

        t.record_success(t0 + Duration::from_secs(90), SystemTime::now(), ms(5));
        let snap = t.snapshot(t0 + Duration::from_secs(90));
        assert_eq!(snap.error_count, 0);
    }

    #[test]
    fn uptime_follows_session() {
        let mut t = HealthTracker::default();
        let t0 = Instant::now();
        assert_eq!(t.snapshot(t0).uptime, Duration::ZERO);
        t.session_started(t0);
        assert_eq!(t.snapshot(t0 + Duration::from_secs(5)).uptime, Duration::from_secs(5));
        t.session_ended();
        assert_eq!(t.snapshot(t0 + Duration::from_secs(6)).uptime, Duration::ZERO);
    }

    #[test]
    fn smoothed_latency() {
        let mut t = HealthTracker::default();
        let now = Instant::now();
        t.record_success(now, SystemTime::now(), ms(10));
        assert_eq!(t.snapshot(now).smoothed_latency, Some(ms(10)));
        t.record_success(now, SystemTime::now(), ms(2));
        // 10000 * 7/8 + 2000 / 8 = 9000 µs
        assert_eq!(t.snapshot(now).smoothed_latency, Some(ms(9)));
        assert_eq!(t.snapshot(now).latency, Some(ms(2)));
    }
}
