/// Transfer-rate watchdog for a single child invocation.
///
/// Fed one `TelemetrySample` at a time. A single low sample is tolerated;
/// from the second consecutive low sample on, the time since the last
/// acceptable sample is compared against `stale_after` and the child is
/// terminated once it is exceeded.
use crate::progress::TelemetrySample;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Mutable per-invocation watchdog state, owned by the supervisor loop.
#[derive(Debug, Clone)]
pub struct WatchdogState {
    /// True if the immediately preceding sample was at or below the floor.
    pub low_rate_streak: bool,
    /// When the last sample above the floor was seen (starts at session start).
    pub last_acceptable_time: Instant,
    /// Most recent non-progress line, usually the file being transferred.
    pub last_status_line: String,
    /// True while a burst of progress lines is being rendered in place.
    pub in_progress_run: bool,
}

impl WatchdogState {
    pub fn new(started: Instant) -> Self {
        Self {
            low_rate_streak: false,
            last_acceptable_time: started,
            last_status_line: String::new(),
            in_progress_run: false,
        }
    }
}

/// Outcome of evaluating one sample.
#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    /// Rate above the floor; staleness clock reset.
    Healthy,
    /// First low sample after a healthy one; nothing else happens yet.
    Tolerated,
    /// Consecutive low samples, still inside the stale-after window.
    Degraded { grace_remaining: Duration },
    /// Consecutive low samples and the window has been exceeded.
    Terminate { stale_for: Duration },
}

impl RateDecision {
    #[cfg(test)]
    pub fn should_terminate(&self) -> bool {
        matches!(self, RateDecision::Terminate { .. })
    }
}

/// Rate-degradation policy.
#[derive(Debug, Clone)]
pub struct RatePolicy {
    rate_floor: u64,
    stale_after: Duration,
}

impl RatePolicy {
    pub fn new(rate_floor: u64, stale_after: Duration) -> Self {
        Self {
            rate_floor,
            stale_after,
        }
    }

    /// Evaluate a sample taken at `now` and update `state`.
    ///
    /// Only a sample strictly above the floor advances
    /// `last_acceptable_time`, so an occasional spike restarts the clock.
    pub fn evaluate(
        &self,
        sample: &TelemetrySample,
        state: &mut WatchdogState,
        now: Instant,
    ) -> RateDecision {
        if sample.transfer_rate > self.rate_floor {
            state.last_acceptable_time = state.last_acceptable_time.max(now);
            state.low_rate_streak = false;
            return RateDecision::Healthy;
        }

        if !state.low_rate_streak {
            state.low_rate_streak = true;
            debug!(
                rate = sample.transfer_rate,
                floor = self.rate_floor,
                "single low-rate sample tolerated"
            );
            return RateDecision::Tolerated;
        }

        let stale_for = now.saturating_duration_since(state.last_acceptable_time);
        if stale_for > self.stale_after {
            return RateDecision::Terminate { stale_for };
        }

        let grace_remaining = self.stale_after - stale_for;
        warn!(
            rate = sample.transfer_rate,
            floor = self.rate_floor,
            grace_remaining_secs = format!("{:.2}", grace_remaining.as_secs_f64()),
            "transfer rate too low"
        );
        RateDecision::Degraded { grace_remaining }
    }
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self::new(100_000, Duration::from_secs(30))
    }
}
