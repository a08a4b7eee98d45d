/// Silence detection for the child's output streams.
///
/// Independent of the rate watchdog: this only looks at how long it has been
/// since any byte arrived on stdout or stderr.
use std::time::{Duration, Instant};

/// Last time the child produced output.
#[derive(Debug, Clone)]
pub struct ActivityState {
    pub last_activity_time: Instant,
}

impl ActivityState {
    pub fn new(started: Instant) -> Self {
        Self {
            last_activity_time: started,
        }
    }

    /// Record that at least one byte was read at `now`.
    pub fn record(&mut self, now: Instant) {
        self.last_activity_time = self.last_activity_time.max(now);
    }

    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity_time)
    }
}

/// Escalation step requested by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActivityAction {
    None,
    Terminate,
    Kill,
}

/// Two-step silence ladder: graceful terminate, then forceful kill.
#[derive(Debug, Clone)]
pub struct ActivityMonitor {
    terminate_after: Duration,
    kill_after: Duration,
}

impl ActivityMonitor {
    pub fn new(terminate_after: Duration, kill_after: Duration) -> Self {
        Self {
            terminate_after,
            kill_after,
        }
    }

    /// Decide what to do about a child that has been quiet until `now`.
    ///
    /// `Kill` is returned once `kill_after` is exceeded whether or not a
    /// terminate was ever sent.
    pub fn check(&self, state: &ActivityState, now: Instant) -> ActivityAction {
        let silent_for = state.silent_for(now);
        if silent_for > self.kill_after {
            ActivityAction::Kill
        } else if silent_for > self.terminate_after {
            ActivityAction::Terminate
        } else {
            ActivityAction::None
        }
    }
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(120))
    }
}
