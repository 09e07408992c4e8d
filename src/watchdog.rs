//! Caller inactivity detection.
//!
//! A cooperative deadline owned by the session driver's own select loop:
//! the driver sleeps until [`SilenceWatchdog::deadline`] and then calls
//! [`SilenceWatchdog::on_deadline`]. No timer thread, no cross-context
//! mutation; the driver decides what to do with a `Fired` outcome on its
//! own execution context.
//!
//! States: `Inactive -> Active -> Fired`. `Fired` is terminal and latched,
//! so at most one termination trigger can ever be produced.

use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug, Clone, Copy)]
enum State {
    Inactive,
    Active {
        last_activity: Instant,
        deadline: Instant,
    },
    Fired,
}

/// What the driver should do after a deadline expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineOutcome {
    /// The quiet period elapsed in full; terminate the session.
    Fired {
        /// Observed silence duration in whole milliseconds
        elapsed_ms: u64,
    },
    /// Activity raced the deadline; re-armed for the remaining delta.
    Rearmed,
    /// Not active (stopped or already fired); nothing to do.
    Idle,
}

/// Inactivity timer driving session termination after a quiet period.
#[derive(Debug)]
pub struct SilenceWatchdog {
    timeout: Duration,
    state: State,
}

impl SilenceWatchdog {
    /// Create an inactive watchdog with the given quiet period.
    pub fn new(timeout: Duration) -> Self {
        SilenceWatchdog {
            timeout,
            state: State::Inactive,
        }
    }

    /// Configured quiet period.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the watchdog is armed.
    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Active { .. })
    }

    /// Whether the watchdog has fired. Latched; only `stop()` leaves it.
    pub fn has_fired(&self) -> bool {
        matches!(self.state, State::Fired)
    }

    /// Arm the watchdog: stamp activity now and set the deadline one full
    /// timeout away. No-op when already fired.
    pub fn start(&mut self, now: Instant) {
        if self.has_fired() {
            return;
        }
        self.state = State::Active {
            last_activity: now,
            deadline: now + self.timeout,
        };
        debug!(timeout_secs = self.timeout.as_secs(), "silence watchdog armed");
    }

    /// Record activity: re-stamp and replace the deadline. Only effective
    /// while active.
    pub fn reset(&mut self, now: Instant) {
        if let State::Active { .. } = self.state {
            self.state = State::Active {
                last_activity: now,
                deadline: now + self.timeout,
            };
        }
    }

    /// Disarm from any state, including fired. Idempotent.
    pub fn stop(&mut self) {
        self.state = State::Inactive;
    }

    /// The instant the driver should sleep until, when armed.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            State::Active { deadline, .. } => Some(deadline),
            _ => None,
        }
    }

    /// Current silence duration; zero when not active.
    pub fn silence_duration(&self, now: Instant) -> Duration {
        match self.state {
            State::Active { last_activity, .. } => now.saturating_duration_since(last_activity),
            _ => Duration::ZERO,
        }
    }

    /// Handle an expired deadline.
    ///
    /// Fires only if the full timeout elapsed since the last activity and
    /// the watchdog is still active; if activity raced the deadline, re-arms
    /// for the remaining delta instead.
    pub fn on_deadline(&mut self, now: Instant) -> DeadlineOutcome {
        let State::Active { last_activity, .. } = self.state else {
            return DeadlineOutcome::Idle;
        };
        let elapsed = now.saturating_duration_since(last_activity);
        if elapsed >= self.timeout {
            self.state = State::Fired;
            DeadlineOutcome::Fired {
                elapsed_ms: elapsed.as_millis() as u64,
            }
        } else {
            let remaining = self.timeout - elapsed;
            self.state = State::Active {
                last_activity,
                deadline: now + remaining,
            };
            debug!(remaining_ms = remaining.as_millis() as u64, "deadline raced by activity");
            DeadlineOutcome::Rearmed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: Instant, secs: u64) -> Instant {
        base + Duration::from_secs(secs)
    }

    #[test]
    fn test_starts_inactive() {
        let wd = SilenceWatchdog::new(Duration::from_secs(30));
        assert!(!wd.is_active());
        assert!(wd.deadline().is_none());
    }

    #[test]
    fn test_reset_before_start_is_noop() {
        let mut wd = SilenceWatchdog::new(Duration::from_secs(30));
        wd.reset(Instant::now());
        assert!(!wd.is_active());
    }

    #[test]
    fn test_reset_replaces_deadline() {
        // timeout=30s, reset at t=20 must not fire at t=45 (elapsed 25 < 30)
        // but must fire at t=51 (elapsed 31).
        let base = Instant::now();
        let mut wd = SilenceWatchdog::new(Duration::from_secs(30));
        wd.start(base);
        wd.reset(at(base, 20));
        assert_eq!(wd.deadline(), Some(at(base, 50)));

        assert_eq!(wd.on_deadline(at(base, 45)), DeadlineOutcome::Rearmed);
        assert!(wd.is_active());

        match wd.on_deadline(at(base, 51)) {
            DeadlineOutcome::Fired { elapsed_ms } => assert_eq!(elapsed_ms, 31_000),
            other => panic!("expected fire, got {other:?}"),
        }
    }

    #[test]
    fn test_rearm_uses_remaining_delta() {
        let base = Instant::now();
        let mut wd = SilenceWatchdog::new(Duration::from_secs(30));
        wd.start(base);
        // Activity at t=20 raced a deadline check at t=30: 10s remain.
        wd.reset(at(base, 20));
        wd.on_deadline(at(base, 30));
        assert_eq!(wd.deadline(), Some(at(base, 50)));
    }

    #[test]
    fn test_fires_at_most_once() {
        let base = Instant::now();
        let mut wd = SilenceWatchdog::new(Duration::from_secs(30));
        wd.start(base);
        assert!(matches!(
            wd.on_deadline(at(base, 31)),
            DeadlineOutcome::Fired { .. }
        ));
        assert!(wd.has_fired());
        // A second expiry is impossible once latched.
        assert_eq!(wd.on_deadline(at(base, 62)), DeadlineOutcome::Idle);
        // As are resets and restarts.
        wd.reset(at(base, 63));
        wd.start(at(base, 64));
        assert!(!wd.is_active());
    }

    #[test]
    fn test_stop_is_idempotent_and_unlatches() {
        let base = Instant::now();
        let mut wd = SilenceWatchdog::new(Duration::from_secs(30));
        wd.start(base);
        wd.stop();
        wd.stop();
        assert!(!wd.is_active());
        assert_eq!(wd.on_deadline(at(base, 31)), DeadlineOutcome::Idle);

        // A stopped watchdog can be armed again for a new session.
        wd.start(at(base, 40));
        assert!(wd.is_active());
    }

    #[test]
    fn test_silence_duration() {
        let base = Instant::now();
        let mut wd = SilenceWatchdog::new(Duration::from_secs(30));
        assert_eq!(wd.silence_duration(base), Duration::ZERO);
        wd.start(base);
        assert_eq!(wd.silence_duration(at(base, 7)), Duration::from_secs(7));
    }
}
