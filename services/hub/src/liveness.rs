//! Liveness tracking for the receive loop.
//!
//! The hub waits at most `patience` for each message. When that window
//! passes with nothing received, the monitor moves from `Active` to
//! `TimedOut` and reports the silence once. The next message moves it back.
//! A timeout never stops the hub; it only marks a degraded link.

use std::time::{Duration, Instant};

/// Link state as seen from the receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Active,
    TimedOut,
}

/// Tracks time since the last received message.
#[derive(Debug)]
pub struct LivenessMonitor {
    patience: Duration,
    last_message_at: Instant,
    state: LivenessState,
    timeouts: u64,
}

impl LivenessMonitor {
    /// Start in `Active`, counting silence from `now`.
    pub fn new(patience: Duration, now: Instant) -> Self {
        Self {
            patience,
            last_message_at: now,
            state: LivenessState::Active,
            timeouts: 0,
        }
    }

    pub fn patience(&self) -> Duration {
        self.patience
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    /// Number of `Active -> TimedOut` transitions so far.
    pub fn timeouts(&self) -> u64 {
        self.timeouts
    }

    /// Record a received message.
    ///
    /// Returns the length of the silence if this message ended a timeout.
    pub fn on_message(&mut self, now: Instant) -> Option<Duration> {
        let silence = now.saturating_duration_since(self.last_message_at);
        self.last_message_at = now;

        match self.state {
            LivenessState::TimedOut => {
                self.state = LivenessState::Active;
                Some(silence)
            }
            LivenessState::Active => None,
        }
    }

    /// Check for expired patience.
    ///
    /// Returns the elapsed silence only on the `Active -> TimedOut`
    /// transition; later checks during the same silence return `None`.
    pub fn check(&mut self, now: Instant) -> Option<Duration> {
        let silence = now.saturating_duration_since(self.last_message_at);

        if self.state == LivenessState::Active && silence >= self.patience {
            self.state = LivenessState::TimedOut;
            self.timeouts += 1;
            return Some(silence);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_active() {
        let monitor = LivenessMonitor::new(Duration::from_secs(10), Instant::now());
        assert_eq!(monitor.state(), LivenessState::Active);
        assert_eq!(monitor.timeouts(), 0);
    }

    #[test]
    fn test_no_timeout_within_patience() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(Duration::from_secs(10), start);

        assert_eq!(monitor.check(start + Duration::from_secs(9)), None);
        assert_eq!(monitor.state(), LivenessState::Active);
    }

    #[test]
    fn test_timeout_reported_once() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(Duration::from_secs(10), start);

        assert_eq!(
            monitor.check(start + Duration::from_secs(10)),
            Some(Duration::from_secs(10))
        );
        assert_eq!(monitor.state(), LivenessState::TimedOut);

        assert_eq!(monitor.check(start + Duration::from_secs(20)), None);
        assert_eq!(monitor.check(start + Duration::from_secs(30)), None);
        assert_eq!(monitor.timeouts(), 1);
    }

    #[test]
    fn test_message_recovers_and_rearms() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(Duration::from_secs(10), start);

        monitor.check(start + Duration::from_secs(15));
        let recovered = monitor.on_message(start + Duration::from_secs(25));
        assert_eq!(recovered, Some(Duration::from_secs(25)));
        assert_eq!(monitor.state(), LivenessState::Active);

        // Silence is measured from the latest message
        assert_eq!(monitor.check(start + Duration::from_secs(30)), None);
        assert!(monitor.check(start + Duration::from_secs(35)).is_some());
        assert_eq!(monitor.timeouts(), 2);
    }

    #[test]
    fn test_message_while_active_reports_nothing() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(Duration::from_secs(10), start);
        assert_eq!(monitor.on_message(start + Duration::from_secs(1)), None);
    }
}
