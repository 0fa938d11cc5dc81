//! Inactivity watchdog.
//!
//! Holds deadlines only; the session loop sleeps until [`Watchdog::deadline`]
//! and calls [`Watchdog::poll`] when it fires, so nothing outlives the
//! session.

use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);
/// How long the goodbye notice may take before we disconnect anyway.
pub const DEFAULT_GOODBYE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Idle too long: stop audio and speak the goodbye notice.
    Goodbye,
    /// The goodbye notice did not finish in time.
    Disconnect,
}

#[derive(Debug)]
pub struct Watchdog {
    timeout: Duration,
    grace: Duration,
    armed: bool,
    deadline: Option<Instant>,
    /// Set while a goodbye is in flight; a second one is never started.
    goodbye_deadline: Option<Instant>,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new(DEFAULT_INACTIVITY_TIMEOUT, DEFAULT_GOODBYE_GRACE)
    }
}

impl Watchdog {
    pub fn new(timeout: Duration, grace: Duration) -> Self {
        Self {
            timeout,
            grace,
            armed: false,
            deadline: None,
            goodbye_deadline: None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn goodbye_in_progress(&self) -> bool {
        self.goodbye_deadline.is_some()
    }

    /// Arm while `active` (connected and recording or playing), disarm
    /// otherwise. Arming starts a fresh window; staying armed keeps it.
    pub fn set_active(&mut self, active: bool, now: Instant) {
        if active && !self.armed {
            self.armed = true;
            self.deadline = Some(now + self.timeout);
        } else if !active && self.armed {
            self.armed = false;
            self.deadline = None;
        }
    }

    /// Activity seen; restart the window if armed.
    pub fn touch(&mut self, now: Instant) {
        if self.armed {
            self.deadline = Some(now + self.timeout);
        }
    }

    /// The next instant the session loop must wake for, if any.
    pub fn deadline(&self) -> Option<Instant> {
        match (self.goodbye_deadline, self.deadline) {
            (Some(goodbye), _) => Some(goodbye),
            (None, deadline) => deadline,
        }
    }

    pub fn poll(&mut self, now: Instant) -> Option<WatchdogAction> {
        if let Some(goodbye) = self.goodbye_deadline {
            if now >= goodbye {
                self.goodbye_deadline = None;
                return Some(WatchdogAction::Disconnect);
            }
            return None;
        }
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.armed = false;
                self.deadline = None;
                self.goodbye_deadline = Some(now + self.grace);
                Some(WatchdogAction::Goodbye)
            }
            _ => None,
        }
    }

    /// The goodbye notice finished (or failed). Returns true if a goodbye was
    /// in flight and the caller should now disconnect.
    pub fn goodbye_finished(&mut self) -> bool {
        self.goodbye_deadline.take().is_some()
    }

    /// Drop every deadline, including an in-flight goodbye.
    pub fn disarm(&mut self) {
        self.armed = false;
        self.deadline = None;
        self.goodbye_deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn idle_watchdog_never_fires() {
        let start = Instant::now();
        let mut dog = Watchdog::new(secs(30), secs(5));
        assert_eq!(dog.deadline(), None);
        assert_eq!(dog.poll(start + secs(600)), None);
    }

    #[test]
    fn fires_once_after_timeout_then_waits_for_goodbye() {
        let start = Instant::now();
        let mut dog = Watchdog::new(secs(30), secs(5));
        dog.set_active(true, start);
        assert_eq!(dog.deadline(), Some(start + secs(30)));
        assert_eq!(dog.poll(start + secs(29)), None);

        assert_eq!(dog.poll(start + secs(30)), Some(WatchdogAction::Goodbye));
        assert!(dog.goodbye_in_progress());
        // Re-arming or polling again does not start a second goodbye.
        assert_eq!(dog.poll(start + secs(31)), None);
        dog.touch(start + secs(31));
        assert_eq!(dog.deadline(), Some(start + secs(35)));

        assert!(dog.goodbye_finished());
        assert!(!dog.goodbye_finished());
        assert_eq!(dog.deadline(), None);
    }

    #[test]
    fn activity_pushes_the_deadline_back() {
        let start = Instant::now();
        let mut dog = Watchdog::new(secs(30), secs(5));
        dog.set_active(true, start);
        dog.touch(start + secs(20));
        assert_eq!(dog.poll(start + secs(31)), None);
        // Staying active keeps the current window.
        dog.set_active(true, start + secs(40));
        assert_eq!(dog.deadline(), Some(start + secs(50)));
    }

    #[test]
    fn inactive_touches_do_not_arm() {
        let start = Instant::now();
        let mut dog = Watchdog::new(secs(30), secs(5));
        dog.touch(start);
        assert!(!dog.is_armed());
        dog.set_active(true, start);
        dog.set_active(false, start + secs(1));
        assert_eq!(dog.deadline(), None);
    }

    #[test]
    fn stuck_goodbye_times_out_into_disconnect() {
        let start = Instant::now();
        let mut dog = Watchdog::new(secs(30), secs(5));
        dog.set_active(true, start);
        assert_eq!(dog.poll(start + secs(30)), Some(WatchdogAction::Goodbye));
        assert_eq!(dog.poll(start + secs(35)), Some(WatchdogAction::Disconnect));
        assert!(!dog.goodbye_in_progress());
    }

    #[test]
    fn disarm_cancels_an_in_flight_goodbye() {
        let start = Instant::now();
        let mut dog = Watchdog::new(secs(30), secs(5));
        dog.set_active(true, start);
        dog.poll(start + secs(30));
        dog.disarm();
        assert_eq!(dog.deadline(), None);
        assert!(!dog.goodbye_finished());
    }
}
