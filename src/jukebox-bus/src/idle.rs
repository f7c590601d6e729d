//! Aggregated busy/idle tracking that decides when the box powers off.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Active,
    /// `deadline` is `None` when the timeout lies beyond what `Instant` can
    /// represent; such a countdown never ends.
    IdleCounting { deadline: Option<Instant> },
    ShuttingDown,
}

/// An aggregate change reported by [`IdleController::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BecameBusy,
    BecameIdle { deadline: Option<Instant> },
}

#[derive(Debug)]
pub struct IdleController {
    idle_timeout: Duration,
    debug: bool,
    state: ControllerState,
}

impl IdleController {
    /// Starts `Active`: nothing has reported idle yet.
    pub fn new(idle_timeout: Duration, debug: bool) -> Self {
        Self {
            idle_timeout,
            debug,
            state: ControllerState::Active,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state == ControllerState::ShuttingDown
    }

    /// Feed the current aggregate. The state, and with it the deadline, only
    /// changes when the aggregate flips.
    pub fn observe(&mut self, all_idle: bool, now: Instant) -> Option<Transition> {
        match (self.state, all_idle) {
            (ControllerState::Active, true) => {
                let deadline = now.checked_add(self.idle_timeout);
                self.state = ControllerState::IdleCounting { deadline };
                tracing::debug!(timeout_secs = self.idle_timeout.as_secs(), debug = self.debug, "all workers idle");
                Some(Transition::BecameIdle { deadline })
            }
            (ControllerState::IdleCounting { .. }, false) => {
                self.state = ControllerState::Active;
                tracing::debug!("idle countdown cleared");
                Some(Transition::BecameBusy)
            }
            _ => None,
        }
    }

    /// Returns `true` exactly once, when the idle deadline passes. Never
    /// fires in debug mode.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.state {
            ControllerState::IdleCounting {
                deadline: Some(deadline),
            } if !self.debug && now >= deadline => {
                self.state = ControllerState::ShuttingDown;
                true
            }
            _ => false,
        }
    }

    /// Enter `ShuttingDown` directly. Returns `false` if already there.
    pub fn request_shutdown(&mut self) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        self.state = ControllerState::ShuttingDown;
        true
    }

    /// The deadline the router has to wake up for, if any.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            ControllerState::IdleCounting { deadline } if !self.debug => deadline,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(300);

    #[test]
    fn sustained_idle_fires_exactly_once() {
        let start = Instant::now();
        let mut controller = IdleController::new(TIMEOUT, false);

        assert_eq!(
            controller.observe(true, start),
            Some(Transition::BecameIdle {
                deadline: Some(start + TIMEOUT)
            })
        );
        // Repeated idle reports keep the first deadline.
        assert_eq!(controller.observe(true, start + Duration::from_secs(10)), None);
        assert_eq!(controller.deadline(), Some(start + TIMEOUT));

        assert!(!controller.poll(start + TIMEOUT - Duration::from_millis(1)));
        assert!(controller.poll(start + TIMEOUT));
        assert!(!controller.poll(start + 2 * TIMEOUT));
        assert!(controller.is_shutting_down());
        assert_eq!(controller.observe(false, start + 2 * TIMEOUT), None);
    }

    #[test]
    fn busy_clears_the_countdown() {
        let start = Instant::now();
        let mut controller = IdleController::new(TIMEOUT, false);
        controller.observe(true, start);

        assert_eq!(
            controller.observe(false, start + Duration::from_secs(5)),
            Some(Transition::BecameBusy)
        );
        assert_eq!(controller.deadline(), None);
        assert!(!controller.poll(start + 2 * TIMEOUT));

        let later = start + Duration::from_secs(60);
        controller.observe(true, later);
        assert_eq!(controller.deadline(), Some(later + TIMEOUT));
    }

    #[test]
    fn debug_mode_tracks_state_but_never_fires() {
        let start = Instant::now();
        let mut controller = IdleController::new(TIMEOUT, true);
        assert!(controller.observe(true, start).is_some());
        assert!(matches!(
            controller.state(),
            ControllerState::IdleCounting { .. }
        ));
        assert_eq!(controller.deadline(), None);
        assert!(!controller.poll(start + 1000 * TIMEOUT));
    }

    #[test]
    fn explicit_shutdown_request_is_one_shot() {
        let mut controller = IdleController::new(TIMEOUT, true);
        assert!(controller.request_shutdown());
        assert!(!controller.request_shutdown());
    }

    #[test]
    fn unrepresentable_deadline_never_fires() {
        let start = Instant::now();
        let mut controller = IdleController::new(Duration::MAX, false);
        assert_eq!(
            controller.observe(true, start),
            Some(Transition::BecameIdle { deadline: None })
        );
        assert_eq!(controller.deadline(), None);
        assert!(!controller.poll(start + Duration::from_secs(86_400 * 365)));
        assert_eq!(controller.observe(false, start), Some(Transition::BecameBusy));
    }
}
