use crate::registry::Registry;
use jukebox_plugin::{ChannelError, Frame};
use std::time::{Duration, Instant};

/// Next due time of one worker's periodic `tick`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickSchedule {
    interval: Duration,
    /// `None` once the next boundary is past what `Instant` can represent.
    next_due: Option<Instant>,
}

impl TickSchedule {
    pub fn new(interval: Duration, spawned_at: Instant) -> Self {
        Self {
            interval,
            next_due: spawned_at.checked_add(interval),
        }
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.next_due
    }

    /// Returns whether a tick is due at `now`. A due schedule advances in
    /// whole intervals from the previous due time to the first boundary
    /// strictly after `now`, so missed cycles collapse into one tick.
    pub fn poll(&mut self, now: Instant) -> bool {
        let Some(due) = self.next_due.filter(|due| now >= *due) else {
            return false;
        };
        let behind = now.duration_since(due).as_nanos();
        let interval = self.interval.as_nanos().max(1);
        let steps = u32::try_from(behind / interval)
            .unwrap_or(u32::MAX)
            .saturating_add(1);
        self.next_due = due.checked_add(self.interval.saturating_mul(steps));
        true
    }
}

/// Send one `tick` to every worker whose schedule is due. Returns how many
/// ticks were queued.
pub fn fire_due(registry: &mut Registry, now: Instant) -> usize {
    let mut fired = 0;
    for handle in registry.handles_mut() {
        if handle.is_terminating() {
            continue;
        }
        let Some(schedule) = handle.tick.as_mut() else {
            continue;
        };
        if !schedule.poll(now) {
            continue;
        }
        match handle.channel.send(Frame::tick()) {
            Ok(()) => fired += 1,
            Err(ChannelError::Full) => {
                tracing::warn!(worker = %handle.id(), "tick dropped, worker queue is full");
            }
            Err(ChannelError::Closed) => {
                tracing::debug!(worker = %handle.id(), "tick not sent, channel closed");
            }
        }
    }
    fired
}

/// Earliest pending tick across all workers.
pub fn next_due(registry: &Registry) -> Option<Instant> {
    registry
        .handles()
        .filter(|handle| !handle.is_terminating())
        .filter_map(|handle| handle.tick.and_then(|schedule| schedule.next_due()))
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn first_tick_is_one_interval_after_spawn() {
        let start = Instant::now();
        let mut schedule = TickSchedule::new(SECOND, start);
        assert!(!schedule.poll(start));
        assert!(!schedule.poll(start + Duration::from_millis(999)));
        assert!(schedule.poll(start + SECOND));
        assert_eq!(schedule.next_due(), Some(start + 2 * SECOND));
    }

    #[test]
    fn late_polls_do_not_drift() {
        let start = Instant::now();
        let mut schedule = TickSchedule::new(SECOND, start);
        // Each poll lands 300ms late; due times stay on the grid.
        for cycle in 1..=50u32 {
            let now = start + cycle * SECOND + Duration::from_millis(300);
            assert!(schedule.poll(now));
            assert_eq!(schedule.next_due(), Some(start + (cycle + 1) * SECOND));
        }
    }

    #[test]
    fn missed_cycles_fire_once_and_skip_ahead() {
        let start = Instant::now();
        let mut schedule = TickSchedule::new(SECOND, start);
        let now = start + Duration::from_millis(4_500);
        assert!(schedule.poll(now));
        assert!(!schedule.poll(now));
        assert_eq!(schedule.next_due(), Some(start + 5 * SECOND));
    }

    #[test]
    fn exact_boundary_advances_past_now() {
        let start = Instant::now();
        let mut schedule = TickSchedule::new(SECOND, start);
        assert!(schedule.poll(start + 3 * SECOND));
        assert_eq!(schedule.next_due(), Some(start + 4 * SECOND));
    }

    #[test]
    fn huge_interval_never_comes_due() {
        let start = Instant::now();
        let mut schedule = TickSchedule::new(Duration::MAX, start);
        assert_eq!(schedule.next_due(), None);
        assert!(!schedule.poll(start + Duration::from_secs(86_400)));
    }
}
