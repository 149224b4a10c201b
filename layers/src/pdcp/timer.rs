//! t-Reordering controller
//!
//! Idle until a gap leaves PDUs in the buffer, then armed with a snapshot of
//! the COUNT the receiver was waiting for. Everything below that snapshot is
//! force-delivered when the timer fires.

use common::sim::{EventId, TimerId, TimerService};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Armed {
    handle: EventId,
    expected_count: u64,
}

/// Single-shot reordering timer of one bearer
#[derive(Debug)]
pub struct ReorderingTimer {
    delay: Duration,
    timer: TimerId,
    armed: Option<Armed>,
}

impl ReorderingTimer {
    pub fn new(delay: Duration, timer: TimerId) -> Self {
        Self {
            delay,
            timer,
            armed: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// COUNT snapshot taken when the timer was armed
    pub fn expected_count(&self) -> Option<u64> {
        self.armed.map(|a| a.expected_count)
    }

    /// Virtual time at which the armed timer fires
    pub fn deadline(&self) -> Option<Duration> {
        self.armed.map(|a| a.handle.deadline())
    }

    /// Start the timer. No-op when already armed.
    pub fn arm(&mut self, timers: &mut dyn TimerService, expected_count: u64) -> bool {
        if self.armed.is_some() {
            return false;
        }
        let handle = timers.schedule_timer(self.delay, self.timer);
        debug!(
            "t-Reordering started, expires at {:?}, waiting for COUNT {}",
            handle.deadline(),
            expected_count
        );
        self.armed = Some(Armed {
            handle,
            expected_count,
        });
        true
    }

    /// Stop the timer. Stopping an idle timer does nothing.
    pub fn cancel(&mut self, timers: &mut dyn TimerService) {
        if let Some(armed) = self.armed.take() {
            timers.cancel_timer(armed.handle);
            debug!("t-Reordering stopped");
        }
    }

    /// Consume the expiry: returns the snapshot and goes idle. Returns
    /// `None` if the timer was not armed.
    pub fn expire(&mut self) -> Option<u64> {
        self.armed.take().map(|a| a.expected_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::sim::Scheduler;
    use common::types::{Lcid, Rnti};

    #[derive(Debug)]
    struct Fired(TimerId);

    impl From<TimerId> for Fired {
        fn from(t: TimerId) -> Self {
            Fired(t)
        }
    }

    fn timer_id() -> TimerId {
        TimerId::PdcpReordering {
            rnti: Rnti::new(1),
            lcid: Lcid(3),
        }
    }

    #[test]
    fn test_arm_once() {
        let mut sched: Scheduler<Fired> = Scheduler::new();
        let mut t = ReorderingTimer::new(Duration::from_millis(100), timer_id());
        assert!(t.arm(&mut sched, 7));
        assert!(!t.arm(&mut sched, 9));
        assert_eq!(t.expected_count(), Some(7));
        assert_eq!(t.deadline(), Some(Duration::from_millis(100)));
        assert_eq!(sched.pending(), 1);
    }

    #[test]
    fn test_cancel_removes_event_and_is_idempotent() {
        let mut sched: Scheduler<Fired> = Scheduler::new();
        let mut t = ReorderingTimer::new(Duration::from_millis(100), timer_id());
        t.arm(&mut sched, 7);
        t.cancel(&mut sched);
        t.cancel(&mut sched);
        assert!(!t.is_armed());
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn test_expire_returns_snapshot() {
        let mut sched: Scheduler<Fired> = Scheduler::new();
        let mut t = ReorderingTimer::new(Duration::from_millis(40), timer_id());
        t.arm(&mut sched, 12);
        let (at, Fired(id)) = sched.pop().unwrap();
        assert_eq!(at, Duration::from_millis(40));
        assert_eq!(id, timer_id());
        assert_eq!(t.expire(), Some(12));
        assert_eq!(t.expire(), None);
    }
}
