//! Discrete-Event Scheduler
//!
//! Virtual-time event queue standing in for the host simulator. Events run
//! one at a time, in deadline order; events sharing a deadline run in the
//! order they were scheduled. Nothing here blocks or sleeps: "later" is only
//! ever a position in the queue.

use std::collections::BTreeMap;
use std::time::Duration;
use tracing::trace;

use crate::types::{Lcid, Rnti};

/// Handle to a scheduled event, used for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId {
    deadline: Duration,
    seq: u64,
}

impl EventId {
    /// Virtual time at which the event fires
    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

/// Timers owned by protocol entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// PDCP t-Reordering of one radio bearer
    PdcpReordering { rnti: Rnti, lcid: Lcid },
    /// Back-off before the NAS retries a failed connection
    NasConnectRetry,
}

/// Single-shot timer service consumed by the protocol layers
pub trait TimerService {
    /// Current virtual time
    fn now(&self) -> Duration;

    /// Arm `timer` to fire after `delay`
    fn schedule_timer(&mut self, delay: Duration, timer: TimerId) -> EventId;

    /// Cancel a pending timer. Cancelling a fired or already cancelled
    /// timer is a no-op.
    fn cancel_timer(&mut self, id: EventId);

    /// Whether the timer is still waiting to fire
    fn is_timer_pending(&self, id: EventId) -> bool;
}

/// Event queue ordered by (deadline, insertion order)
pub struct Scheduler<E> {
    now: Duration,
    next_seq: u64,
    queue: BTreeMap<EventId, E>,
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Scheduler<E> {
    /// Create an empty scheduler at time zero
    pub fn new() -> Self {
        Self {
            now: Duration::ZERO,
            next_seq: 0,
            queue: BTreeMap::new(),
        }
    }

    /// Current virtual time
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Schedule `event` to run `delay` after the current time
    pub fn schedule(&mut self, delay: Duration, event: E) -> EventId {
        let id = EventId {
            deadline: self.now + delay,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        trace!("Scheduled event #{} at {:?}", id.seq, id.deadline);
        self.queue.insert(id, event);
        id
    }

    /// Schedule `event` at the current time, after everything already due now
    pub fn schedule_now(&mut self, event: E) -> EventId {
        self.schedule(Duration::ZERO, event)
    }

    /// Remove a pending event. Returns false if it already ran or was cancelled.
    pub fn cancel(&mut self, id: EventId) -> bool {
        let removed = self.queue.remove(&id).is_some();
        if removed {
            trace!("Cancelled event #{}", id.seq);
        }
        removed
    }

    /// Whether the event is still queued
    pub fn is_pending(&self, id: EventId) -> bool {
        self.queue.contains_key(&id)
    }

    /// Number of queued events
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Deadline of the next event, if any
    pub fn peek_deadline(&self) -> Option<Duration> {
        self.queue.keys().next().map(|id| id.deadline)
    }

    /// Pop the next event and advance virtual time to its deadline
    pub fn pop(&mut self) -> Option<(Duration, E)> {
        let (id, event) = self.queue.pop_first()?;
        self.now = id.deadline;
        Some((id.deadline, event))
    }

    /// Pop the next event only if it is due no later than `limit`
    pub fn pop_until(&mut self, limit: Duration) -> Option<(Duration, E)> {
        match self.peek_deadline() {
            Some(deadline) if deadline <= limit => self.pop(),
            _ => {
                if self.now < limit {
                    self.now = limit;
                }
                None
            }
        }
    }
}

impl<E: From<TimerId>> TimerService for Scheduler<E> {
    fn now(&self) -> Duration {
        self.now
    }

    fn schedule_timer(&mut self, delay: Duration, timer: TimerId) -> EventId {
        self.schedule(delay, E::from(timer))
    }

    fn cancel_timer(&mut self, id: EventId) {
        self.cancel(id);
    }

    fn is_timer_pending(&self, id: EventId) -> bool {
        self.is_pending(id)
    }
}
