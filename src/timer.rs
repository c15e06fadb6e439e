//! Deadline-ordered timer queue.
//!
//! Timers are plain-data events routed back to the component that armed
//! them: each entry carries the owning component's index and a caller
//! token, and the dispatcher invokes the owner's `on_timer` hook when the
//! deadline passes. One-shot timers fire once; recurring timers re-arm at
//! fire time plus their period.

use crate::pqueue::PriorityQueue;
use crate::time::Nanos;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    OneShot,
    Recurring,
}

/// Caller-chosen token telling the owning component which timer fired.
pub type TimerId = u64;

#[derive(Debug, Clone, Copy)]
pub struct TimerEvent {
    pub kind: TimerKind,
    pub deadline: Nanos,
    pub period: Nanos,
    pub owner: usize,
    pub id: TimerId,
}

fn earliest_first(a: &TimerEvent, b: &TimerEvent) -> bool {
    a.deadline > b.deadline
}

/// Fixed-capacity queue of pending timers, earliest deadline first.
pub struct TimerQueue {
    queue: PriorityQueue<TimerEvent, fn(&TimerEvent, &TimerEvent) -> bool>,
}

impl TimerQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: PriorityQueue::new(capacity, earliest_first),
        }
    }

    /// Arms a one-shot timer at an absolute deadline. Returns `false` when
    /// the queue is full.
    pub fn schedule_at(&mut self, deadline: Nanos, owner: usize, id: TimerId) -> bool {
        self.queue.push(TimerEvent {
            kind: TimerKind::OneShot,
            deadline,
            period: 0,
            owner,
            id,
        })
    }

    /// Arms a timer `delay` from `now`. Recurring timers keep the delay as
    /// their period. Returns `false` when the queue is full.
    pub fn schedule_after(
        &mut self,
        kind: TimerKind,
        now: Nanos,
        delay: Nanos,
        owner: usize,
        id: TimerId,
    ) -> bool {
        self.queue.push(TimerEvent {
            kind,
            deadline: now + delay,
            period: delay,
            owner,
            id,
        })
    }

    /// Moves every timer with `deadline <= now` into `due`, re-arming
    /// recurring ones at `now + period`.
    ///
    /// Firing is split from draining so the caller can invoke component
    /// hooks (which may arm new timers) without holding a borrow of the
    /// queue. Returns the number of events drained.
    pub fn drain_due(&mut self, now: Nanos, due: &mut Vec<TimerEvent>) -> usize {
        let mut drained = 0;
        while let Some(top) = self.queue.top() {
            if top.deadline > now {
                break;
            }
            let ev = self.queue.pop().expect("non-empty top");
            if ev.kind == TimerKind::Recurring {
                // The pop above freed a slot, so this cannot fail.
                self.queue.push(TimerEvent {
                    deadline: now + ev.period,
                    ..ev
                });
            }
            due.push(ev);
            drained += 1;
        }
        drained
    }

    /// Deadline of the next pending timer, if any.
    pub fn next_deadline(&self) -> Option<Nanos> {
        self.queue.top().map(|ev| ev.deadline)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.size()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
