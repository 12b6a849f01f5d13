//! Deadline tracking for the socket event loops.
//!
//! Each engine owns one [`TimerQueue`]; the earliest pending deadline becomes
//! the `Poll::poll` timeout. Timers are never removed eagerly: cancellation
//! invalidates the timer's id, and stale entries are discarded when they
//! surface. Every armed timer also carries the generation current at arm
//! time, so timers scheduled for a superseded connect attempt die with it.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// What a timer means when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    ConnectTimeout,
    AlternateFamily,
    ReadTimeout,
    WriteTimeout,
    SendTimeout,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Timer {
    pub kind: TimerKind,
    pub id: u64,
    pub generation: u64,
}

#[derive(Debug)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    next_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    deadline: Instant,
    seq: u64,
    timer: TimerHeapData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimerHeapData {
    kind: TimerKind,
    id: u64,
    generation: u64,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_id: 1,
        }
    }

    /// Arms a timer; the returned id must be kept to recognize valid fires.
    pub fn arm(&mut self, kind: TimerKind, after: Duration, generation: u64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse(Entry {
            deadline: Instant::now() + after,
            seq: id,
            timer: TimerHeapData {
                kind,
                id,
                generation,
            },
        }));
        id
    }

    /// Time until the earliest deadline, if any. Zero when overdue.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.heap
            .peek()
            .map(|Reverse(e)| e.deadline.saturating_duration_since(now))
    }

    /// Pops every timer whose deadline has passed.
    pub fn fire_due(&mut self, now: Instant) -> Vec<Timer> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            due.push(Timer {
                kind: entry.timer.kind,
                id: entry.timer.id,
                generation: entry.timer.generation,
            });
        }
        due
    }

    /// Drops all pending timers.
    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut q = TimerQueue::new();
        q.arm(TimerKind::ReadTimeout, Duration::from_millis(20), 1);
        q.arm(TimerKind::ConnectTimeout, Duration::from_millis(10), 1);
        let fired = q.fire_due(Instant::now() + Duration::from_millis(30));
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].kind, TimerKind::ConnectTimeout);
        assert_eq!(fired[1].kind, TimerKind::ReadTimeout);
    }

    #[test]
    fn nothing_due_before_deadline() {
        let mut q = TimerQueue::new();
        q.arm(TimerKind::WriteTimeout, Duration::from_secs(60), 1);
        assert!(q.fire_due(Instant::now()).is_empty());
        assert!(q.next_timeout(Instant::now()).unwrap() > Duration::from_secs(50));
    }

    #[test]
    fn ids_are_unique() {
        let mut q = TimerQueue::new();
        let a = q.arm(TimerKind::SendTimeout, Duration::ZERO, 1);
        let b = q.arm(TimerKind::SendTimeout, Duration::ZERO, 1);
        assert_ne!(a, b);
    }
}
