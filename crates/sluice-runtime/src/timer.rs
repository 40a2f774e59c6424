//! Loop-local timers
//!
//! BinaryHeap of `(deadline, id)` plus a map of live timers. Cancellation
//! is lazy: `cancel` drops the map entry and the stale heap entry is
//! skipped when it surfaces.
//!
//! # Complexity
//!
//! - Insert: O(log n)
//! - Cancel: O(1)
//! - Next deadline: O(1) amortized
//!
//! Timers are owned by one [`EventLoop`](crate::event_loop::EventLoop) and
//! never cross threads, so no locking.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use crate::event_loop::EventLoop;

/// Identifies a timer on its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

pub(crate) type TimerCallback = Box<dyn FnMut(&mut EventLoop, TimerId)>;

/// Min-heap ordering: earliest deadline first, ties by id
struct HeapEntry {
    deadline: Instant,
    id: TimerId,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.deadline.cmp(&self.deadline) {
            Ordering::Equal => other.id.cmp(&self.id),
            ord => ord,
        }
    }
}

struct TimerSlot {
    deadline: Instant,
    repeat: Option<Duration>,
    referenced: bool,
    /// `None` while the callback is running
    callback: Option<TimerCallback>,
}

/// Snapshot of timer activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerStats {
    pub active: usize,
    pub total_inserted: u64,
    pub total_fired: u64,
    pub total_cancelled: u64,
}

pub(crate) struct TimerQueue {
    heap: BinaryHeap<HeapEntry>,
    live: HashMap<TimerId, TimerSlot>,
    next_id: u64,
    referenced: usize,
    stats: TimerStats,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::with_capacity(64),
            live: HashMap::with_capacity(64),
            next_id: 1,
            referenced: 0,
            stats: TimerStats::default(),
        }
    }

    pub(crate) fn insert(&mut self, deadline: Instant, repeat: Option<Duration>, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(HeapEntry { deadline, id });
        self.live.insert(
            id,
            TimerSlot {
                deadline,
                repeat,
                referenced: true,
                callback: Some(callback),
            },
        );
        self.referenced += 1;
        self.stats.total_inserted += 1;
        id
    }

    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        match self.live.remove(&id) {
            Some(slot) => {
                if slot.referenced {
                    self.referenced -= 1;
                }
                self.stats.total_cancelled += 1;
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_ref(&mut self, id: TimerId, referenced: bool) {
        if let Some(slot) = self.live.get_mut(&id) {
            if slot.referenced != referenced {
                slot.referenced = referenced;
                if referenced {
                    self.referenced += 1;
                } else {
                    self.referenced -= 1;
                }
            }
        }
    }

    /// Timers that keep the loop alive
    #[inline]
    pub(crate) fn has_referenced(&self) -> bool {
        self.referenced > 0
    }

    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            match self.live.get(&top.id) {
                Some(slot) if slot.deadline == top.deadline => return Some(top.deadline),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Take the next expired timer's callback. The slot stays live (and
    /// cancellable) until [`finish`](Self::finish).
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<(TimerId, TimerCallback)> {
        loop {
            let deadline = self.next_deadline()?;
            if deadline > now {
                return None;
            }
            let entry = self.heap.pop()?;
            if let Some(slot) = self.live.get_mut(&entry.id) {
                if let Some(cb) = slot.callback.take() {
                    self.stats.total_fired += 1;
                    return Some((entry.id, cb));
                }
            }
        }
    }

    /// Put a fired callback back. Repeating timers are rescheduled from
    /// `now`; one-shot timers (and timers cancelled while running) are
    /// dropped.
    pub(crate) fn finish(&mut self, id: TimerId, callback: TimerCallback, now: Instant) {
        let repeat = match self.live.get(&id) {
            Some(slot) => slot.repeat,
            None => return,
        };
        match repeat {
            Some(period) => {
                let deadline = now + period;
                if let Some(slot) = self.live.get_mut(&id) {
                    slot.deadline = deadline;
                    slot.callback = Some(callback);
                }
                self.heap.push(HeapEntry { deadline, id });
            }
            None => {
                if let Some(slot) = self.live.remove(&id) {
                    if slot.referenced {
                        self.referenced -= 1;
                    }
                }
            }
        }
    }

    pub(crate) fn stats(&self) -> TimerStats {
        TimerStats {
            active: self.live.len(),
            ..self.stats
        }
    }
}
