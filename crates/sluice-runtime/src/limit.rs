//! Concurrent-connection cap
//!
//! Listeners acquire a [`ConnectionLease`] before accepting. When none is
//! available the listener parks itself here and stops accepting; the
//! next lease to drop notifies every parked listener on its own loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::event_loop::{LoopHandle, Token};

pub struct ConnectionLimit {
    max: usize,
    active: AtomicUsize,
    parked: Mutex<Vec<(LoopHandle, Token)>>,
}

impl ConnectionLimit {
    /// `max == 0` never limits.
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            max,
            active: AtomicUsize::new(0),
            parked: Mutex::new(Vec::new()),
        })
    }

    #[inline]
    pub fn max(&self) -> usize {
        self.max
    }

    #[inline]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Take one slot, or `None` at the cap.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionLease> {
        let mut cur = self.active.load(Ordering::Relaxed);
        loop {
            if self.max != 0 && cur >= self.max {
                return None;
            }
            match self.active.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(ConnectionLease { limit: self.clone() }),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Ask to be notified when a slot frees up. If one already has, the
    /// notification is sent immediately.
    pub fn park(&self, lp: LoopHandle, token: Token) {
        self.parked.lock().push((lp, token));
        if self.max == 0 || self.active() < self.max {
            self.wake_parked();
        }
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.wake_parked();
    }

    fn wake_parked(&self) {
        let parked = std::mem::take(&mut *self.parked.lock());
        for (lp, token) in parked {
            // A stopped loop has no listener left to resume.
            let _ = lp.notify(token);
        }
    }
}

impl std::fmt::Debug for ConnectionLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLimit")
            .field("max", &self.max)
            .field("active", &self.active())
            .finish()
    }
}

/// One occupied connection slot; dropping it frees the slot exactly once
pub struct ConnectionLease {
    limit: Arc<ConnectionLimit>,
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.limit.release();
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_cap_enforced() {
        let limit = ConnectionLimit::new(2);
        let a = limit.try_acquire().expect("first");
        let _b = limit.try_acquire().expect("second");
        assert!(limit.try_acquire().is_none());
        assert_eq!(limit.active(), 2);

        drop(a);
        assert_eq!(limit.active(), 1);
        assert!(limit.try_acquire().is_some());
    }

    #[test]
    fn test_unlimited() {
        let limit = ConnectionLimit::new(0);
        let leases: Vec<_> = (0..1000).filter_map(|_| limit.try_acquire()).collect();
        assert_eq!(leases.len(), 1000);
        drop(leases);
        assert_eq!(limit.active(), 0);
    }

    #[test]
    fn test_concurrent_acquire_respects_cap() {
        let limit = ConnectionLimit::new(10);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limit = limit.clone();
                thread::spawn(move || {
                    let mut held = Vec::new();
                    for _ in 0..100 {
                        if let Some(lease) = limit.try_acquire() {
                            held.push(lease);
                        }
                    }
                    held.len()
                })
            })
            .collect();
        // Leases drop as each thread exits, so only the live total is capped.
        for h in handles {
            assert!(h.join().unwrap() <= 10);
        }
        assert_eq!(limit.active(), 0);
    }
}
