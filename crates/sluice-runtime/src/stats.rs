//! Transport-wide counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, shared by every loop of a transport
#[derive(Debug, Default)]
pub struct TransportStats {
    accepted: AtomicU64,
    closed: AtomicU64,
    rate_violations: AtomicU64,
    accept_errors: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

/// Point-in-time copy of [`TransportStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub closed: u64,
    pub rate_violations: u64,
    pub accept_errors: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl StatsSnapshot {
    /// Connections accepted and not yet closed
    pub fn active(&self) -> u64 {
        self.accepted.saturating_sub(self.closed)
    }
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_rate_violation(&self) {
        self.rate_violations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_written(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            rate_violations: self.rate_violations.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}
