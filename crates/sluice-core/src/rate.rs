//! Minimum data-rate enforcement
//!
//! A [`MinimumRateMonitor`] watches the bytes moving through one direction
//! of a connection. It is ticked periodically by the owning loop's
//! heartbeat; once the grace period has elapsed, every tick compares the
//! bytes observed since the previous tick against the configured floor.
//!
//! ```text
//!   start            grace ends
//!     │◄── grace ──────►│
//!     ├──tick──tick─────┼──tick──────tick──────tick
//!        (window reset)    achieved = bytes / interval
//!                          achieved < rate  ──►  Violated
//! ```
//!
//! Monitoring is best effort: a coalesced or late tick simply widens the
//! measured interval.

use core::fmt;
use std::time::{Duration, Instant};

use crate::error::{Result, TransportError};

/// Which half of the duplex stream a monitor is timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateDirection {
    /// Bytes received from the peer
    Inbound,
    /// Bytes handed to the OS for the peer
    Outbound,
}

impl fmt::Display for RateDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateDirection::Inbound => write!(f, "inbound"),
            RateDirection::Outbound => write!(f, "outbound"),
        }
    }
}

/// Validated `(bytes_per_second, grace_period)` pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinDataRate {
    bytes_per_second: f64,
    grace_period: Duration,
}

impl MinDataRate {
    /// Create a rate floor.
    ///
    /// Fails with [`TransportError::InvalidConfiguration`] unless
    /// `bytes_per_second` is finite and strictly positive.
    pub fn new(bytes_per_second: f64, grace_period: Duration) -> Result<Self> {
        if !bytes_per_second.is_finite() || bytes_per_second <= 0.0 {
            return Err(TransportError::InvalidConfiguration(format!(
                "minimum data rate must be a positive number of bytes per second, got {}",
                bytes_per_second
            )));
        }
        Ok(Self {
            bytes_per_second,
            grace_period,
        })
    }

    /// Create a rate floor from a grace period in (possibly negative) seconds.
    ///
    /// A grace period too long for [`Duration`] saturates to `Duration::MAX`.
    pub fn from_secs(bytes_per_second: f64, grace_secs: f64) -> Result<Self> {
        if !grace_secs.is_finite() || grace_secs < 0.0 {
            return Err(TransportError::InvalidConfiguration(format!(
                "grace period must be a non-negative number of seconds, got {}",
                grace_secs
            )));
        }
        let grace = Duration::try_from_secs_f64(grace_secs).unwrap_or(Duration::MAX);
        Self::new(bytes_per_second, grace)
    }

    #[inline]
    pub fn bytes_per_second(&self) -> f64 {
        self.bytes_per_second
    }

    #[inline]
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }
}

/// Outcome of one heartbeat tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateVerdict {
    /// Not timing (never started, paused, or exempt)
    Idle,
    /// Grace period still running; the window was reset
    WithinGrace,
    /// Achieved rate met the floor
    Satisfied { achieved: f64 },
    /// Achieved rate fell below the floor; the connection must be aborted
    Violated { achieved: f64 },
}

impl RateVerdict {
    #[inline]
    pub fn is_violation(&self) -> bool {
        matches!(self, RateVerdict::Violated { .. })
    }
}

/// Per-connection, per-direction throughput floor
#[derive(Debug, Clone)]
pub struct MinimumRateMonitor {
    rate: MinDataRate,
    direction: RateDirection,
    /// Set while timing; the grace period is measured from here
    started_at: Option<Instant>,
    last_check: Option<Instant>,
    bytes_since_check: u64,
    total_bytes: u64,
    paused: bool,
    exempt: bool,
}

impl MinimumRateMonitor {
    pub fn new(rate: MinDataRate, direction: RateDirection) -> Self {
        Self {
            rate,
            direction,
            started_at: None,
            last_check: None,
            bytes_since_check: 0,
            total_bytes: 0,
            paused: false,
            exempt: false,
        }
    }

    #[inline]
    pub fn rate(&self) -> &MinDataRate {
        &self.rate
    }

    #[inline]
    pub fn direction(&self) -> RateDirection {
        self.direction
    }

    #[inline]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    #[inline]
    pub fn is_timing(&self) -> bool {
        self.started_at.is_some() && !self.paused && !self.exempt
    }

    /// Begin timing. The grace period starts now; calling again while
    /// already started is a no-op.
    pub fn start(&mut self, now: Instant) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
            self.last_check = Some(now);
            self.bytes_since_check = 0;
        }
    }

    /// Suspend timing (e.g. input paused for backpressure, or no output
    /// pending). Elapsed time while paused is never measured.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resume timing after [`pause`](Self::pause); the measurement window
    /// restarts at `now`.
    pub fn resume(&mut self, now: Instant) {
        if self.paused {
            self.paused = false;
            self.last_check = Some(now);
            self.bytes_since_check = 0;
        }
    }

    /// Permanently disable enforcement. Upgraded (raw duplex) connections
    /// are never rate checked.
    pub fn exempt(&mut self) {
        self.exempt = true;
    }

    #[inline]
    pub fn is_exempt(&self) -> bool {
        self.exempt
    }

    /// Record bytes that moved in this direction.
    #[inline]
    pub fn observe(&mut self, bytes: usize) {
        self.total_bytes += bytes as u64;
        if self.is_timing() {
            self.bytes_since_check += bytes as u64;
        }
    }

    /// Evaluate the window ending at `now`.
    pub fn tick(&mut self, now: Instant) -> RateVerdict {
        if !self.is_timing() {
            return RateVerdict::Idle;
        }
        let (Some(started), Some(last)) = (self.started_at, self.last_check) else {
            return RateVerdict::Idle;
        };

        if now.saturating_duration_since(started) < self.rate.grace_period {
            self.last_check = Some(now);
            self.bytes_since_check = 0;
            return RateVerdict::WithinGrace;
        }

        let interval = now.saturating_duration_since(last);
        if interval.is_zero() {
            return RateVerdict::Idle;
        }

        let achieved = self.bytes_since_check as f64 / interval.as_secs_f64();
        self.last_check = Some(now);
        self.bytes_since_check = 0;

        if achieved < self.rate.bytes_per_second {
            RateVerdict::Violated { achieved }
        } else {
            RateVerdict::Satisfied { achieved }
        }
    }
}
