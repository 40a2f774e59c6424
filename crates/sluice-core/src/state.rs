//! Handle and connection state types

use core::fmt;

use crate::error::TransportError;
use crate::rate::RateDirection;

/// Lifecycle of a native handle
///
/// Transitions are monotonic: `Created → Open → Closing → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum HandleState {
    /// Descriptor owned, not yet registered with its loop
    Created = 0,

    /// Registered and usable for native calls
    Open = 1,

    /// Release in progress
    Closing = 2,

    /// Descriptor freed; the handle holds the closed sentinel
    Closed = 3,
}

impl HandleState {
    #[inline]
    pub const fn is_usable(&self) -> bool {
        matches!(self, HandleState::Open)
    }
}

impl From<u8> for HandleState {
    fn from(v: u8) -> Self {
        match v {
            0 => HandleState::Created,
            1 => HandleState::Open,
            2 => HandleState::Closing,
            _ => HandleState::Closed,
        }
    }
}

impl From<HandleState> for u8 {
    fn from(state: HandleState) -> u8 {
        state as u8
    }
}

/// Lifecycle of a connection
///
/// ```text
///   Accepted ──► Active ──(peer FIN)──► Draining ──► Closed
///                  │                                   ▲
///                  └──(reset | abort | rate)───────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    /// Socket accepted, not yet registered on its loop
    Accepted = 0,

    /// Reading and writing
    Active = 1,

    /// Peer sent EOF; outbound data may still flow
    Draining = 2,

    /// Handle released
    Closed = 3,
}

impl ConnectionState {
    #[inline]
    pub const fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    /// True while the application may still queue output
    #[inline]
    pub const fn can_write(&self) -> bool {
        matches!(self, ConnectionState::Active | ConnectionState::Draining)
    }
}

impl From<u8> for ConnectionState {
    fn from(v: u8) -> Self {
        match v {
            0 => ConnectionState::Accepted,
            1 => ConnectionState::Active,
            2 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }
}

impl From<ConnectionState> for u8 {
    fn from(state: ConnectionState) -> u8 {
        state as u8
    }
}

/// Why a connection was torn down without a graceful close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Requested by the hosting application
    Application,
    /// A minimum data-rate monitor fired
    RateViolation(RateDirection),
    /// ECONNRESET / EPIPE from the peer
    PeerReset,
    /// Any other read or write failure
    IoError(i32),
    /// The owning loop is shutting down
    ServerShutdown,
}

impl AbortReason {
    /// The error subsequent reads and writes observe
    pub fn to_error(self) -> TransportError {
        match self {
            AbortReason::RateViolation(direction) => TransportError::RateViolation { direction },
            _ => TransportError::ConnectionClosed,
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Application => write!(f, "application"),
            AbortReason::RateViolation(_) => write!(f, "rate-violation"),
            AbortReason::PeerReset => write!(f, "peer-reset"),
            AbortReason::IoError(errno) => write!(f, "io-error({})", errno),
            AbortReason::ServerShutdown => write!(f, "server-shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_state_roundtrip() {
        for s in [
            HandleState::Created,
            HandleState::Open,
            HandleState::Closing,
            HandleState::Closed,
        ] {
            assert_eq!(HandleState::from(u8::from(s)), s);
        }
        assert_eq!(HandleState::from(200), HandleState::Closed);
        assert!(HandleState::Open.is_usable());
        assert!(!HandleState::Closing.is_usable());
    }

    #[test]
    fn test_connection_state_ordering() {
        assert!(ConnectionState::Accepted < ConnectionState::Active);
        assert!(ConnectionState::Draining < ConnectionState::Closed);
        assert!(ConnectionState::Draining.can_write());
        assert!(!ConnectionState::Closed.can_write());
    }

    #[test]
    fn test_abort_reason_error() {
        assert_eq!(
            AbortReason::RateViolation(RateDirection::Inbound).to_error(),
            TransportError::RateViolation { direction: RateDirection::Inbound }
        );
        assert_eq!(AbortReason::PeerReset.to_error(), TransportError::ConnectionClosed);
        assert_eq!(format!("{}", AbortReason::IoError(32)), "io-error(32)");
    }
}
