//! Error types for the sluice transport

use std::net::SocketAddr;

use thiserror::Error;

use crate::rate::RateDirection;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors surfaced by loops, handles, listeners and connections.
///
/// OS failures always carry the originating `errno` so the hosting layer
/// can make restart/shutdown decisions on the raw code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Loop or handle creation failed (epoll, eventfd, socket)
    #[error("failed to initialize {what}: errno {errno}")]
    Initialization { what: &'static str, errno: i32 },

    /// Bind target already taken
    #[error("address {addr} is already in use")]
    AddressInUse { addr: SocketAddr, errno: i32 },

    /// Bind refused by the OS (privileged port, sandbox)
    #[error("permission denied binding {addr}")]
    Permission { addr: SocketAddr, errno: i32 },

    /// Operation attempted on a connection or handle that is already closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Rejected rate, grace period, or transport option
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Connection was aborted by the minimum data-rate monitor
    #[error("connection aborted: {direction} data rate below minimum")]
    RateViolation { direction: RateDirection },

    /// Any other native call failure
    #[error("{op} failed: errno {errno}")]
    Os { op: &'static str, errno: i32 },

    /// Native call issued from a thread that does not own the handle's loop
    #[error("native handle used off its owning loop thread")]
    WrongThread,

    /// The target loop has exited and no longer accepts posted work
    #[error("event loop has stopped")]
    LoopStopped,

    /// The listener hit a fatal accept error and was closed
    #[error("listener closed after fatal error: errno {errno}")]
    ListenerFailed { errno: i32 },
}

impl TransportError {
    /// Shorthand for [`TransportError::Os`]
    #[inline]
    pub fn os(op: &'static str, errno: i32) -> Self {
        TransportError::Os { op, errno }
    }

    /// The OS error code carried by this error, if any
    pub fn errno(&self) -> Option<i32> {
        match self {
            TransportError::Initialization { errno, .. }
            | TransportError::AddressInUse { errno, .. }
            | TransportError::Permission { errno, .. }
            | TransportError::Os { errno, .. }
            | TransportError::ListenerFailed { errno } => Some(*errno),
            _ => None,
        }
    }

    /// True for the terminal errors a reader or writer sees once the
    /// connection is gone.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionClosed | TransportError::RateViolation { .. }
        )
    }
}
