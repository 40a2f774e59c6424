//! Stable names for transport log events
//!
//! Every trace emitted by the runtime carries one of these as its `event`
//! field. Log pipelines key on them, so they never change.

pub const CONNECTION_ACCEPTED: &str = "connection-accepted";
pub const CONNECTION_CLOSED: &str = "connection-closed";
pub const RATE_VIOLATION: &str = "rate-violation";

pub const CONNECTION_READ: &str = "connection-read";
pub const CONNECTION_READ_FIN: &str = "connection-read-fin";
pub const CONNECTION_WRITE: &str = "connection-write";
pub const CONNECTION_WRITE_FIN: &str = "connection-write-fin";
pub const CONNECTION_PAUSE: &str = "connection-pause";
pub const CONNECTION_RESUME: &str = "connection-resume";
pub const CONNECTION_RESET: &str = "connection-reset";
pub const CONNECTION_ERROR: &str = "connection-error";
pub const LISTENER_ERROR: &str = "listener-error";

/// All event names, in declaration order
pub const ALL: &[&str] = &[
    CONNECTION_ACCEPTED,
    CONNECTION_CLOSED,
    RATE_VIOLATION,
    CONNECTION_READ,
    CONNECTION_READ_FIN,
    CONNECTION_WRITE,
    CONNECTION_WRITE_FIN,
    CONNECTION_PAUSE,
    CONNECTION_RESUME,
    CONNECTION_RESET,
    CONNECTION_ERROR,
    LISTENER_ERROR,
];
