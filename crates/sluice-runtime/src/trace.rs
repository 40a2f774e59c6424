//! Transport trace events
//!
//! One function per event so call sites stay short and every record
//! carries the same stable `event` field (see `sluice_core::events`).

use std::net::SocketAddr;

use sluice_core::events;
use sluice_core::id::ConnectionId;
use sluice_core::rate::RateDirection;
use sluice_core::state::AbortReason;

pub const TARGET: &str = "sluice::transport";

pub(crate) fn connection_accepted(id: ConnectionId, peer: Option<SocketAddr>) {
    tracing::debug!(
        target: TARGET,
        event = events::CONNECTION_ACCEPTED,
        conn = %id,
        peer = ?peer,
        "connection accepted"
    );
}

pub(crate) fn connection_closed(id: ConnectionId, reason: Option<AbortReason>, read: u64, written: u64) {
    match reason {
        Some(reason) => tracing::debug!(
            target: TARGET,
            event = events::CONNECTION_CLOSED,
            conn = %id,
            reason = %reason,
            bytes_read = read,
            bytes_written = written,
            "connection aborted"
        ),
        None => tracing::debug!(
            target: TARGET,
            event = events::CONNECTION_CLOSED,
            conn = %id,
            bytes_read = read,
            bytes_written = written,
            "connection closed"
        ),
    }
}

pub(crate) fn rate_violation(id: ConnectionId, direction: RateDirection, achieved: f64, required: f64) {
    tracing::info!(
        target: TARGET,
        event = events::RATE_VIOLATION,
        conn = %id,
        direction = %direction,
        achieved,
        required,
        "data rate below minimum, aborting connection"
    );
}

pub(crate) fn connection_read(id: ConnectionId, count: usize) {
    tracing::trace!(target: TARGET, event = events::CONNECTION_READ, conn = %id, count);
}

pub(crate) fn connection_read_fin(id: ConnectionId) {
    tracing::debug!(target: TARGET, event = events::CONNECTION_READ_FIN, conn = %id, "peer sent FIN");
}

pub(crate) fn connection_write(id: ConnectionId, count: usize) {
    tracing::trace!(target: TARGET, event = events::CONNECTION_WRITE, conn = %id, count);
}

pub(crate) fn connection_write_fin(id: ConnectionId) {
    tracing::debug!(target: TARGET, event = events::CONNECTION_WRITE_FIN, conn = %id, "sending FIN");
}

pub(crate) fn connection_pause(id: ConnectionId, buffered: usize) {
    tracing::debug!(
        target: TARGET,
        event = events::CONNECTION_PAUSE,
        conn = %id,
        buffered,
        "input paused"
    );
}

pub(crate) fn connection_resume(id: ConnectionId, buffered: usize) {
    tracing::debug!(
        target: TARGET,
        event = events::CONNECTION_RESUME,
        conn = %id,
        buffered,
        "input resumed"
    );
}

pub(crate) fn connection_reset(id: ConnectionId, errno: i32) {
    tracing::debug!(target: TARGET, event = events::CONNECTION_RESET, conn = %id, errno, "connection reset by peer");
}

pub(crate) fn connection_error(id: ConnectionId, op: &'static str, errno: Option<i32>) {
    tracing::info!(
        target: TARGET,
        event = events::CONNECTION_ERROR,
        conn = %id,
        op,
        errno = ?errno,
        "connection error"
    );
}

pub(crate) fn listener_started(addr: SocketAddr) {
    tracing::info!(target: TARGET, addr = %addr, "listening");
}

/// `fatal == false` means accepting is paused and will be retried
pub(crate) fn listener_error(addr: Option<SocketAddr>, errno: i32, fatal: bool) {
    if fatal {
        tracing::error!(
            target: TARGET,
            event = events::LISTENER_ERROR,
            addr = ?addr,
            errno,
            "accept failed, closing listener"
        );
    } else {
        tracing::warn!(
            target: TARGET,
            event = events::LISTENER_ERROR,
            addr = ?addr,
            errno,
            "accept failed, pausing listener"
        );
    }
}
