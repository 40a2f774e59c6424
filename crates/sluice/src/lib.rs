//! # sluice - event-loop socket transport
//!
//! A libuv-style TCP transport: a few loop threads own every socket, and
//! application threads talk to connections through buffered, backpressured
//! queues.
//!
//! ## Features
//!
//! - **Event loops**: one epoll loop per thread, cross-thread posting through an eventfd waker
//! - **Owned handles**: every descriptor is bound to its loop thread and closed exactly once
//! - **Dispatch**: round-robin handoff from one listener, or one `SO_REUSEPORT` listener per loop
//! - **Backpressure**: input pauses at a byte threshold, writers block at another
//! - **Rate floors**: slow senders and slow readers are aborted after a grace period
//! - **Connection cap**: listeners stop accepting at the cap and resume as connections close
//!
//! ## Quick Start
//!
//! ```ignore
//! use sluice::{Transport, TransportConfig};
//!
//! fn main() -> sluice::Result<()> {
//!     sluice::init_tracing();
//!     let transport = Transport::bind("127.0.0.1:8080".parse().unwrap(), TransportConfig::from_env())?;
//!
//!     loop {
//!         let conn = transport.accept()?;
//!         std::thread::spawn(move || {
//!             for chunk in conn.chunks() {
//!                 let Ok(chunk) = chunk else { break };
//!                 if conn.write(chunk).is_err() {
//!                     break;
//!                 }
//!             }
//!             conn.close();
//!         });
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Application threads                       │
//! │         Transport::accept, Connection read/write            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  queues + LoopHandle::notify
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Loop 0   │      │  Loop 1   │      │  Loop N   │
//!    │ Listener  │ ───► │ Conns     │      │ Conns     │
//!    │ Conns     │      │ Heartbeat │      │ Heartbeat │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          └───────────────────┼───────────────────┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │          epoll · eventfd · non-blocking sockets         │
//!    └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Logging
//!
//! Transport events are emitted through `tracing` under the
//! `sluice::transport` target, each with a stable `event` field (see
//! [`events`]). [`init_tracing`] installs a formatter filtered by
//! `SLUICE_LOG`.

// Re-export core types
pub use sluice_core::{
    events,
    AbortReason,
    ConnectionId,
    ConnectionState,
    HandleState,
    MinDataRate,
    MinimumRateMonitor,
    RateDirection,
    RateVerdict,
    Result,
    TransportError,
};

// Re-export env utilities
pub use sluice_core::env::{env_get, env_get_bool, env_get_opt};

// Re-export runtime types
pub use sluice_runtime::{
    config,
    AcceptedSocket,
    Connection,
    ConnectionDispatcher,
    ConnectionLimit,
    DispatchMode,
    EventLoop,
    Interest,
    IoHandler,
    Listener,
    LoopHandle,
    LoopThread,
    RunMode,
    StatsSnapshot,
    Token,
    Transport,
    TransportConfig,
};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "SLUICE_LOG";

/// Install a `fmt` subscriber filtered by `SLUICE_LOG` (default `info`).
///
/// Returns `false` when a global subscriber was already set.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_once() {
        init_tracing();
        // A subscriber is installed by now, whoever got there first.
        assert!(!init_tracing());
    }

    #[test]
    fn test_reexports_resolve() {
        let config = TransportConfig::new().thread_count(1);
        assert!(config.validate().is_ok());
        assert_eq!(events::ALL.len(), 12);
        assert_eq!(RateDirection::Inbound.to_string(), "inbound");
    }
}
