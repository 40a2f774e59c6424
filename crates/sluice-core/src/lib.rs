//! # sluice-core
//!
//! Core types for the sluice socket transport.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Event loops, native handles, listeners and connections live in
//! `sluice-runtime`.
//!
//! ## Modules
//!
//! - `error` - Transport error taxonomy
//! - `state` - Handle and connection lifecycle enums, abort reasons
//! - `id` - Connection identifier type
//! - `rate` - Minimum data-rate floor and monitor
//! - `events` - Stable log event names
//! - `env` - Environment variable utilities

pub mod error;
pub mod state;
pub mod id;
pub mod rate;
pub mod events;
pub mod env;

// Re-exports for convenience
pub use error::{Result, TransportError};
pub use state::{AbortReason, ConnectionState, HandleState};
pub use id::ConnectionId;
pub use rate::{MinDataRate, MinimumRateMonitor, RateDirection, RateVerdict};
pub use env::{env_get, env_get_bool, env_get_duration_ms, env_get_opt};

/// Transport-wide constants
pub mod constants {
    /// Closed sentinel stored in a released handle
    pub const INVALID_FD: i32 = -1;

    /// Default listen backlog
    pub const DEFAULT_BACKLOG: i32 = 128;

    /// Maximum connections accepted per readiness notification
    pub const ACCEPT_BATCH: usize = 64;

    /// Size of a loop's scratch read buffer
    pub const READ_CHUNK_SIZE: usize = 64 * 1024;
}
