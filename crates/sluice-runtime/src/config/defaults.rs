//! Library defaults for [`TransportConfig`](super::TransportConfig)
//!
//! Every value here can be overridden through the environment or the
//! builder setters.

/// Loop threads; `0` means "half the available cores, at least one"
pub const THREAD_COUNT: usize = 0;

/// Maximum concurrent connections; `0` is unlimited
pub const MAX_CONNECTIONS: usize = 0;

/// Disable Nagle on accepted sockets
pub const NO_DELAY: bool = true;

/// Buffered input at which reading pauses (1 MB); `0` is unlimited
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Queued output at which `write` blocks (64 KB); `0` is unlimited
pub const MAX_WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Listen backlog
pub const BACKLOG: i32 = sluice_core::constants::DEFAULT_BACKLOG;

/// Bind one `SO_REUSEPORT` listener per loop instead of round-robin dispatch
pub const REUSE_PORT: bool = false;

/// Rate-monitor heartbeat
pub const HEARTBEAT_MS: u64 = 1000;

/// Minimum inbound rate in bytes/s; `0.0` disables inbound enforcement
pub const MIN_REQUEST_RATE: f64 = 0.0;

/// Minimum outbound rate in bytes/s; `0.0` disables outbound enforcement
pub const MIN_RESPONSE_RATE: f64 = 240.0;

/// Grace period shared by both rate floors
pub const RATE_GRACE_MS: u64 = 5000;

/// How long `shutdown` waits for loops to drain before a hard stop
pub const SHUTDOWN_TIMEOUT_MS: u64 = 5000;

/// Delay before retrying accept after descriptor/memory exhaustion
pub const ACCEPT_RETRY_MS: u64 = 100;

/// Resolve [`THREAD_COUNT`] against the host.
pub fn thread_count() -> usize {
    if THREAD_COUNT > 0 {
        return THREAD_COUNT;
    }
    std::thread::available_parallelism()
        .map(|n| (n.get() / 2).max(1))
        .unwrap_or(1)
}
