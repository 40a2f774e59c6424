//! Transport configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder setters
//! 2. Environment variables (runtime)
//! 3. Library defaults ([`defaults`])
//!
//! # Example
//!
//! ```rust,ignore
//! use sluice_runtime::config::TransportConfig;
//!
//! let config = TransportConfig::from_env()
//!     .thread_count(4)
//!     .max_connections(10_000)
//!     .heartbeat_interval(Duration::from_millis(500));
//! config.validate()?;
//! ```

pub mod defaults;

use std::time::Duration;

use sluice_core::env::{env_get, env_get_bool, env_get_duration_ms};
use sluice_core::error::{Result, TransportError};
use sluice_core::rate::MinDataRate;

/// How accepted sockets reach the loops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// One listener on the first loop; accepted sockets are posted to the
    /// loops in turn
    #[default]
    RoundRobin,
    /// Every loop binds its own `SO_REUSEPORT` listener and keeps what it
    /// accepts
    ReusePort,
}

/// Transport configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Number of loop threads
    pub thread_count: usize,
    /// Accept dispatch strategy
    pub dispatch: DispatchMode,
    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,
    /// Set `TCP_NODELAY` on accepted sockets
    pub no_delay: bool,
    /// Buffered input at which reading pauses (0 = unlimited)
    pub max_read_buffer_size: usize,
    /// Queued output at which writers block (0 = unlimited)
    pub max_write_buffer_size: usize,
    /// Listen backlog
    pub backlog: i32,
    /// Rate-monitor heartbeat period
    pub heartbeat_interval: Duration,
    /// Inbound floor, `None` disables it
    pub min_request_rate: Option<MinDataRate>,
    /// Outbound floor, `None` disables it
    pub min_response_rate: Option<MinDataRate>,
    /// Graceful shutdown budget per loop
    pub shutdown_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl TransportConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `SLUICE_THREAD_COUNT` - Number of loop threads
    /// - `SLUICE_MAX_CONNECTIONS` - Concurrent connection cap (0 = unlimited)
    /// - `SLUICE_NO_DELAY` - Set TCP_NODELAY on accepted sockets (0/1)
    /// - `SLUICE_MAX_READ_BUFFER` - Input pause threshold in bytes
    /// - `SLUICE_MAX_WRITE_BUFFER` - Output blocking threshold in bytes
    /// - `SLUICE_BACKLOG` - Listen backlog
    /// - `SLUICE_REUSE_PORT` - One SO_REUSEPORT listener per loop (0/1)
    /// - `SLUICE_HEARTBEAT_MS` - Rate-monitor heartbeat in milliseconds
    /// - `SLUICE_MIN_REQUEST_RATE` - Inbound floor in bytes/s (0 = off)
    /// - `SLUICE_MIN_RESPONSE_RATE` - Outbound floor in bytes/s (0 = off)
    /// - `SLUICE_RATE_GRACE_MS` - Grace period for both floors
    pub fn from_env() -> Self {
        let threads = env_get("SLUICE_THREAD_COUNT", defaults::thread_count());
        let grace = env_get_duration_ms(
            "SLUICE_RATE_GRACE_MS",
            Duration::from_millis(defaults::RATE_GRACE_MS),
        );
        Self {
            thread_count: if threads == 0 { defaults::thread_count() } else { threads },
            dispatch: if env_get_bool("SLUICE_REUSE_PORT", defaults::REUSE_PORT) {
                DispatchMode::ReusePort
            } else {
                DispatchMode::RoundRobin
            },
            max_connections: env_get("SLUICE_MAX_CONNECTIONS", defaults::MAX_CONNECTIONS),
            no_delay: env_get_bool("SLUICE_NO_DELAY", defaults::NO_DELAY),
            max_read_buffer_size: env_get("SLUICE_MAX_READ_BUFFER", defaults::MAX_READ_BUFFER_SIZE),
            max_write_buffer_size: env_get(
                "SLUICE_MAX_WRITE_BUFFER",
                defaults::MAX_WRITE_BUFFER_SIZE,
            ),
            backlog: env_get("SLUICE_BACKLOG", defaults::BACKLOG),
            heartbeat_interval: env_get_duration_ms(
                "SLUICE_HEARTBEAT_MS",
                Duration::from_millis(defaults::HEARTBEAT_MS),
            ),
            min_request_rate: rate_or_disabled(
                env_get("SLUICE_MIN_REQUEST_RATE", defaults::MIN_REQUEST_RATE),
                grace,
            ),
            min_response_rate: rate_or_disabled(
                env_get("SLUICE_MIN_RESPONSE_RATE", defaults::MIN_RESPONSE_RATE),
                grace,
            ),
            shutdown_timeout: Duration::from_millis(defaults::SHUTDOWN_TIMEOUT_MS),
        }
    }

    /// Create config with library defaults only (no env override).
    pub fn new() -> Self {
        let grace = Duration::from_millis(defaults::RATE_GRACE_MS);
        Self {
            thread_count: defaults::thread_count(),
            dispatch: DispatchMode::default(),
            max_connections: defaults::MAX_CONNECTIONS,
            no_delay: defaults::NO_DELAY,
            max_read_buffer_size: defaults::MAX_READ_BUFFER_SIZE,
            max_write_buffer_size: defaults::MAX_WRITE_BUFFER_SIZE,
            backlog: defaults::BACKLOG,
            heartbeat_interval: Duration::from_millis(defaults::HEARTBEAT_MS),
            min_request_rate: rate_or_disabled(defaults::MIN_REQUEST_RATE, grace),
            min_response_rate: rate_or_disabled(defaults::MIN_RESPONSE_RATE, grace),
            shutdown_timeout: Duration::from_millis(defaults::SHUTDOWN_TIMEOUT_MS),
        }
    }

    // Builder methods

    pub fn thread_count(mut self, n: usize) -> Self {
        self.thread_count = n;
        self
    }

    pub fn dispatch(mut self, mode: DispatchMode) -> Self {
        self.dispatch = mode;
        self
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn no_delay(mut self, enable: bool) -> Self {
        self.no_delay = enable;
        self
    }

    pub fn max_read_buffer_size(mut self, bytes: usize) -> Self {
        self.max_read_buffer_size = bytes;
        self
    }

    pub fn max_write_buffer_size(mut self, bytes: usize) -> Self {
        self.max_write_buffer_size = bytes;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn heartbeat_interval(mut self, d: Duration) -> Self {
        self.heartbeat_interval = d;
        self
    }

    pub fn min_request_rate(mut self, rate: Option<MinDataRate>) -> Self {
        self.min_request_rate = rate;
        self
    }

    pub fn min_response_rate(mut self, rate: Option<MinDataRate>) -> Self {
        self.min_response_rate = rate;
        self
    }

    pub fn shutdown_timeout(mut self, d: Duration) -> Self {
        self.shutdown_timeout = d;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.thread_count == 0 {
            return Err(invalid("thread_count must be > 0"));
        }
        if self.thread_count > 256 {
            return Err(invalid("thread_count must be <= 256"));
        }
        if self.backlog <= 0 {
            return Err(invalid("backlog must be > 0"));
        }
        if self.heartbeat_interval < Duration::from_millis(1) {
            return Err(invalid("heartbeat_interval must be >= 1ms"));
        }
        if self.max_read_buffer_size != 0 && self.max_read_buffer_size < 2 {
            return Err(invalid("max_read_buffer_size must be 0 or >= 2"));
        }
        Ok(())
    }

    pub(crate) fn listen_options(&self) -> ListenOptions {
        ListenOptions {
            backlog: self.backlog,
            reuse_port: self.dispatch == DispatchMode::ReusePort,
        }
    }

    pub(crate) fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            no_delay: self.no_delay,
            max_read_buffer_size: self.max_read_buffer_size,
            max_write_buffer_size: self.max_write_buffer_size,
            min_request_rate: self.min_request_rate,
            min_response_rate: self.min_response_rate,
        }
    }
}

/// Socket options applied when a listener binds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenOptions {
    pub backlog: i32,
    pub reuse_port: bool,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            backlog: defaults::BACKLOG,
            reuse_port: false,
        }
    }
}

/// Per-connection limits, shared by every connection of a transport
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub no_delay: bool,
    pub max_read_buffer_size: usize,
    pub max_write_buffer_size: usize,
    pub min_request_rate: Option<MinDataRate>,
    pub min_response_rate: Option<MinDataRate>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        TransportConfig::new().connection_options()
    }
}

fn rate_or_disabled(bytes_per_second: f64, grace: Duration) -> Option<MinDataRate> {
    if bytes_per_second <= 0.0 {
        return None;
    }
    MinDataRate::new(bytes_per_second, grace).ok()
}

fn invalid(msg: &str) -> TransportError {
    TransportError::InvalidConfiguration(msg.to_string())
}
