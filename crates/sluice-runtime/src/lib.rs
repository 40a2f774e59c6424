//! # sluice-runtime
//!
//! Linux runtime for the sluice socket transport.
//!
//! This crate provides:
//! - Single-threaded epoll event loops with cross-thread posting
//! - Native handles bound to their owning loop thread
//! - Listeners with connection caps and accept backoff
//! - Connections with buffered, backpressured input and output
//! - Minimum data-rate enforcement on a per-loop heartbeat
//! - A multi-loop [`Transport`] tying it together

pub mod config;
pub mod connection;
pub mod event_loop;
pub mod handle;
pub mod limit;
pub mod listener;
pub mod stats;
pub mod thread;
pub mod timer;
pub mod trace;
pub mod transport;

// Re-exports
pub use config::{ConnectionOptions, DispatchMode, ListenOptions, TransportConfig};
pub use connection::{Chunks, Connection};
pub use event_loop::{EventLoop, Interest, IoHandler, LoopHandle, LoopStopper, Ready, RunMode, Token};
pub use handle::{HandleKind, NativeHandle};
pub use limit::{ConnectionLease, ConnectionLimit};
pub use listener::{AcceptedSocket, ConnectionDispatcher, Listener};
pub use stats::{StatsSnapshot, TransportStats};
pub use thread::LoopThread;
pub use timer::{TimerId, TimerStats};
pub use transport::Transport;

// Platform detection
cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod sys;
    } else {
        compile_error!("sluice-runtime requires epoll and eventfd (Linux or Android)");
    }
}
