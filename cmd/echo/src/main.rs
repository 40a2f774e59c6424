//! sluice echo server
//!
//! Accepts TCP connections and writes every chunk back until the peer
//! sends FIN. One application thread per connection; all socket I/O stays
//! on the transport's loop threads.
//!
//! Usage:
//!     cargo build --release -p sluice-echo
//!     ./target/release/sluice-echo --addr 127.0.0.1:9999 --threads 4
//!
//! Test with:
//!     echo "hello" | nc -q1 localhost 9999
//!
//! Logging is controlled by `SLUICE_LOG` (e.g. `SLUICE_LOG=sluice=debug`).

use std::net::SocketAddr;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::Parser;

use sluice::{Connection, DispatchMode, MinDataRate, Transport, TransportConfig, TransportError};

#[derive(Parser, Debug)]
#[command(name = "sluice-echo", about = "TCP echo server on the sluice transport")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9999")]
    addr: SocketAddr,

    /// Loop threads (0 = from SLUICE_THREAD_COUNT or half the cores)
    #[arg(short, long, default_value_t = 0)]
    threads: usize,

    /// Concurrent connection cap (0 = unlimited)
    #[arg(short = 'c', long, default_value_t = 0)]
    max_conns: usize,

    /// One SO_REUSEPORT listener per loop instead of round-robin handoff
    #[arg(long)]
    reuse_port: bool,

    /// Minimum inbound rate in bytes/s, enforced after a 5s grace (0 = off)
    #[arg(long, default_value_t = 0.0)]
    min_request_rate: f64,
}

fn build_config(args: &Args) -> Result<TransportConfig, TransportError> {
    let mut config = TransportConfig::from_env();
    if args.threads > 0 {
        config = config.thread_count(args.threads);
    }
    if args.max_conns > 0 {
        config = config.max_connections(args.max_conns);
    }
    if args.reuse_port {
        config = config.dispatch(DispatchMode::ReusePort);
    }
    if args.min_request_rate > 0.0 {
        let rate = MinDataRate::new(args.min_request_rate, Duration::from_secs(5))?;
        config = config.min_request_rate(Some(rate));
    }
    config.validate()?;
    Ok(config)
}

fn echo(conn: Connection) {
    let id = conn.id();
    for chunk in conn.chunks() {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(conn = %id, error = %e, "read ended");
                return;
            }
        };
        if let Err(e) = conn.write(chunk) {
            tracing::debug!(conn = %id, error = %e, "write failed");
            return;
        }
    }
    conn.close();
}

fn main() -> ExitCode {
    let args = Args::parse();
    sluice::init_tracing();

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "bad configuration");
            return ExitCode::FAILURE;
        }
    };

    let transport = match Transport::bind(args.addr, config) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(addr = %args.addr, error = %e, "bind failed");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(addr = %transport.local_addr(), threads = transport.thread_count(), "echo server ready");

    loop {
        match transport.accept() {
            Ok(conn) => {
                let spawned = thread::Builder::new()
                    .name(format!("echo-{}", conn.id()))
                    .spawn(move || echo(conn));
                if let Err(e) = spawned {
                    // The connection was dropped with the closure and closes.
                    tracing::warn!(error = %e, "failed to spawn echo thread");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "accept failed, shutting down");
                let stats = transport.stats();
                tracing::info!(
                    accepted = stats.accepted,
                    closed = stats.closed,
                    rate_violations = stats.rate_violations,
                    "final stats"
                );
                return ExitCode::FAILURE;
            }
        }
    }
}
