//! # Transport: listeners, loop threads and accept dispatch
//!
//! ```text
//!   RoundRobin                          ReusePort
//!   ──────────                          ─────────
//!   loop 0: Listener                    loop i: Listener (SO_REUSEPORT)
//!     accept ─► LoopDispatcher            accept ─► LoopDispatcher
//!                 ├─► loop 0                          └─► loop i
//!                 ├─► loop 1
//!                 └─► loop N
//!
//!   establish() on the target loop ─► AcceptEvent channel ─► Transport::accept
//! ```
//!
//! Listener sockets are bound before any thread is spawned, so address
//! errors come back from `bind` directly.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use sluice_core::error::{Result, TransportError};

use crate::config::{ConnectionOptions, DispatchMode, TransportConfig};
use crate::connection::{establish, Connection};
use crate::event_loop::{EventLoop, LoopHandle, Token};
use crate::limit::ConnectionLimit;
use crate::listener::{AcceptedSocket, ConnectionDispatcher, Listener};
use crate::stats::{StatsSnapshot, TransportStats};
use crate::thread::LoopThread;

enum AcceptEvent {
    Connection(Connection),
    ListenerFailed(TransportError),
}

impl AcceptEvent {
    fn into_result(self) -> Result<Connection> {
        match self {
            AcceptEvent::Connection(conn) => Ok(conn),
            AcceptEvent::ListenerFailed(e) => Err(e),
        }
    }
}

/// Spreads accepted sockets over a set of loops in turn
struct LoopDispatcher {
    loops: Vec<LoopHandle>,
    next: AtomicUsize,
    options: ConnectionOptions,
    stats: Arc<TransportStats>,
    sink: Sender<AcceptEvent>,
}

impl LoopDispatcher {
    fn deliver(
        lp: &mut EventLoop,
        socket: AcceptedSocket,
        options: &ConnectionOptions,
        stats: &Arc<TransportStats>,
        sink: &Sender<AcceptEvent>,
    ) {
        match establish(lp, socket, options, stats) {
            // A closed sink drops the connection, which closes it.
            Ok(conn) => {
                let _ = sink.send(AcceptEvent::Connection(conn));
            }
            Err(e) => tracing::warn!(error = %e, "failed to set up accepted connection"),
        }
    }
}

impl ConnectionDispatcher for LoopDispatcher {
    fn dispatch(&self, lp: &mut EventLoop, socket: AcceptedSocket) {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        let target = &self.loops[i];
        if target.is_loop_thread() {
            Self::deliver(lp, socket, &self.options, &self.stats, &self.sink);
            return;
        }

        let options = self.options;
        let stats = self.stats.clone();
        let sink = self.sink.clone();
        if let Err(e) = target.post(move |lp| Self::deliver(lp, socket, &options, &stats, &sink)) {
            // The socket went down with the closure.
            tracing::debug!(loop_index = i, error = %e, "target loop gone, dropping connection");
        }
    }

    fn listener_failed(&self, error: TransportError) {
        let _ = self.sink.send(AcceptEvent::ListenerFailed(error));
    }

    fn accept_failed(&self, _errno: i32) {
        self.stats.record_accept_error();
    }
}

/// A bound, running transport
///
/// Dropping it shuts it down with the configured timeout.
pub struct Transport {
    threads: Vec<LoopThread>,
    /// (loop index, listener token)
    listeners: Vec<(usize, Token)>,
    accepted: Receiver<AcceptEvent>,
    local_addr: SocketAddr,
    stats: Arc<TransportStats>,
    limit: Option<Arc<ConnectionLimit>>,
    shutdown_timeout: Duration,
}

impl Transport {
    /// Bind `addr` and start accepting on `config.thread_count` loops.
    pub fn bind(addr: SocketAddr, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let listen_opts = config.listen_options();
        let n = config.thread_count;

        let first = Listener::bind(addr, &listen_opts)?;
        let local_addr = first.local_addr();
        let mut sockets = vec![first];
        if config.dispatch == DispatchMode::ReusePort {
            // Port 0 resolved by the first bind; the rest share it.
            for _ in 1..n {
                sockets.push(Listener::bind(local_addr, &listen_opts)?);
            }
        }

        let mut threads = Vec::with_capacity(n);
        for i in 0..n {
            threads.push(LoopThread::start(i, config.heartbeat_interval)?);
        }

        let limit = (config.max_connections > 0).then(|| ConnectionLimit::new(config.max_connections));
        let stats = Arc::new(TransportStats::new());
        let options = config.connection_options();
        let (tx, rx) = crossbeam_channel::unbounded();

        let mut listeners = Vec::with_capacity(sockets.len());
        for (i, listener) in sockets.into_iter().enumerate() {
            let loops = match config.dispatch {
                DispatchMode::RoundRobin => threads.iter().map(|t| t.handle().clone()).collect(),
                DispatchMode::ReusePort => vec![threads[i].handle().clone()],
            };
            let dispatcher: Arc<dyn ConnectionDispatcher> = Arc::new(LoopDispatcher {
                loops,
                next: AtomicUsize::new(0),
                options,
                stats: stats.clone(),
                sink: tx.clone(),
            });
            let listener = match &limit {
                Some(limit) => listener.with_limit(limit.clone()),
                None => listener,
            };

            let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
            threads[i].post(move |lp| {
                let _ = ack_tx.send(listener.start(lp, dispatcher));
            })?;
            let token = ack_rx.recv().map_err(|_| TransportError::LoopStopped)??;
            listeners.push((i, token));
        }

        tracing::info!(
            addr = %local_addr,
            threads = n,
            dispatch = ?config.dispatch,
            max_connections = config.max_connections,
            "transport started"
        );

        Ok(Self {
            threads,
            listeners,
            accepted: rx,
            local_addr,
            stats,
            limit,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Block until the next connection is accepted.
    ///
    /// Fails with [`TransportError::ListenerFailed`] when a listener hit a
    /// fatal error, and with [`TransportError::LoopStopped`] once no
    /// listener is left.
    pub fn accept(&self) -> Result<Connection> {
        match self.accepted.recv() {
            Ok(event) => event.into_result(),
            Err(_) => Err(TransportError::LoopStopped),
        }
    }

    /// Like [`accept`](Self::accept), giving up with `Ok(None)` after
    /// `timeout`.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Option<Connection>> {
        match self.accepted.recv_timeout(timeout) {
            Ok(event) => event.into_result().map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::LoopStopped),
        }
    }

    /// The bound address, with the real port when bound to port 0
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Connections currently holding a slot, when a cap is configured
    pub fn active_connections(&self) -> Option<usize> {
        self.limit.as_ref().map(|l| l.active())
    }

    /// Stop accepting. Established connections are left alone.
    pub fn unbind(&mut self) {
        for (i, token) in self.listeners.drain(..) {
            let _ = self.threads[i].post(move |lp| lp.close(token));
        }
    }

    /// Stop accepting, abort every connection and stop the loops, each
    /// given up to `timeout` to drain. Returns `true` when every loop
    /// drained without a hard stop.
    pub fn shutdown(&mut self, timeout: Duration) -> bool {
        if self.threads.is_empty() {
            return true;
        }
        self.unbind();
        // Loop 0 first: in round-robin mode it owns the listener and may
        // still be handing sockets to the others.
        let mut graceful = true;
        for t in self.threads.iter_mut() {
            graceful &= t.stop(timeout);
        }
        self.threads.clear();
        tracing::info!(addr = %self.local_addr, graceful, "transport stopped");
        graceful
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown(self.shutdown_timeout);
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("local_addr", &self.local_addr)
            .field("threads", &self.threads.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;
    use std::time::Instant;

    use bytes::Bytes;
    use sluice_core::rate::{MinDataRate, RateDirection};
    use sluice_core::state::AbortReason;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn config(threads: usize) -> TransportConfig {
        TransportConfig::new()
            .thread_count(threads)
            .min_response_rate(None)
            .shutdown_timeout(Duration::from_secs(2))
    }

    fn client(addr: SocketAddr) -> TcpStream {
        let s = TcpStream::connect(addr).unwrap();
        s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        s
    }

    fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    /// The listening socket bound to `addr`, found among this process's
    /// descriptors.
    fn listening_fd(addr: SocketAddr) -> Option<std::os::fd::RawFd> {
        (0..4096).find(|&fd| {
            let mut accepting: libc::c_int = 0;
            let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            let rc = unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_ACCEPTCONN,
                    &mut accepting as *mut libc::c_int as *mut libc::c_void,
                    &mut len,
                )
            };
            rc == 0 && accepting == 1 && crate::sys::local_addr(fd).ok() == Some(addr)
        })
    }

    fn accept(t: &Transport) -> Connection {
        t.accept_timeout(Duration::from_secs(5))
            .unwrap()
            .expect("connection accepted")
    }

    #[test]
    fn test_hello_then_eof() {
        let t = Transport::bind(loopback(), config(2)).unwrap();
        let mut c = client(t.local_addr());
        let conn = accept(&t);
        assert_eq!(conn.peer_addr(), Some(c.local_addr().unwrap()));
        assert_eq!(conn.local_addr(), Some(t.local_addr()));

        conn.write(Bytes::from_static(b"hello")).unwrap();
        conn.close();

        let mut got = Vec::new();
        c.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"hello");
        assert!(wait_for(Duration::from_secs(5), || t.stats().closed == 1));
        assert_eq!(t.stats().accepted, 1);
    }

    #[test]
    fn test_echo_across_loops() {
        let t = Transport::bind(loopback(), config(3)).unwrap();
        let addr = t.local_addr();
        let clients: Vec<_> = (0..6)
            .map(|i| {
                thread::spawn(move || {
                    let mut c = client(addr);
                    let msg = format!("message {}", i);
                    c.write_all(msg.as_bytes()).unwrap();
                    c.shutdown(std::net::Shutdown::Write).unwrap();
                    let mut back = String::new();
                    c.read_to_string(&mut back).unwrap();
                    assert_eq!(back, msg);
                })
            })
            .collect();

        let servers: Vec<_> = (0..6)
            .map(|_| {
                let conn = accept(&t);
                thread::spawn(move || {
                    for chunk in conn.chunks() {
                        conn.write(chunk.unwrap()).unwrap();
                    }
                    conn.close();
                })
            })
            .collect();

        for h in clients.into_iter().chain(servers) {
            h.join().unwrap();
        }
        assert!(wait_for(Duration::from_secs(5), || t.stats().closed == 6));
        let stats = t.stats();
        assert_eq!(stats.accepted, 6);
        assert_eq!(stats.active(), 0);
        assert_eq!(stats.bytes_read, stats.bytes_written);
    }

    #[test]
    fn test_reuse_port_dispatch() {
        let t = Transport::bind(loopback(), config(2).dispatch(DispatchMode::ReusePort)).unwrap();
        let addr = t.local_addr();
        let _clients: Vec<_> = (0..4).map(|_| client(addr)).collect();
        for _ in 0..4 {
            accept(&t);
        }
        assert_eq!(t.stats().accepted, 4);
    }

    #[test]
    fn test_bind_address_in_use() {
        let first = Transport::bind(loopback(), config(1)).unwrap();
        match Transport::bind(first.local_addr(), config(1)) {
            Err(TransportError::AddressInUse { addr, .. }) => assert_eq!(addr, first.local_addr()),
            other => panic!("expected AddressInUse, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Transport::bind(loopback(), config(0));
        assert!(matches!(result, Err(TransportError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_connection_limit_defers_accept() {
        let t = Transport::bind(loopback(), config(1).max_connections(1)).unwrap();
        let addr = t.local_addr();
        let _c1 = client(addr);
        let first = accept(&t);
        assert_eq!(t.active_connections(), Some(1));

        let _c2 = client(addr);
        assert!(t.accept_timeout(Duration::from_millis(300)).unwrap().is_none());

        first.abort(AbortReason::Application);
        let second = accept(&t);
        assert_eq!(second.state(), sluice_core::state::ConnectionState::Active);
        assert_eq!(t.active_connections(), Some(1));
    }

    #[test]
    fn test_concurrent_double_abort() {
        let t = Transport::bind(loopback(), config(1)).unwrap();
        let mut c = client(t.local_addr());
        let conn = Arc::new(accept(&t));

        let racers: Vec<_> = (0..2)
            .map(|_| {
                let conn = conn.clone();
                thread::spawn(move || conn.abort(AbortReason::Application))
            })
            .collect();
        let wins = racers.into_iter().map(|h| h.join().unwrap()).filter(|w| *w).count();
        assert_eq!(wins, 1);

        assert!(wait_for(Duration::from_secs(5), || t.stats().closed == 1));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(t.stats().closed, 1);

        // The peer sees the socket go away.
        let mut buf = [0u8; 16];
        assert!(matches!(c.read(&mut buf), Ok(0) | Err(_)));
    }

    #[test]
    fn test_slow_client_hits_rate_floor() {
        let rate = MinDataRate::new(1000.0, Duration::from_millis(200)).unwrap();
        let t = Transport::bind(
            loopback(),
            config(1)
                .heartbeat_interval(Duration::from_millis(100))
                .min_request_rate(Some(rate)),
        )
        .unwrap();
        let mut c = client(t.local_addr());
        let conn = accept(&t);

        let sender = thread::spawn(move || {
            for _ in 0..10 {
                if c.write_all(b".").is_err() {
                    break;
                }
                thread::sleep(Duration::from_millis(150));
            }
        });

        let err = loop {
            match conn.read() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("unexpected EOF"),
                Err(e) => break e,
            }
        };
        assert_eq!(err, TransportError::RateViolation { direction: RateDirection::Inbound });
        assert!(wait_for(Duration::from_secs(5), || t.stats().rate_violations == 1));
        sender.join().unwrap();
    }

    #[test]
    fn test_shutdown_aborts_open_connections() {
        let mut t = Transport::bind(loopback(), config(2)).unwrap();
        let addr = t.local_addr();
        let _c = client(addr);
        let conn = accept(&t);

        assert!(t.shutdown(Duration::from_secs(2)));
        assert_eq!(conn.abort_reason(), Some(AbortReason::ServerShutdown));
        assert_eq!(conn.read(), Err(TransportError::ConnectionClosed));
        assert!(TcpStream::connect(addr).is_err());
        assert!(matches!(t.accept_timeout(Duration::from_millis(10)), Err(TransportError::LoopStopped)));
        // Second shutdown is a no-op.
        assert!(t.shutdown(Duration::from_secs(2)));
    }

    #[test]
    fn test_unbind_keeps_connections() {
        let mut t = Transport::bind(loopback(), config(1)).unwrap();
        let addr = t.local_addr();
        let mut c = client(addr);
        let conn = accept(&t);

        t.unbind();
        assert!(wait_for(Duration::from_secs(5), || TcpStream::connect(addr).is_err()));

        conn.write_all(b"still here").unwrap();
        conn.close();
        let mut got = Vec::new();
        c.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"still here");
    }

    #[test]
    fn test_listener_failure_surfaces_through_accept() {
        let t = Transport::bind(loopback(), config(2)).unwrap();
        let fd = listening_fd(t.local_addr()).expect("listening socket");

        // Disconnecting a listening socket makes accept4 fail with EINVAL.
        assert_eq!(unsafe { libc::shutdown(fd, libc::SHUT_RD) }, 0);
        match t.accept_timeout(Duration::from_secs(5)) {
            Err(TransportError::ListenerFailed { errno }) => assert_eq!(errno, libc::EINVAL),
            other => panic!("expected ListenerFailed, got {:?}", other.map(|_| ())),
        }
        // That was the only listener.
        assert!(matches!(
            t.accept_timeout(Duration::from_secs(5)),
            Err(TransportError::LoopStopped)
        ));
        assert!(t.stats().accept_errors >= 1);
    }
}
