//! # Listener: accepting TCP connections on a loop
//!
//! `Listener::bind` creates the listening socket on the calling thread;
//! `start` moves it onto a loop, where readiness drives non-blocking
//! `accept4` in batches.
//!
//! Accept outcomes:
//!
//! | errno                                | action                              |
//! |--------------------------------------|-------------------------------------|
//! | `EAGAIN`                             | backlog drained, wait for readiness |
//! | `ECONNABORTED`, `EINTR`, `EPROTO`, … | skip this one, keep accepting       |
//! | `EMFILE`, `ENFILE`, `ENOBUFS`, …     | pause, retry after a short timer    |
//! | anything else                        | close listener, report to host      |
//!
//! With a [`ConnectionLimit`] the listener takes a lease before each
//! accept. At the cap it stops polling the socket and parks until a
//! connection closes.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use sluice_core::constants::ACCEPT_BATCH;
use sluice_core::error::{Result, TransportError};

use crate::config::{defaults, ListenOptions};
use crate::event_loop::{EventLoop, Interest, IoHandler, Ready, Token};
use crate::handle::{HandleKind, NativeHandle};
use crate::limit::{ConnectionLease, ConnectionLimit};
use crate::sys;
use crate::timer::TimerId;
use crate::trace;

/// A freshly accepted, non-blocking socket on its way to a loop
#[derive(Debug)]
pub struct AcceptedSocket {
    pub(crate) fd: OwnedFd,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) lease: Option<ConnectionLease>,
}

impl AcceptedSocket {
    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Decides where accepted sockets go
///
/// Called on the listener's loop thread; implementations must not block.
pub trait ConnectionDispatcher: Send + Sync {
    /// Hand off one accepted socket. Dropping it closes the socket.
    fn dispatch(&self, lp: &mut EventLoop, socket: AcceptedSocket);

    /// The listener closed after a fatal accept error.
    fn listener_failed(&self, error: TransportError);

    /// A single accept failed; the listener carries on.
    fn accept_failed(&self, _errno: i32) {}
}

/// A bound listening socket, not yet attached to a loop
#[derive(Debug)]
pub struct Listener {
    fd: OwnedFd,
    local_addr: SocketAddr,
    limit: Option<Arc<ConnectionLimit>>,
    retry_delay: Duration,
}

impl Listener {
    /// Bind and listen on `addr`.
    ///
    /// `EADDRINUSE` maps to [`TransportError::AddressInUse`], `EACCES` and
    /// `EPERM` to [`TransportError::Permission`].
    pub fn bind(addr: SocketAddr, opts: &ListenOptions) -> Result<Self> {
        let fd = sys::listen_socket(&addr, opts.reuse_port, opts.backlog)?;
        let local_addr = sys::local_addr(fd.as_raw_fd())?;
        Ok(Self {
            fd,
            local_addr,
            limit: None,
            retry_delay: Duration::from_millis(defaults::ACCEPT_RETRY_MS),
        })
    }

    /// Cap concurrent connections accepted through this listener.
    pub fn with_limit(mut self, limit: Arc<ConnectionLimit>) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Delay before accepting again after descriptor or memory exhaustion.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// The bound address, with the real port when bound to port 0
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Attach to `lp` and start accepting. Must run on `lp`'s thread.
    pub fn start(self, lp: &mut EventLoop, dispatcher: Arc<dyn ConnectionDispatcher>) -> Result<Token> {
        let addr = self.local_addr;
        let driver = self.into_driver(lp, dispatcher)?;
        let fd = driver.handle.raw_fd();
        let token = lp.register(fd, Interest::READABLE, Box::new(driver))?;
        trace::listener_started(addr);
        Ok(token)
    }

    fn into_driver(self, lp: &EventLoop, dispatcher: Arc<dyn ConnectionDispatcher>) -> Result<ListenerDriver> {
        let handle = NativeHandle::create(lp, HandleKind::Listener, self.fd.into_raw_fd());
        handle.open()?;
        Ok(ListenerDriver {
            handle,
            addr: self.local_addr,
            dispatcher,
            limit: self.limit,
            retry_delay: self.retry_delay,
            paused: None,
            retry_timer: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pause {
    /// Connection cap reached; resumed by the limit
    AtCapacity,
    /// Out of descriptors or memory; resumed by the retry timer
    Exhausted,
}

struct ListenerDriver {
    handle: NativeHandle,
    addr: SocketAddr,
    dispatcher: Arc<dyn ConnectionDispatcher>,
    limit: Option<Arc<ConnectionLimit>>,
    retry_delay: Duration,
    paused: Option<Pause>,
    retry_timer: Option<TimerId>,
}

impl ListenerDriver {
    fn accept_batch(&mut self, lp: &mut EventLoop, token: Token) {
        for _ in 0..ACCEPT_BATCH {
            let lease = match &self.limit {
                Some(limit) => match limit.try_acquire() {
                    Some(lease) => Some(lease),
                    None => {
                        limit.park(lp.handle(), token);
                        self.pause(lp, token, Pause::AtCapacity);
                        return;
                    }
                },
                None => None,
            };

            match self.handle.accept() {
                Ok((fd, peer)) => self.dispatcher.dispatch(lp, AcceptedSocket { fd, peer, lease }),
                Err(err) => {
                    drop(lease);
                    let Some(errno) = err.errno() else {
                        // Handle already closed underneath us.
                        self.close(lp, token);
                        return;
                    };
                    if !self.on_accept_error(lp, token, errno) {
                        return;
                    }
                }
            }
        }
    }

    /// Returns `true` when the batch may go on accepting.
    fn on_accept_error(&mut self, lp: &mut EventLoop, token: Token, errno: i32) -> bool {
        if sys::is_would_block(errno) {
            return false;
        }
        self.dispatcher.accept_failed(errno);
        if sys::is_transient_accept(errno) {
            return true;
        }
        if sys::is_resource_exhaustion(errno) {
            trace::listener_error(Some(self.addr), errno, false);
            self.pause(lp, token, Pause::Exhausted);
            let id = lp.add_timer(self.retry_delay, None, move |lp, _| lp.wakeup(token));
            self.retry_timer = Some(id);
            return false;
        }
        trace::listener_error(Some(self.addr), errno, true);
        self.close(lp, token);
        self.dispatcher.listener_failed(TransportError::ListenerFailed { errno });
        false
    }

    fn pause(&mut self, lp: &mut EventLoop, token: Token, why: Pause) {
        self.paused = Some(why);
        if let Err(e) = lp.reregister(token, Interest::NONE) {
            tracing::warn!(addr = %self.addr, error = %e, "failed to pause listener");
        }
    }

    fn close(&mut self, lp: &mut EventLoop, token: Token) {
        if let Some(id) = self.retry_timer.take() {
            lp.cancel_timer(id);
        }
        lp.deregister(token);
        if self.handle.release() {
            tracing::info!(target: trace::TARGET, addr = %self.addr, "listener closed");
        }
    }
}

impl IoHandler for ListenerDriver {
    fn on_ready(&mut self, lp: &mut EventLoop, token: Token, _ready: Ready) {
        if self.paused.is_none() {
            self.accept_batch(lp, token);
        }
    }

    /// A slot freed up, or the retry timer fired.
    fn on_wakeup(&mut self, lp: &mut EventLoop, token: Token) {
        if self.paused.take().is_none() {
            return;
        }
        self.retry_timer = None;
        if let Err(e) = lp.reregister(token, Interest::READABLE) {
            tracing::warn!(addr = %self.addr, error = %e, "failed to resume listener");
            return;
        }
        self.accept_batch(lp, token);
    }

    fn on_close(&mut self, lp: &mut EventLoop, token: Token) {
        self.close(lp, token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::time::Instant;

    use parking_lot::Mutex;

    use crate::event_loop::RunMode;

    #[derive(Default)]
    struct Collect {
        sockets: Mutex<Vec<AcceptedSocket>>,
        failed: Mutex<Vec<TransportError>>,
        errors: Mutex<Vec<i32>>,
    }

    impl ConnectionDispatcher for Collect {
        fn dispatch(&self, _lp: &mut EventLoop, socket: AcceptedSocket) {
            self.sockets.lock().push(socket);
        }

        fn listener_failed(&self, error: TransportError) {
            self.failed.lock().push(error);
        }

        fn accept_failed(&self, errno: i32) {
            self.errors.lock().push(errno);
        }
    }

    /// Reports `errno` in place of the first accept, then behaves normally.
    struct FailFirstAccept {
        inner: ListenerDriver,
        errno: Option<i32>,
    }

    impl IoHandler for FailFirstAccept {
        fn on_ready(&mut self, lp: &mut EventLoop, token: Token, ready: Ready) {
            match self.errno.take() {
                Some(errno) => {
                    self.inner.on_accept_error(lp, token, errno);
                }
                None => self.inner.on_ready(lp, token, ready),
            }
        }

        fn on_wakeup(&mut self, lp: &mut EventLoop, token: Token) {
            self.inner.on_wakeup(lp, token);
        }

        fn on_close(&mut self, lp: &mut EventLoop, token: Token) {
            self.inner.on_close(lp, token);
        }
    }

    fn run_until(lp: &mut EventLoop, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            lp.run(RunMode::NoWait);
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_bind_ephemeral_and_accept() {
        let mut lp = EventLoop::new().unwrap();
        let listener = Listener::bind(loopback(), &ListenOptions::default()).unwrap();
        let addr = listener.local_addr();
        assert_ne!(addr.port(), 0);

        let sink = Arc::new(Collect::default());
        listener.start(&mut lp, sink.clone()).unwrap();

        let client = TcpStream::connect(addr).unwrap();
        assert!(run_until(&mut lp, Duration::from_secs(5), || sink.sockets.lock().len() == 1));
        let sockets = sink.sockets.lock();
        assert_eq!(sockets[0].peer_addr(), Some(client.local_addr().unwrap()));
    }

    #[test]
    fn test_bind_address_in_use() {
        let first = Listener::bind(loopback(), &ListenOptions::default()).unwrap();
        match Listener::bind(first.local_addr(), &ListenOptions::default()) {
            Err(TransportError::AddressInUse { addr, .. }) => assert_eq!(addr, first.local_addr()),
            other => panic!("expected AddressInUse, got {:?}", other),
        }
    }

    #[test]
    fn test_limit_pauses_and_resumes() {
        let mut lp = EventLoop::new().unwrap();
        let limit = ConnectionLimit::new(1);
        let listener = Listener::bind(loopback(), &ListenOptions::default())
            .unwrap()
            .with_limit(limit.clone());
        let addr = listener.local_addr();
        let sink = Arc::new(Collect::default());
        listener.start(&mut lp, sink.clone()).unwrap();

        let _c1 = TcpStream::connect(addr).unwrap();
        let _c2 = TcpStream::connect(addr).unwrap();
        assert!(run_until(&mut lp, Duration::from_secs(5), || sink.sockets.lock().len() == 1));

        // Second client waits in the backlog while the cap is held.
        assert!(!run_until(&mut lp, Duration::from_millis(200), || sink.sockets.lock().len() > 1));
        assert_eq!(limit.active(), 1);

        drop(sink.sockets.lock().pop());
        assert!(run_until(&mut lp, Duration::from_secs(5), || sink.sockets.lock().len() == 1));
        assert_eq!(limit.active(), 1);
    }

    #[test]
    fn test_close_stops_listening() {
        let mut lp = EventLoop::new().unwrap();
        let listener = Listener::bind(loopback(), &ListenOptions::default()).unwrap();
        let addr = listener.local_addr();
        let sink = Arc::new(Collect::default());
        let token = listener.start(&mut lp, sink.clone()).unwrap();
        assert_eq!(lp.handler_count(), 1);

        lp.close(token);
        assert_eq!(lp.handler_count(), 0);
        assert!(TcpStream::connect(addr).is_err());
        assert!(sink.failed.lock().is_empty());
    }

    #[test]
    fn test_exhaustion_pauses_until_retry() {
        let mut lp = EventLoop::new().unwrap();
        let listener = Listener::bind(loopback(), &ListenOptions::default())
            .unwrap()
            .with_retry_delay(Duration::from_millis(300));
        let addr = listener.local_addr();
        let sink = Arc::new(Collect::default());
        let driver = listener.into_driver(&lp, sink.clone()).unwrap();
        let fd = driver.handle.raw_fd();
        let handler = FailFirstAccept {
            inner: driver,
            errno: Some(libc::EMFILE),
        };
        lp.register(fd, Interest::READABLE, Box::new(handler)).unwrap();

        let _client = TcpStream::connect(addr).unwrap();
        assert!(run_until(&mut lp, Duration::from_secs(5), || !sink.errors.lock().is_empty()));
        assert_eq!(*sink.errors.lock(), vec![libc::EMFILE]);
        assert_eq!(lp.timer_stats().active, 1);

        // Backed off: the pending client is not taken before the retry.
        assert!(!run_until(&mut lp, Duration::from_millis(100), || !sink.sockets.lock().is_empty()));

        assert!(run_until(&mut lp, Duration::from_secs(5), || sink.sockets.lock().len() == 1));
        assert!(sink.failed.lock().is_empty());
        assert_eq!(lp.handler_count(), 1);
    }

    #[test]
    fn test_fatal_accept_error_closes_listener() {
        let mut lp = EventLoop::new().unwrap();
        let listener = Listener::bind(loopback(), &ListenOptions::default()).unwrap();
        let raw = listener.fd.as_raw_fd();
        let sink = Arc::new(Collect::default());
        listener.start(&mut lp, sink.clone()).unwrap();

        // Disconnecting a listening socket makes accept4 fail with EINVAL.
        assert_eq!(unsafe { libc::shutdown(raw, libc::SHUT_RD) }, 0);
        assert!(run_until(&mut lp, Duration::from_secs(5), || !sink.failed.lock().is_empty()));
        assert_eq!(
            sink.failed.lock()[0],
            TransportError::ListenerFailed { errno: libc::EINVAL }
        );
        assert_eq!(lp.handler_count(), 0);
        assert!(sink.sockets.lock().is_empty());
    }
}
