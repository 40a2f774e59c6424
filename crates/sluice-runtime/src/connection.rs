//! # Connection: one accepted TCP stream
//!
//! A connection is split in two halves that share [`ConnectionShared`]:
//!
//! ```text
//!   application threads                      owning loop thread
//!   ───────────────────                      ──────────────────
//!   Connection::read  ◄── input queue ◄───── ConnectionDriver (recv)
//!   Connection::write ──► output queue ────► ConnectionDriver (send)
//!   Connection::abort ──► abort reason ─┐
//!   Connection::close ──► shutdown flag ┴──► LoopHandle::notify(token)
//! ```
//!
//! Only the driver touches the socket. Application calls queue data or
//! set flags and then wake the loop, so no native call ever leaves the
//! loop thread.
//!
//! ## Backpressure
//!
//! - Input: once `max_read_buffer_size` bytes are buffered the driver stops
//!   polling for readability. Reading resumes when the application has
//!   drained the buffer to half of that.
//! - Output: `write` blocks while `max_write_buffer_size` bytes are queued.
//!
//! ## Teardown
//!
//! Every path ends in `ConnectionDriver::finish`, which runs once: the
//! registration is removed, the handle released, the connection slot
//! returned and `connection_closed` traced. Graceful close sends FIN
//! after the output queue drains; abort skips straight to release.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, IntoRawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, Bytes};
use parking_lot::{Condvar, Mutex};

use sluice_core::constants::READ_CHUNK_SIZE;
use sluice_core::error::{Result, TransportError};
use sluice_core::id::ConnectionId;
use sluice_core::rate::{MinimumRateMonitor, RateDirection, RateVerdict};
use sluice_core::state::{AbortReason, ConnectionState};

use crate::config::ConnectionOptions;
use crate::event_loop::{EventLoop, Interest, IoHandler, LoopHandle, Ready, Token};
use crate::handle::{HandleKind, NativeHandle};
use crate::limit::ConnectionLease;
use crate::listener::AcceptedSocket;
use crate::stats::TransportStats;
use crate::sys;
use crate::trace;

/// recv calls per readiness event before yielding to other handlers
const READS_PER_WAKEUP: usize = 16;

#[derive(Default)]
struct InputQueue {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    /// Peer sent FIN
    eof: bool,
    /// The application has seen the EOF marker
    eof_delivered: bool,
    /// Closed locally; nothing more will be queued
    closed: bool,
    error: Option<TransportError>,
    /// The driver stopped reading at the buffer limit
    paused: bool,
    /// Readers currently blocked in `read`
    waiting: usize,
}

#[derive(Default)]
struct OutputQueue {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    /// Bytes ever queued
    queued: u64,
    /// Bytes ever handed to the kernel
    written: u64,
    shutdown_requested: bool,
    error: Option<TransportError>,
}

pub(crate) struct ConnectionShared {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    lp: LoopHandle,
    state: AtomicU8,
    closing: AtomicBool,
    upgraded: AtomicBool,
    notify_pending: AtomicBool,
    abort_reason: Mutex<Option<AbortReason>>,
    input: Mutex<InputQueue>,
    input_ready: Condvar,
    output: Mutex<OutputQueue>,
    output_ready: Condvar,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    max_read: usize,
    max_write: usize,
}

impl ConnectionShared {
    fn new(
        id: ConnectionId,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
        lp: LoopHandle,
        opts: &ConnectionOptions,
    ) -> Self {
        Self {
            id,
            peer_addr,
            local_addr,
            lp,
            state: AtomicU8::new(ConnectionState::Accepted.into()),
            closing: AtomicBool::new(false),
            upgraded: AtomicBool::new(false),
            notify_pending: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
            input: Mutex::new(InputQueue::default()),
            input_ready: Condvar::new(),
            output: Mutex::new(OutputQueue::default()),
            output_ready: Condvar::new(),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            max_read: opts.max_read_buffer_size,
            max_write: opts.max_write_buffer_size,
        }
    }

    #[inline]
    fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.into(), Ordering::Release);
    }

    /// Move from `from` to `to`; any other current state is left alone.
    #[inline]
    fn transition(&self, from: ConnectionState, to: ConnectionState) {
        let _ = self
            .state
            .compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire);
    }

    #[inline]
    fn resume_threshold(&self) -> usize {
        self.max_read / 2
    }

    /// Coalesce wakeups: at most one notify is in flight per connection.
    fn wake_loop(&self, token: Token) {
        if !self.notify_pending.swap(true, Ordering::AcqRel) && self.lp.notify(token).is_err() {
            self.notify_pending.store(false, Ordering::Release);
        }
    }

    /// Drop everything buffered and fail both directions with `err`.
    fn fail(&self, err: TransportError) {
        {
            let mut input = self.input.lock();
            input.chunks.clear();
            input.buffered = 0;
            input.error.get_or_insert_with(|| err.clone());
        }
        self.input_ready.notify_all();
        {
            let mut output = self.output.lock();
            output.chunks.clear();
            output.buffered = 0;
            output.error.get_or_insert(err);
        }
        self.output_ready.notify_all();
    }

    /// Stop both directions after teardown, keeping unread input readable.
    fn close_streams(&self) {
        self.input.lock().closed = true;
        self.input_ready.notify_all();
        {
            let mut output = self.output.lock();
            output.chunks.clear();
            output.buffered = 0;
            output.error.get_or_insert(TransportError::ConnectionClosed);
        }
        self.output_ready.notify_all();
    }
}

/// Application side of an accepted connection
///
/// `Send + Sync`: reads, writes and control calls may come from any thread.
/// Dropping it starts a graceful close.
pub struct Connection {
    shared: Arc<ConnectionShared>,
    token: Token,
}

impl Connection {
    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    #[inline]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Bytes received from the peer so far
    #[inline]
    pub fn bytes_read(&self) -> u64 {
        self.shared.bytes_read.load(Ordering::Relaxed)
    }

    /// Bytes handed to the kernel so far
    #[inline]
    pub fn bytes_written(&self) -> u64 {
        self.shared.bytes_written.load(Ordering::Relaxed)
    }

    /// Why the connection was aborted, once it has been
    pub fn abort_reason(&self) -> Option<AbortReason> {
        *self.shared.abort_reason.lock()
    }

    #[inline]
    pub fn is_upgraded(&self) -> bool {
        self.shared.upgraded.load(Ordering::Acquire)
    }

    /// Block until the next chunk arrives.
    ///
    /// Returns `Ok(None)` exactly once when the peer has sent FIN and all
    /// data before it was read. After that, or after a local close,
    /// reads fail with [`TransportError::ConnectionClosed`]. An aborted
    /// connection fails with the abort's error.
    pub fn read(&self) -> Result<Option<Bytes>> {
        let shared = &self.shared;
        let mut input = shared.input.lock();
        loop {
            if let Some(err) = &input.error {
                return Err(err.clone());
            }
            if let Some(chunk) = input.chunks.pop_front() {
                input.buffered -= chunk.len();
                let resume = input.paused && input.buffered <= shared.resume_threshold();
                drop(input);
                if resume {
                    shared.wake_loop(self.token);
                }
                return Ok(Some(chunk));
            }
            if input.eof {
                if input.eof_delivered {
                    return Err(TransportError::ConnectionClosed);
                }
                input.eof_delivered = true;
                return Ok(None);
            }
            if input.closed {
                return Err(TransportError::ConnectionClosed);
            }
            input.waiting += 1;
            shared.input_ready.wait(&mut input);
            input.waiting -= 1;
        }
    }

    /// Iterate over incoming chunks until EOF or the first error.
    pub fn chunks(&self) -> Chunks<'_> {
        Chunks { conn: self, done: false }
    }

    /// Queue `data` for sending, in order after everything queued before.
    ///
    /// Blocks while the output queue is at `max_write_buffer_size`. Fails
    /// once the connection is closing or aborted.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        let shared = &self.shared;
        let mut output = shared.output.lock();
        loop {
            if let Some(err) = &output.error {
                return Err(err.clone());
            }
            if output.shutdown_requested {
                return Err(TransportError::ConnectionClosed);
            }
            if shared.max_write == 0 || output.buffered < shared.max_write {
                break;
            }
            shared.output_ready.wait(&mut output);
        }
        if data.is_empty() {
            return Ok(());
        }
        output.buffered += data.len();
        output.queued += data.len() as u64;
        output.chunks.push_back(data);
        drop(output);
        shared.wake_loop(self.token);
        Ok(())
    }

    /// Copy `data` into a new buffer and queue it.
    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        self.write(Bytes::copy_from_slice(data))
    }

    /// Block until everything queued so far has reached the kernel.
    pub fn flush(&self) -> Result<()> {
        let shared = &self.shared;
        let mut output = shared.output.lock();
        let target = output.queued;
        loop {
            if output.written >= target {
                return Ok(());
            }
            if let Some(err) = &output.error {
                return Err(err.clone());
            }
            shared.output_ready.wait(&mut output);
        }
    }

    /// Tear the connection down without flushing.
    ///
    /// Safe to race from several threads; only the first call takes
    /// effect and returns `true`. Overrides a graceful close that is still
    /// flushing. Pending and future reads and writes fail with `reason`'s
    /// error.
    pub fn abort(&self, reason: AbortReason) -> bool {
        let shared = &self.shared;
        {
            let mut slot = shared.abort_reason.lock();
            if slot.is_some() || shared.state() == ConnectionState::Closed {
                return false;
            }
            *slot = Some(reason);
        }
        shared.closing.store(true, Ordering::Release);
        shared.fail(reason.to_error());
        shared.wake_loop(self.token);
        true
    }

    /// Start a graceful close: queued output is flushed, FIN is sent and
    /// the handle released. Returns immediately; use [`flush`](Self::flush)
    /// first to wait for delivery.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        shared.output.lock().shutdown_requested = true;
        shared.transition(ConnectionState::Active, ConnectionState::Draining);
        shared.input.lock().closed = true;
        shared.input_ready.notify_all();
        shared.wake_loop(self.token);
    }

    /// Mark the connection as upgraded to a raw duplex stream. Rate
    /// monitors stop enforcing from the next heartbeat on.
    pub fn mark_upgraded(&self) {
        if !self.shared.upgraded.swap(true, Ordering::AcqRel) {
            self.shared.wake_loop(self.token);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Iterator returned by [`Connection::chunks`]
pub struct Chunks<'a> {
    conn: &'a Connection,
    done: bool,
}

impl Iterator for Chunks<'_> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.conn.read() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Register an accepted socket on `lp` and return its application half.
pub(crate) fn establish(
    lp: &mut EventLoop,
    socket: AcceptedSocket,
    opts: &ConnectionOptions,
    stats: &Arc<TransportStats>,
) -> Result<Connection> {
    let AcceptedSocket { fd, peer, lease } = socket;
    let raw = fd.as_raw_fd();
    if opts.no_delay {
        if let Err(errno) = sys::set_nodelay(raw, true) {
            tracing::debug!(errno, "TCP_NODELAY not applied");
        }
    }
    let local = sys::local_addr(raw).ok();
    let peer = peer.or_else(|| sys::peer_addr(raw).ok());

    let handle = NativeHandle::create(lp, HandleKind::Tcp, fd.into_raw_fd());
    handle.open()?;

    let id = ConnectionId::next();
    let shared = Arc::new(ConnectionShared::new(id, peer, local, lp.handle(), opts));
    stats.record_accepted();
    trace::connection_accepted(id, peer);

    let driver = ConnectionDriver {
        handle,
        shared: shared.clone(),
        stats: stats.clone(),
        lease,
        inbound: opts
            .min_request_rate
            .map(|rate| MinimumRateMonitor::new(rate, RateDirection::Inbound)),
        outbound: opts
            .min_response_rate
            .map(|rate| MinimumRateMonitor::new(rate, RateDirection::Outbound)),
        reading: true,
        input_paused: false,
        write_blocked: false,
        fin_sent: false,
        finished: false,
    };
    let token = lp.register(raw, Interest::READABLE, Box::new(driver))?;
    shared.set_state(ConnectionState::Active);
    Ok(Connection { shared, token })
}

/// Loop side of a connection
struct ConnectionDriver {
    handle: NativeHandle,
    shared: Arc<ConnectionShared>,
    stats: Arc<TransportStats>,
    lease: Option<ConnectionLease>,
    inbound: Option<MinimumRateMonitor>,
    outbound: Option<MinimumRateMonitor>,
    /// Still reading from the socket (no FIN, no local close)
    reading: bool,
    input_paused: bool,
    /// Last send hit EAGAIN; waiting for EPOLLOUT
    write_blocked: bool,
    fin_sent: bool,
    finished: bool,
}

impl ConnectionDriver {
    fn interest(&self) -> Interest {
        Interest {
            readable: self.reading && !self.input_paused,
            writable: self.write_blocked,
        }
    }

    fn update_interest(&mut self, lp: &mut EventLoop, token: Token) {
        if let Err(e) = lp.reregister(token, self.interest()) {
            trace::connection_error(self.shared.id, "epoll_ctl", e.errno());
            self.abort_local(lp, token, AbortReason::IoError(e.errno().unwrap_or(0)));
        }
    }

    fn read_ready(&mut self, lp: &mut EventLoop, token: Token) {
        for _ in 0..READS_PER_WAKEUP {
            let result = {
                let buf = lp.read_buffer();
                self.handle
                    .recv(buf)
                    .map(|n| Bytes::copy_from_slice(&buf[..n]))
            };
            match result {
                Ok(chunk) if chunk.is_empty() => {
                    self.on_eof();
                    return;
                }
                Ok(chunk) => {
                    let n = chunk.len();
                    self.on_data(chunk);
                    if self.input_paused || n < READ_CHUNK_SIZE {
                        return;
                    }
                }
                Err(e) => {
                    self.on_io_error(lp, token, "recv", e);
                    return;
                }
            }
        }
    }

    fn on_data(&mut self, chunk: Bytes) {
        let n = chunk.len();
        self.shared.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        self.stats.record_read(n);
        if let Some(m) = &mut self.inbound {
            m.observe(n);
        }
        trace::connection_read(self.shared.id, n);

        let mut input = self.shared.input.lock();
        if input.error.is_some() || input.closed {
            return;
        }
        input.buffered += n;
        input.chunks.push_back(chunk);
        let max = self.shared.max_read;
        if max != 0 && input.buffered >= max {
            input.paused = true;
            self.input_paused = true;
            trace::connection_pause(self.shared.id, input.buffered);
        }
        drop(input);
        self.shared.input_ready.notify_all();
    }

    fn on_eof(&mut self) {
        trace::connection_read_fin(self.shared.id);
        self.reading = false;
        self.shared
            .transition(ConnectionState::Active, ConnectionState::Draining);
        self.shared.input.lock().eof = true;
        self.shared.input_ready.notify_all();
        if let Some(m) = &mut self.inbound {
            m.pause();
        }
    }

    /// Returns `true` when the operation should be retried on the next
    /// readiness event.
    fn on_io_error(&mut self, lp: &mut EventLoop, token: Token, op: &'static str, err: TransportError) -> bool {
        let id = self.shared.id;
        match err.errno() {
            Some(errno) if sys::is_would_block(errno) || errno == libc::EINTR => true,
            Some(errno) if sys::is_connection_reset(errno) => {
                trace::connection_reset(id, errno);
                self.abort_local(lp, token, AbortReason::PeerReset);
                false
            }
            errno => {
                trace::connection_error(id, op, errno);
                self.abort_local(lp, token, AbortReason::IoError(errno.unwrap_or(0)));
                false
            }
        }
    }

    fn flush_output(&mut self, lp: &mut EventLoop, token: Token) {
        if self.write_blocked || self.finished {
            return;
        }
        let mut sent = 0usize;
        let mut failure = None;
        let shutdown = {
            let mut guard = self.shared.output.lock();
            let output = &mut *guard;
            while let Some(front) = output.chunks.front_mut() {
                match self.handle.send(&front[..]) {
                    Ok(0) => {
                        self.write_blocked = true;
                        break;
                    }
                    Ok(n) => {
                        if n >= front.len() {
                            output.chunks.pop_front();
                        } else {
                            front.advance(n);
                        }
                        output.buffered -= n;
                        output.written += n as u64;
                        sent += n;
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            if output.error.is_some() {
                None
            } else {
                Some(output.shutdown_requested && output.chunks.is_empty())
            }
        };

        if sent > 0 {
            self.shared.bytes_written.fetch_add(sent as u64, Ordering::Relaxed);
            self.stats.record_written(sent);
            if let Some(m) = &mut self.outbound {
                m.observe(sent);
            }
            trace::connection_write(self.shared.id, sent);
            self.shared.output_ready.notify_all();
        }
        if let Some(e) = failure {
            if self.on_io_error(lp, token, "send", e) {
                self.write_blocked = true;
            }
            return;
        }
        match shutdown {
            // Failed by an application abort the loop has not seen yet.
            None => self.abort_local(lp, token, AbortReason::Application),
            Some(true) => self.finish_graceful(lp, token),
            Some(false) => {}
        }
    }

    fn finish_graceful(&mut self, lp: &mut EventLoop, token: Token) {
        if !self.fin_sent {
            self.fin_sent = true;
            trace::connection_write_fin(self.shared.id);
            if let Err(e) = self.handle.shutdown_write() {
                tracing::debug!(conn = %self.shared.id, error = %e, "shutdown(SHUT_WR) failed");
            }
        }
        lp.deregister(token);
        self.finish(None);
    }

    /// Tear down from the loop side. A reason recorded earlier by the
    /// application wins over `reason`.
    fn abort_local(&mut self, lp: &mut EventLoop, token: Token, reason: AbortReason) {
        if self.finished {
            return;
        }
        self.shared.closing.store(true, Ordering::Release);
        let reason = *self.shared.abort_reason.lock().get_or_insert(reason);
        self.shared.fail(reason.to_error());
        lp.deregister(token);
        self.finish(Some(reason));
    }

    fn finish(&mut self, reason: Option<AbortReason>) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.shared.set_state(ConnectionState::Closed);
        self.shared.close_streams();
        self.handle.release();
        self.lease.take();
        self.stats.record_closed();
        trace::connection_closed(
            self.shared.id,
            reason,
            self.shared.bytes_read.load(Ordering::Relaxed),
            self.shared.bytes_written.load(Ordering::Relaxed),
        );
    }

    fn sync_monitors(&mut self, now: Instant) {
        if self.shared.upgraded.load(Ordering::Acquire) {
            for m in self.inbound.iter_mut().chain(self.outbound.iter_mut()) {
                m.exempt();
            }
            return;
        }
        let want_inbound = {
            let input = self.shared.input.lock();
            input.waiting > 0 && !input.paused && !input.eof && input.error.is_none()
        };
        let want_outbound = self.shared.output.lock().buffered > 0;

        if let Some(m) = &mut self.inbound {
            set_timing(m, want_inbound, now);
        }
        if let Some(m) = &mut self.outbound {
            set_timing(m, want_outbound, now);
        }
    }
}

fn set_timing(monitor: &mut MinimumRateMonitor, want: bool, now: Instant) {
    if want {
        monitor.start(now);
        monitor.resume(now);
    } else {
        monitor.pause();
    }
}

impl IoHandler for ConnectionDriver {
    fn on_ready(&mut self, lp: &mut EventLoop, token: Token, ready: Ready) {
        if self.finished {
            return;
        }
        let failed = ready.is_hup() || ready.is_error();
        if self.reading && !self.input_paused && (ready.is_readable() || failed) {
            self.read_ready(lp, token);
            if self.finished {
                return;
            }
        }
        if self.write_blocked && (ready.is_writable() || failed) {
            self.write_blocked = false;
            self.flush_output(lp, token);
            if self.finished {
                return;
            }
        }
        self.update_interest(lp, token);
    }

    fn on_wakeup(&mut self, lp: &mut EventLoop, token: Token) {
        if self.finished {
            return;
        }
        self.shared.notify_pending.store(false, Ordering::Release);

        if self.shared.closing.load(Ordering::Acquire) {
            let reason = *self.shared.abort_reason.lock();
            if let Some(reason) = reason {
                self.abort_local(lp, token, reason);
                return;
            }
            self.reading = false;
        }

        if self.input_paused {
            let mut input = self.shared.input.lock();
            if input.buffered <= self.shared.resume_threshold() {
                input.paused = false;
                self.input_paused = false;
                trace::connection_resume(self.shared.id, input.buffered);
            }
        }

        self.flush_output(lp, token);
        if self.finished {
            return;
        }
        self.update_interest(lp, token);
    }

    fn on_tick(&mut self, lp: &mut EventLoop, token: Token, now: Instant) {
        if self.finished {
            return;
        }
        self.sync_monitors(now);

        let mut violation = None;
        for m in self.inbound.iter_mut().chain(self.outbound.iter_mut()) {
            if let RateVerdict::Violated { achieved } = m.tick(now) {
                violation = Some((m.direction(), achieved, m.rate().bytes_per_second()));
                break;
            }
        }
        if let Some((direction, achieved, required)) = violation {
            trace::rate_violation(self.shared.id, direction, achieved, required);
            self.stats.record_rate_violation();
            self.abort_local(lp, token, AbortReason::RateViolation(direction));
        }
    }

    fn on_close(&mut self, lp: &mut EventLoop, token: Token) {
        self.abort_local(lp, token, AbortReason::ServerShutdown);
    }
}

impl Drop for ConnectionDriver {
    fn drop(&mut self) {
        if !self.finished {
            let reason = *self
                .shared
                .abort_reason
                .lock()
                .get_or_insert(AbortReason::ServerShutdown);
            self.shared.closing.store(true, Ordering::Release);
            self.shared.fail(reason.to_error());
            self.finish(Some(reason));
        }
    }
}
