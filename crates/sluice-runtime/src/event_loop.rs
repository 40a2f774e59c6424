//! # EventLoop: single-threaded readiness loop
//!
//! One `EventLoop` per loop thread. It owns an epoll instance, an eventfd
//! waker, the registered [`IoHandler`]s and a timer heap.
//!
//! ```text
//!            other threads                        loop thread
//!   LoopHandle::post / notify ──► SegQueue ──┐
//!   LoopStopper::stop ─────────► stop flag ──┤
//!                                  eventfd ──┴──► epoll_wait
//!                                                   │
//!                         timers ◄── run_timers ◄───┤
//!                         posted ◄── run_posted ◄───┤
//!              IoHandler::on_ready ◄── dispatch ◄───┘
//! ```
//!
//! Handlers run synchronously on the loop thread and must never block.
//! While a handler runs it is taken out of its slot, so it receives
//! `&mut EventLoop` and may register, reregister or deregister anything,
//! itself included.
//!
//! Readiness is level-triggered. A registration with [`Interest::NONE`] is
//! removed from epoll entirely (it stays in the slab), so a half-closed
//! socket nobody is interested in cannot spin the loop on `EPOLLHUP`.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;

use sluice_core::constants::READ_CHUNK_SIZE;
use sluice_core::error::{Result, TransportError};

use crate::sys;
use crate::timer::{TimerId, TimerQueue, TimerStats};

/// epoll data value reserved for the waker; no token packs to it
const WAKER_DATA: u64 = u64::MAX;

const MAX_EVENTS: usize = 256;

/// Identifies a registration on its loop
///
/// The generation changes every time a slot is reused, so events and
/// notifications addressed to a previous occupant are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    index: u32,
    generation: u32,
}

impl Token {
    #[inline]
    fn pack(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    fn unpack(data: u64) -> Self {
        Token {
            index: data as u32,
            generation: (data >> 32) as u32,
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Readiness a registration wants to hear about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const NONE: Interest = Interest { readable: false, writable: false };
    pub const READABLE: Interest = Interest { readable: true, writable: false };
    pub const WRITABLE: Interest = Interest { readable: false, writable: true };
    pub const BOTH: Interest = Interest { readable: true, writable: true };

    #[inline]
    pub fn is_none(&self) -> bool {
        !self.readable && !self.writable
    }

    fn to_epoll(self) -> u32 {
        let mut events = 0u32;
        if self.readable {
            events |= libc::EPOLLIN as u32;
        }
        if self.writable {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }
}

/// Readiness reported by epoll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready(u32);

impl Ready {
    #[inline]
    pub fn is_readable(&self) -> bool {
        self.0 & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.0 & libc::EPOLLOUT as u32 != 0
    }

    #[inline]
    pub fn is_hup(&self) -> bool {
        self.0 & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.0 & libc::EPOLLERR as u32 != 0
    }
}

/// Loop-side half of a registration
///
/// All callbacks run on the loop thread. Only `on_ready` is required.
pub trait IoHandler {
    /// The registered descriptor is ready
    fn on_ready(&mut self, lp: &mut EventLoop, token: Token, ready: Ready);

    /// Someone called [`LoopHandle::notify`] (or [`EventLoop::wakeup`]) for
    /// this token
    fn on_wakeup(&mut self, _lp: &mut EventLoop, _token: Token) {}

    /// Periodic heartbeat
    fn on_tick(&mut self, _lp: &mut EventLoop, _token: Token, _now: Instant) {}

    /// The loop is closing this handler. Implementations deregister
    /// themselves and release their handle.
    fn on_close(&mut self, lp: &mut EventLoop, token: Token) {
        lp.deregister(token);
    }
}

pub type BoxedHandler = Box<dyn IoHandler>;

/// How long [`EventLoop::run`] keeps going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Until stopped or nothing referenced remains
    Default,
    /// One iteration, blocking for I/O if nothing is pending
    Once,
    /// One iteration, never blocking
    NoWait,
}

type PostedFn = Box<dyn FnOnce(&mut EventLoop) + Send>;

enum Posted {
    Call(PostedFn),
    Notify(Token),
}

/// State reachable from other threads
pub(crate) struct LoopShared {
    queue: SegQueue<Posted>,
    waker: OwnedFd,
    stop: AtomicBool,
    closed: AtomicBool,
    thread: ThreadId,
}

impl LoopShared {
    fn wake(&self) {
        if let Err(errno) = sys::eventfd_signal(self.waker.as_raw_fd()) {
            tracing::warn!(errno, "loop wakeup failed");
        }
    }
}

/// Cloneable, `Send + Sync` handle for posting work to a loop
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Run `f` on the loop thread during its next iteration.
    ///
    /// Fails with [`TransportError::LoopStopped`] once the loop is gone.
    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut EventLoop) + Send + 'static,
    {
        self.push(Posted::Call(Box::new(f)))
    }

    /// Deliver `on_wakeup` to `token`'s handler on the loop thread.
    pub fn notify(&self, token: Token) -> Result<()> {
        self.push(Posted::Notify(token))
    }

    fn push(&self, item: Posted) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::LoopStopped);
        }
        self.shared.queue.push(item);
        self.shared.wake();
        Ok(())
    }

    pub fn stopper(&self) -> LoopStopper {
        LoopStopper {
            shared: self.shared.clone(),
        }
    }

    #[inline]
    pub fn thread_id(&self) -> ThreadId {
        self.shared.thread
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// True when called from the loop's own thread
    #[inline]
    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread", &self.shared.thread)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Stops a running loop from any thread
#[derive(Clone)]
pub struct LoopStopper {
    shared: Arc<LoopShared>,
}

impl LoopStopper {
    /// Ask `run` to return after its current iteration.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake();
    }
}

struct Registration {
    fd: RawFd,
    interest: Interest,
    in_epoll: bool,
    referenced: bool,
    /// `None` while the handler is being dispatched
    handler: Option<BoxedHandler>,
}

struct Slot {
    generation: u32,
    entry: Option<Registration>,
}

pub struct EventLoop {
    epoll: OwnedFd,
    shared: Arc<LoopShared>,
    slots: Vec<Slot>,
    free: Vec<u32>,
    active_refs: usize,
    waker_ref: bool,
    timers: TimerQueue,
    now: Instant,
    events: Vec<libc::epoll_event>,
    read_buf: Vec<u8>,
}

impl EventLoop {
    /// Create a loop bound to the calling thread.
    pub fn new() -> Result<Self> {
        let epoll = sys::epoll_create()
            .map_err(|errno| TransportError::Initialization { what: "epoll", errno })?;
        let waker = sys::eventfd_create()
            .map_err(|errno| TransportError::Initialization { what: "eventfd", errno })?;
        sys::epoll_ctl(
            epoll.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            waker.as_raw_fd(),
            libc::EPOLLIN as u32,
            WAKER_DATA,
        )
        .map_err(|errno| TransportError::Initialization { what: "loop waker", errno })?;

        Ok(Self {
            epoll,
            shared: Arc::new(LoopShared {
                queue: SegQueue::new(),
                waker,
                stop: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                thread: thread::current().id(),
            }),
            slots: Vec::new(),
            free: Vec::new(),
            active_refs: 0,
            waker_ref: false,
            timers: TimerQueue::new(),
            now: Instant::now(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
            read_buf: vec![0u8; READ_CHUNK_SIZE],
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn stopper(&self) -> LoopStopper {
        LoopStopper {
            shared: self.shared.clone(),
        }
    }

    #[inline]
    pub fn thread_id(&self) -> ThreadId {
        self.shared.thread
    }

    /// Loop time, refreshed once per iteration
    #[inline]
    pub fn now(&self) -> Instant {
        self.now
    }

    #[inline]
    fn update_time(&mut self) {
        self.now = Instant::now();
    }

    /// Scratch buffer for reads; contents are garbage between uses
    #[inline]
    pub fn read_buffer(&mut self) -> &mut [u8] {
        &mut self.read_buf
    }

    /// Number of registrations
    pub fn handler_count(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register `fd` with `handler`. The registration is referenced.
    pub fn register(&mut self, fd: RawFd, interest: Interest, handler: BoxedHandler) -> Result<Token> {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        let token = Token {
            index,
            generation: slot.generation,
        };

        let in_epoll = !interest.is_none();
        if in_epoll {
            if let Err(errno) = sys::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                fd,
                interest.to_epoll(),
                token.pack(),
            ) {
                self.free.push(index);
                return Err(TransportError::os("epoll_ctl(ADD)", errno));
            }
        }

        self.slots[index as usize].entry = Some(Registration {
            fd,
            interest,
            in_epoll,
            referenced: true,
            handler: Some(handler),
        });
        self.active_refs += 1;
        Ok(token)
    }

    fn registration_mut(&mut self, token: Token) -> Option<&mut Registration> {
        let slot = self.slots.get_mut(token.index())?;
        if slot.generation != token.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Change the readiness a registration is interested in.
    pub fn reregister(&mut self, token: Token, interest: Interest) -> Result<()> {
        let epfd = self.epoll.as_raw_fd();
        let reg = self
            .registration_mut(token)
            .ok_or(TransportError::ConnectionClosed)?;
        let want_epoll = !interest.is_none();
        if reg.interest == interest && reg.in_epoll == want_epoll {
            return Ok(());
        }

        let result = match (reg.in_epoll, want_epoll) {
            (true, false) => sys::epoll_ctl(epfd, libc::EPOLL_CTL_DEL, reg.fd, 0, 0)
                .map_err(|errno| TransportError::os("epoll_ctl(DEL)", errno)),
            (true, true) => sys::epoll_ctl(epfd, libc::EPOLL_CTL_MOD, reg.fd, interest.to_epoll(), token.pack())
                .map_err(|errno| TransportError::os("epoll_ctl(MOD)", errno)),
            (false, true) => sys::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, reg.fd, interest.to_epoll(), token.pack())
                .map_err(|errno| TransportError::os("epoll_ctl(ADD)", errno)),
            (false, false) => Ok(()),
        };
        result?;
        reg.interest = interest;
        reg.in_epoll = want_epoll;
        Ok(())
    }

    /// Remove a registration. Returns its handler unless it is the one
    /// currently being dispatched (that one is dropped when its callback
    /// returns).
    ///
    /// Must run before the descriptor is closed: epoll registrations are
    /// keyed by descriptor number.
    pub fn deregister(&mut self, token: Token) -> Option<BoxedHandler> {
        let epfd = self.epoll.as_raw_fd();
        let slot = self.slots.get_mut(token.index())?;
        if slot.generation != token.generation {
            return None;
        }
        let reg = slot.entry.take()?;
        if reg.in_epoll {
            let _ = sys::epoll_ctl(epfd, libc::EPOLL_CTL_DEL, reg.fd, 0, 0);
        }
        if reg.referenced {
            self.active_refs -= 1;
        }
        self.free.push(token.index);
        reg.handler
    }

    /// Referenced registrations keep [`run`](Self::run) going.
    pub fn set_ref(&mut self, token: Token, referenced: bool) {
        let mut delta = 0isize;
        if let Some(reg) = self.registration_mut(token) {
            if reg.referenced != referenced {
                reg.referenced = referenced;
                delta = if referenced { 1 } else { -1 };
            }
        }
        self.active_refs = (self.active_refs as isize + delta) as usize;
    }

    /// Keep the loop alive with no registrations, waiting for posted work.
    pub fn ref_waker(&mut self) {
        self.waker_ref = true;
    }

    pub fn unref_waker(&mut self) {
        self.waker_ref = false;
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn dispatch<F>(&mut self, token: Token, f: F)
    where
        F: FnOnce(&mut BoxedHandler, &mut EventLoop),
    {
        let mut handler = match self.registration_mut(token).and_then(|r| r.handler.take()) {
            Some(h) => h,
            None => return,
        };
        f(&mut handler, self);
        if let Some(reg) = self.registration_mut(token) {
            if reg.handler.is_none() {
                reg.handler = Some(handler);
            }
        }
    }

    /// Deliver `on_wakeup` to `token` now.
    pub fn wakeup(&mut self, token: Token) {
        self.dispatch(token, |h, lp| h.on_wakeup(lp, token));
    }

    /// Deliver `on_close` to `token` now.
    pub fn close(&mut self, token: Token) {
        self.dispatch(token, |h, lp| h.on_close(lp, token));
    }

    /// Visit every registration. Handlers registered during the walk are
    /// not visited.
    pub fn walk<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut BoxedHandler, &mut EventLoop, Token),
    {
        let tokens: Vec<Token> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.entry.is_some())
            .map(|(i, s)| Token {
                index: i as u32,
                generation: s.generation,
            })
            .collect();
        for token in tokens {
            self.dispatch(token, |h, lp| f(h, lp, token));
        }
    }

    /// `on_close` every registration
    pub fn close_all(&mut self) {
        self.walk(|h, lp, token| h.on_close(lp, token));
    }

    /// `on_tick` every registration with the current loop time
    pub fn tick_handlers(&mut self) {
        self.update_time();
        let now = self.now;
        self.walk(|h, lp, token| h.on_tick(lp, token, now));
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Schedule `callback` after `after`, then every `repeat` if given.
    /// New timers are referenced.
    pub fn add_timer<F>(&mut self, after: Duration, repeat: Option<Duration>, callback: F) -> TimerId
    where
        F: FnMut(&mut EventLoop, TimerId) + 'static,
    {
        // A zero period would refire forever within one iteration.
        let repeat = repeat.map(|p| p.max(Duration::from_millis(1)));
        self.timers.insert(self.now + after, repeat, Box::new(callback))
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    pub fn set_timer_ref(&mut self, id: TimerId, referenced: bool) {
        self.timers.set_ref(id, referenced);
    }

    pub fn timer_stats(&self) -> TimerStats {
        self.timers.stats()
    }

    fn run_timers(&mut self) {
        while let Some((id, mut callback)) = self.timers.pop_expired(self.now) {
            callback(self, id);
            let now = self.now;
            self.timers.finish(id, callback, now);
        }
    }

    // ========================================================================
    // Run
    // ========================================================================

    /// Request `run` to return after the current iteration (loop thread).
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    #[inline]
    fn stop_requested(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    /// Anything referenced left to wait for
    pub fn alive(&self) -> bool {
        self.active_refs > 0
            || self.waker_ref
            || self.timers.has_referenced()
            || !self.shared.queue.is_empty()
    }

    /// Drive the loop. Returns 0 when no referenced handles remain,
    /// non-zero when it returned for another reason (stop, or a single
    /// iteration in `Once`/`NoWait` mode).
    pub fn run(&mut self, mode: RunMode) -> i32 {
        debug_assert_eq!(thread::current().id(), self.shared.thread);

        self.update_time();
        let mut alive = self.alive();
        while alive && !self.stop_requested() {
            self.run_timers();
            self.run_posted();

            let timeout = match mode {
                RunMode::NoWait => 0,
                RunMode::Once | RunMode::Default => self.poll_timeout(),
            };
            self.poll(timeout);

            self.update_time();
            self.run_timers();
            self.run_posted();

            alive = self.alive();
            if mode != RunMode::Default {
                break;
            }
        }
        self.shared.stop.store(false, Ordering::Release);
        alive as i32
    }

    fn poll_timeout(&mut self) -> i32 {
        if !self.shared.queue.is_empty() || self.stop_requested() {
            return 0;
        }
        match self.timers.next_deadline() {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                // Round up so a timer is never polled for early.
                let ms = wait.as_nanos().div_ceil(1_000_000);
                ms.min(i32::MAX as u128) as i32
            }
            None => -1,
        }
    }

    fn poll(&mut self, timeout_ms: i32) {
        let n = match sys::epoll_wait(self.epoll.as_raw_fd(), &mut self.events, timeout_ms) {
            Ok(n) => n,
            Err(errno) => {
                tracing::error!(errno, "epoll_wait failed");
                return;
            }
        };
        for i in 0..n {
            let ev = self.events[i];
            let data = ev.u64;
            let bits = ev.events;
            if data == WAKER_DATA {
                sys::eventfd_drain(self.shared.waker.as_raw_fd());
                continue;
            }
            let token = Token::unpack(data);
            self.dispatch(token, |h, lp| h.on_ready(lp, token, Ready(bits)));
        }
    }

    /// Run what is queued right now; work posted by these callbacks waits
    /// for the next iteration.
    fn run_posted(&mut self) {
        let mut budget = self.shared.queue.len();
        while budget > 0 {
            budget -= 1;
            match self.shared.queue.pop() {
                Some(Posted::Call(f)) => f(self),
                Some(Posted::Notify(token)) => self.wakeup(token),
                None => break,
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        while self.shared.queue.pop().is_some() {}
        // Handlers release their descriptors as they drop.
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::sync::atomic::AtomicUsize;

    use crate::handle::{HandleKind, NativeHandle};
    use sluice_core::state::HandleState;

    #[test]
    fn test_run_idle_returns_zero() {
        let mut lp = EventLoop::new().unwrap();
        assert!(!lp.alive());
        assert_eq!(lp.run(RunMode::Default), 0);
    }

    #[test]
    fn test_timer_fires_then_loop_exits() {
        let mut lp = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        lp.add_timer(Duration::from_millis(10), None, move |_, _| f.set(f.get() + 1));
        let start = Instant::now();
        assert_eq!(lp.run(RunMode::Default), 0);
        assert_eq!(fired.get(), 1);
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn test_repeating_timer_cancels_itself() {
        let mut lp = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        lp.add_timer(Duration::from_millis(1), Some(Duration::from_millis(1)), move |lp, id| {
            f.set(f.get() + 1);
            if f.get() == 3 {
                lp.cancel_timer(id);
            }
        });
        assert_eq!(lp.run(RunMode::Default), 0);
        assert_eq!(fired.get(), 3);
        assert_eq!(lp.timer_stats().active, 0);
    }

    #[test]
    fn test_unreferenced_timer_does_not_keep_alive() {
        let mut lp = EventLoop::new().unwrap();
        let id = lp.add_timer(Duration::from_secs(60), None, |_, _| {});
        lp.set_timer_ref(id, false);
        assert_eq!(lp.run(RunMode::Default), 0);
    }

    #[test]
    fn test_post_runs_on_loop_thread() {
        let mut lp = EventLoop::new().unwrap();
        lp.ref_waker();
        let handle = lp.handle();
        let loop_thread = thread::current().id();
        let ran = Arc::new(AtomicUsize::new(0));

        let r = ran.clone();
        let poster = thread::spawn(move || {
            handle
                .post(move |lp| {
                    assert_eq!(thread::current().id(), loop_thread);
                    r.fetch_add(1, Ordering::SeqCst);
                    lp.stop();
                })
                .unwrap();
        });
        assert_eq!(lp.run(RunMode::Default), 1);
        poster.join().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    struct Holder(Arc<NativeHandle>);

    impl IoHandler for Holder {
        fn on_ready(&mut self, _lp: &mut EventLoop, _token: Token, _ready: Ready) {}
    }

    #[test]
    fn test_stop_from_other_thread() {
        let mut lp = EventLoop::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = std::os::fd::IntoRawFd::into_raw_fd(a);
        let handle = Arc::new(NativeHandle::create(&lp, HandleKind::Tcp, fd));
        handle.open().unwrap();
        let token = lp
            .register(fd, Interest::READABLE, Box::new(Holder(handle.clone())))
            .unwrap();

        let stopper = lp.stopper();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stopper.stop();
        });

        let start = Instant::now();
        assert_ne!(lp.run(RunMode::Default), 0);
        assert!(start.elapsed() >= Duration::from_millis(40));
        t.join().unwrap();

        // Still registered and usable after the stop.
        assert_eq!(lp.handler_count(), 1);
        assert_eq!(handle.state(), HandleState::Open);
        assert_eq!(handle.validate(), Ok(fd));
        assert!(lp.deregister(token).is_some());
        assert!(handle.release());
    }

    struct EchoOnce {
        stream: UnixStream,
        got: Rc<Cell<usize>>,
    }

    impl IoHandler for EchoOnce {
        fn on_ready(&mut self, lp: &mut EventLoop, token: Token, ready: Ready) {
            assert!(ready.is_readable());
            let buf = lp.read_buffer();
            let n = sys::recv(self.stream.as_raw_fd(), buf).unwrap();
            self.got.set(self.got.get() + n);
            lp.deregister(token);
        }
    }

    #[test]
    fn test_readiness_dispatch_and_self_deregister() {
        let mut lp = EventLoop::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let got = Rc::new(Cell::new(0));
        let fd = a.as_raw_fd();
        lp.register(
            fd,
            Interest::READABLE,
            Box::new(EchoOnce {
                stream: a,
                got: got.clone(),
            }),
        )
        .unwrap();

        b.write_all(b"ping").unwrap();
        assert_eq!(lp.run(RunMode::Default), 0);
        assert_eq!(got.get(), 4);
        assert_eq!(lp.handler_count(), 0);
    }

    #[test]
    fn test_stale_token_ignored() {
        let mut lp = EventLoop::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let h1 = Arc::new(NativeHandle::create(&lp, HandleKind::Tcp, -1));
        let old = lp.register(fd, Interest::NONE, Box::new(Holder(h1))).unwrap();
        assert!(lp.deregister(old).is_some());

        let h2 = Arc::new(NativeHandle::create(&lp, HandleKind::Tcp, -1));
        let new = lp.register(fd, Interest::NONE, Box::new(Holder(h2))).unwrap();
        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert!(lp.deregister(old).is_none());
        assert!(lp.reregister(old, Interest::READABLE).is_err());
        assert!(lp.deregister(new).is_some());
    }

    #[test]
    fn test_post_after_drop_fails() {
        let lp = EventLoop::new().unwrap();
        let handle = lp.handle();
        drop(lp);
        assert!(handle.is_closed());
        assert_eq!(handle.post(|_| {}), Err(TransportError::LoopStopped));
    }

    #[test]
    fn test_nowait_returns_immediately() {
        let mut lp = EventLoop::new().unwrap();
        lp.ref_waker();
        let start = Instant::now();
        assert_eq!(lp.run(RunMode::NoWait), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_dropping_loop_releases_handles() {
        let mut lp = EventLoop::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = std::os::fd::IntoRawFd::into_raw_fd(a);
        let handle = Arc::new(NativeHandle::create(&lp, HandleKind::Tcp, fd));

        struct Shared(Arc<NativeHandle>);
        impl IoHandler for Shared {
            fn on_ready(&mut self, _lp: &mut EventLoop, _token: Token, _ready: Ready) {}
        }
        impl Drop for Shared {
            fn drop(&mut self) {
                self.0.release();
            }
        }

        lp.register(fd, Interest::READABLE, Box::new(Shared(handle.clone()))).unwrap();
        drop(lp);
        assert_eq!(handle.state(), HandleState::Closed);
    }
}
