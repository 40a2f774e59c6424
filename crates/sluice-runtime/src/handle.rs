//! Owned native handles
//!
//! A [`NativeHandle`] owns exactly one descriptor and is bound to the loop
//! thread that created it. Every native call validates the caller against
//! that owner before touching the descriptor.
//!
//! ```text
//!   create ──► Created ──open──► Open ──release──► Closing ──► Closed
//!                                                   (fd swapped to -1
//!                                                    before close(2))
//! ```
//!
//! `release` may race with itself from any thread; the atomic swap makes
//! sure exactly one caller reaches `close(2)`.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::thread::{self, ThreadId};

use sluice_core::constants::INVALID_FD;
use sluice_core::error::{Result, TransportError};
use sluice_core::state::HandleState;

use crate::event_loop::EventLoop;
use crate::sys;

/// What a handle's descriptor refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Listening TCP socket
    Listener,
    /// Connected TCP stream
    Tcp,
}

pub struct NativeHandle {
    fd: AtomicI32,
    kind: HandleKind,
    owner: ThreadId,
    state: AtomicU8,
}

impl NativeHandle {
    /// Take ownership of `fd` for `lp`. The handle records the loop's
    /// thread as its owner for life.
    pub fn create(lp: &EventLoop, kind: HandleKind, fd: RawFd) -> Self {
        Self::with_owner(lp.thread_id(), kind, fd)
    }

    pub(crate) fn with_owner(owner: ThreadId, kind: HandleKind, fd: RawFd) -> Self {
        Self {
            fd: AtomicI32::new(fd),
            kind,
            owner,
            state: AtomicU8::new(HandleState::Created.into()),
        }
    }

    /// Move a created handle to `Open`. Fails once release has begun.
    pub fn open(&self) -> Result<()> {
        self.check_owner()?;
        self.state
            .compare_exchange(
                HandleState::Created.into(),
                HandleState::Open.into(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .or_else(|cur| {
                if HandleState::from(cur) == HandleState::Open {
                    Ok(())
                } else {
                    Err(TransportError::ConnectionClosed)
                }
            })
    }

    #[inline]
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    #[inline]
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    #[inline]
    pub fn state(&self) -> HandleState {
        HandleState::from(self.state.load(Ordering::Acquire))
    }

    /// Current descriptor, or [`INVALID_FD`] once released
    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    #[inline]
    fn check_owner(&self) -> Result<()> {
        if thread::current().id() != self.owner {
            return Err(TransportError::WrongThread);
        }
        Ok(())
    }

    /// Owner thread and open state, checked before every native call.
    /// Returns the live descriptor.
    pub fn validate(&self) -> Result<RawFd> {
        self.check_owner()?;
        let fd = self.raw_fd();
        if fd == INVALID_FD || !self.state().is_usable() {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(fd)
    }

    /// Close the descriptor. Idempotent and callable from any thread;
    /// returns `true` only for the call that actually closed it. A failed
    /// `close(2)` still leaves the handle `Closed`.
    pub fn release(&self) -> bool {
        let fd = self.fd.swap(INVALID_FD, Ordering::AcqRel);
        if fd == INVALID_FD {
            return false;
        }
        self.state.store(HandleState::Closing.into(), Ordering::Release);
        if let Err(errno) = sys::close(fd) {
            tracing::debug!(fd, errno, kind = ?self.kind, "close failed");
        }
        self.state.store(HandleState::Closed.into(), Ordering::Release);
        true
    }

    // Native calls. Each validates first and reports the raw errno.

    pub(crate) fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.validate()?;
        sys::recv(fd, buf).map_err(|errno| TransportError::os("recv", errno))
    }

    pub(crate) fn send(&self, buf: &[u8]) -> Result<usize> {
        let fd = self.validate()?;
        sys::send(fd, buf).map_err(|errno| TransportError::os("send", errno))
    }

    pub(crate) fn shutdown_write(&self) -> Result<()> {
        let fd = self.validate()?;
        sys::shutdown_write(fd).map_err(|errno| TransportError::os("shutdown", errno))
    }

    pub(crate) fn accept(&self) -> Result<(std::os::fd::OwnedFd, Option<std::net::SocketAddr>)> {
        let fd = self.validate()?;
        sys::accept(fd).map_err(|errno| TransportError::os("accept4", errno))
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeHandle")
            .field("fd", &self.raw_fd())
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;
    use std::sync::Arc;

    fn socket_fd() -> RawFd {
        sys::listen_socket(&"127.0.0.1:0".parse().unwrap(), false, 1)
            .expect("socket")
            .into_raw_fd()
    }

    #[test]
    fn test_release_is_idempotent() {
        let h = NativeHandle::with_owner(thread::current().id(), HandleKind::Listener, socket_fd());
        h.open().unwrap();
        assert_eq!(h.state(), HandleState::Open);

        assert!(h.release());
        for _ in 0..5 {
            assert!(!h.release());
        }
        assert_eq!(h.raw_fd(), INVALID_FD);
        assert_eq!(h.state(), HandleState::Closed);
        assert_eq!(h.validate(), Err(TransportError::ConnectionClosed));
    }

    #[test]
    fn test_concurrent_release_closes_once() {
        let h = Arc::new(NativeHandle::with_owner(
            thread::current().id(),
            HandleKind::Tcp,
            socket_fd(),
        ));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let h = h.clone();
                thread::spawn(move || h.release())
            })
            .collect();
        let closed = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(closed, 1);
        assert_eq!(h.raw_fd(), INVALID_FD);
    }

    #[test]
    fn test_wrong_thread_rejected() {
        let h = Arc::new(NativeHandle::with_owner(
            thread::current().id(),
            HandleKind::Listener,
            socket_fd(),
        ));
        h.open().unwrap();
        assert!(h.validate().is_ok());

        let other = h.clone();
        let res = thread::spawn(move || other.validate()).join().unwrap();
        assert_eq!(res, Err(TransportError::WrongThread));

        // Release is allowed from anywhere.
        let other = h.clone();
        assert!(thread::spawn(move || other.release()).join().unwrap());
        assert_eq!(h.state(), HandleState::Closed);
    }

    #[test]
    fn test_open_after_release_fails() {
        let h = NativeHandle::with_owner(thread::current().id(), HandleKind::Tcp, socket_fd());
        h.release();
        assert_eq!(h.open(), Err(TransportError::ConnectionClosed));
    }
}
