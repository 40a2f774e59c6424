//! Thin libc wrappers: sockets, epoll, eventfd, errno classification
//!
//! Everything here is a direct syscall with the OS error code surfaced
//! unchanged. Lifecycle rules (owner thread, exactly-once close) live in
//! [`crate::handle`].

use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;

use sluice_core::error::{Result, TransportError};

/// Raw syscall outcome: the value, or the errno
pub(crate) type SysResult<T> = std::result::Result<T, i32>;

#[inline]
pub(crate) fn last_errno() -> i32 {
    Errno::last() as i32
}

// ============================================================================
// errno classification
// ============================================================================

#[inline]
pub(crate) fn is_would_block(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK
}

/// Accept failures that only affect the one pending connection; the
/// listener keeps going.
pub(crate) fn is_transient_accept(errno: i32) -> bool {
    is_would_block(errno)
        || matches!(
            errno,
            libc::ECONNABORTED
                | libc::EINTR
                | libc::EPROTO
                | libc::EPERM
                | libc::ENETDOWN
                | libc::ENOPROTOOPT
                | libc::EHOSTDOWN
                | libc::ENONET
                | libc::EHOSTUNREACH
                | libc::EOPNOTSUPP
                | libc::ENETUNREACH
        )
}

/// Out of descriptors or kernel memory: back off, then retry.
pub(crate) fn is_resource_exhaustion(errno: i32) -> bool {
    matches!(errno, libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
}

/// The peer went away underneath us.
pub(crate) fn is_connection_reset(errno: i32) -> bool {
    matches!(
        errno,
        libc::ECONNRESET | libc::EPIPE | libc::ENOTCONN | libc::ETIMEDOUT
    )
}

// ============================================================================
// Socket addresses
// ============================================================================

pub(crate) fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = a.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                };
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = a.port().to_be();
                (*sin6).sin6_flowinfo = a.flowinfo();
                (*sin6).sin6_addr = libc::in6_addr {
                    s6_addr: a.ip().octets(),
                };
                (*sin6).sin6_scope_id = a.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

pub(crate) fn from_sockaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 =
                unsafe { &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

fn sock_name(
    fd: RawFd,
    f: unsafe extern "C" fn(libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int,
    op: &'static str,
) -> Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe { f(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc != 0 {
        return Err(TransportError::os(op, last_errno()));
    }
    from_sockaddr(&storage).ok_or(TransportError::os(op, libc::EAFNOSUPPORT))
}

pub(crate) fn local_addr(fd: RawFd) -> Result<SocketAddr> {
    sock_name(fd, libc::getsockname, "getsockname")
}

pub(crate) fn peer_addr(fd: RawFd) -> Result<SocketAddr> {
    sock_name(fd, libc::getpeername, "getpeername")
}

// ============================================================================
// Sockets
// ============================================================================

fn set_int_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> SysResult<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(last_errno());
    }
    Ok(())
}

pub(crate) fn set_nodelay(fd: RawFd, enable: bool) -> SysResult<()> {
    set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, enable as libc::c_int)
}

/// Create, configure, bind and listen. The socket is non-blocking and
/// close-on-exec.
pub(crate) fn listen_socket(addr: &SocketAddr, reuse_port: bool, backlog: i32) -> Result<OwnedFd> {
    let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(TransportError::Initialization {
            what: "listen socket",
            errno: last_errno(),
        });
    }
    // Closed on every early return below.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
        .map_err(|errno| TransportError::os("setsockopt(SO_REUSEADDR)", errno))?;
    if reuse_port {
        set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)
            .map_err(|errno| TransportError::os("setsockopt(SO_REUSEPORT)", errno))?;
    }

    let (storage, len) = to_sockaddr(addr);
    let rc = unsafe {
        libc::bind(
            fd,
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if rc != 0 {
        return Err(bind_error(*addr, last_errno()));
    }

    if unsafe { libc::listen(fd, backlog) } != 0 {
        return Err(TransportError::os("listen", last_errno()));
    }
    Ok(owned)
}

pub(crate) fn bind_error(addr: SocketAddr, errno: i32) -> TransportError {
    match errno {
        libc::EADDRINUSE => TransportError::AddressInUse { addr, errno },
        libc::EACCES | libc::EPERM => TransportError::Permission { addr, errno },
        _ => TransportError::os("bind", errno),
    }
}

/// Accept one pending connection without blocking.
pub(crate) fn accept(fd: RawFd) -> SysResult<(OwnedFd, Option<SocketAddr>)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::accept4(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if rc < 0 {
        return Err(last_errno());
    }
    Ok((unsafe { OwnedFd::from_raw_fd(rc) }, from_sockaddr(&storage)))
}

pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> SysResult<usize> {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n < 0 {
        return Err(last_errno());
    }
    Ok(n as usize)
}

/// `send` with `MSG_NOSIGNAL`: a closed peer yields `EPIPE`, never SIGPIPE.
pub(crate) fn send(fd: RawFd, buf: &[u8]) -> SysResult<usize> {
    let n = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if n < 0 {
        return Err(last_errno());
    }
    Ok(n as usize)
}

pub(crate) fn shutdown_write(fd: RawFd) -> SysResult<()> {
    if unsafe { libc::shutdown(fd, libc::SHUT_WR) } != 0 {
        return Err(last_errno());
    }
    Ok(())
}

pub(crate) fn close(fd: RawFd) -> SysResult<()> {
    if unsafe { libc::close(fd) } != 0 {
        return Err(last_errno());
    }
    Ok(())
}

// ============================================================================
// epoll / eventfd
// ============================================================================

pub(crate) fn epoll_create() -> SysResult<OwnedFd> {
    let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if fd < 0 {
        return Err(last_errno());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub(crate) fn epoll_ctl(epfd: RawFd, op: libc::c_int, fd: RawFd, events: u32, data: u64) -> SysResult<()> {
    let mut ev = libc::epoll_event { events, u64: data };
    if unsafe { libc::epoll_ctl(epfd, op, fd, &mut ev) } != 0 {
        return Err(last_errno());
    }
    Ok(())
}

/// Wait for readiness; `timeout_ms < 0` blocks indefinitely. `EINTR` is
/// reported as zero events.
pub(crate) fn epoll_wait(epfd: RawFd, events: &mut [libc::epoll_event], timeout_ms: i32) -> SysResult<usize> {
    let n = unsafe {
        libc::epoll_wait(
            epfd,
            events.as_mut_ptr(),
            events.len() as libc::c_int,
            timeout_ms,
        )
    };
    if n < 0 {
        let errno = last_errno();
        if errno == libc::EINTR {
            return Ok(0);
        }
        return Err(errno);
    }
    Ok(n as usize)
}

pub(crate) fn eventfd_create() -> SysResult<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(last_errno());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Bump the eventfd counter. `EAGAIN` means a wakeup is already pending.
pub(crate) fn eventfd_signal(fd: RawFd) -> SysResult<()> {
    let val: u64 = 1;
    let ret = unsafe {
        libc::write(
            fd,
            &val as *const u64 as *const libc::c_void,
            mem::size_of::<u64>(),
        )
    };
    if ret < 0 {
        let errno = last_errno();
        if errno == libc::EAGAIN {
            return Ok(());
        }
        return Err(errno);
    }
    Ok(())
}

/// Reset the eventfd counter.
pub(crate) fn eventfd_drain(fd: RawFd) {
    let mut val: u64 = 0;
    unsafe {
        libc::read(
            fd,
            &mut val as *mut u64 as *mut libc::c_void,
            mem::size_of::<u64>(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_sockaddr_roundtrip_v4_v6() {
        let addrs: [SocketAddr; 2] = ["127.0.0.1:8080".parse().unwrap(), "[::1]:443".parse().unwrap()];
        for addr in addrs {
            let (storage, _) = to_sockaddr(&addr);
            assert_eq!(from_sockaddr(&storage), Some(addr));
        }
    }

    #[test]
    fn test_errno_classes() {
        assert!(is_transient_accept(libc::EAGAIN));
        assert!(is_transient_accept(libc::ECONNABORTED));
        assert!(!is_transient_accept(libc::EMFILE));
        assert!(is_resource_exhaustion(libc::EMFILE));
        assert!(is_resource_exhaustion(libc::ENOBUFS));
        assert!(!is_resource_exhaustion(libc::EBADF));
        assert!(is_connection_reset(libc::ECONNRESET));
        assert!(is_connection_reset(libc::EPIPE));
        assert!(!is_connection_reset(libc::EAGAIN));
    }

    #[test]
    fn test_listen_socket_ephemeral_port() {
        let fd = listen_socket(&"127.0.0.1:0".parse().unwrap(), false, 16).expect("bind");
        let addr = local_addr(fd.as_raw_fd()).expect("getsockname");
        assert_ne!(addr.port(), 0);

        match listen_socket(&addr, false, 16) {
            Err(TransportError::AddressInUse { addr: a, errno }) => {
                assert_eq!(a, addr);
                assert_eq!(errno, libc::EADDRINUSE);
            }
            other => panic!("expected AddressInUse, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_eventfd_signal_drain() {
        let fd = eventfd_create().expect("eventfd");
        eventfd_signal(fd.as_raw_fd()).expect("signal");
        eventfd_signal(fd.as_raw_fd()).expect("signal");
        eventfd_drain(fd.as_raw_fd());
        let mut val: u64 = 0;
        let n = unsafe {
            libc::read(fd.as_raw_fd(), &mut val as *mut u64 as *mut libc::c_void, 8)
        };
        assert!(n < 0);
        assert_eq!(last_errno(), libc::EAGAIN);
    }
}
