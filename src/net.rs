//! Thin wrappers over the raw TCP socket operations.
//!
//! Everything here deals in raw file descriptors: a [`Dispatcher`] owns its
//! descriptor directly and these helpers never hold on to one. The sockets
//! they create are always non-blocking and close-on-exec.
//!
//! [`Dispatcher`]: ../dispatcher/struct.Dispatcher.html

use std::{
    io::{Error, ErrorKind, Result},
    mem::ManuallyDrop,
    net::SocketAddr,
    os::unix::io::{FromRawFd, IntoRawFd, RawFd},
};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::util::cvt;

fn stream_socket(addr: SocketAddr) -> Result<Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let type_ = Type::STREAM.nonblocking().cloexec();
    Socket::new(domain, type_, Some(Protocol::TCP))
}

/// Creates a TCP listening socket bound to `addr` and returns its descriptor.
///
/// The usual server setup: reuse-addr, bind, and a generous listen backlog.
/// Pass a port of 0 to let the kernel pick one; [`local_identity()`] tells
/// you what it picked.
///
/// [`local_identity()`]: fn.local_identity.html
pub fn tcp_listener(addr: SocketAddr) -> Result<RawFd> {
    let socket = stream_socket(addr)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(511)?;
    Ok(socket.into_raw_fd())
}

/// Initiates a non-blocking TCP connection to `addr`.
///
/// Returns the descriptor and whether the connect is still in progress. When
/// it is, the socket becomes writable once the connect resolves; whether it
/// actually succeeded is then told by [`peer_identity()`].
///
/// [`peer_identity()`]: fn.peer_identity.html
pub fn tcp_connect(addr: SocketAddr) -> Result<(RawFd, bool)> {
    let socket = stream_socket(addr)?;
    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => Ok((socket.into_raw_fd(), false)),
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
            Ok((socket.into_raw_fd(), true))
        }
        Err(e) => Err(e),
    }
}

/// Accepts one pending connection on a listening descriptor.
///
/// The new descriptor is owned by the caller.
pub fn accept(fd: RawFd) -> Result<RawFd> {
    // SAFETY: This is just an external function; we pass no pointers.
    cvt(unsafe {
        libc::accept4(
            fd,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_CLOEXEC,
        )
    })
}

/// Borrows a raw descriptor as a `socket2::Socket` without taking ownership.
fn borrow_socket(fd: RawFd) -> ManuallyDrop<Socket> {
    // SAFETY: `ManuallyDrop` keeps the borrowed socket from closing the
    // descriptor it does not own.
    ManuallyDrop::new(unsafe { Socket::from_raw_fd(fd) })
}

/// Resolves the peer address of a connected socket.
///
/// Fails (with `ENOTCONN`) on a socket that is not connected, which makes
/// this double as the probe for whether a lazily connected socket has
/// actually established its connection yet.
pub fn peer_identity(fd: RawFd) -> Result<SocketAddr> {
    let socket = borrow_socket(fd);
    socket
        .peer_addr()?
        .as_socket()
        .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "peer is not an internet address"))
}

/// Resolves the locally bound address of a socket.
pub fn local_identity(fd: RawFd) -> Result<SocketAddr> {
    let socket = borrow_socket(fd);
    socket
        .local_addr()?
        .as_socket()
        .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "socket has no internet address"))
}
