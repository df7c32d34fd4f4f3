//! Socket creation and option helpers shared by the acceptor, connector, and
//! connection. socket2 covers creation and options; raw libc fills the gaps
//! (accept4 flags, /dev/null reserve fd).

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use socket2::{Domain, Protocol, Socket, Type};

/// New nonblocking TCP socket. close-on-exec is set by socket2 on Linux.
pub(crate) fn new_nonblocking(domain: Domain) -> io::Result<Socket> {
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Accept one pending connection, nonblocking and close-on-exec.
pub(crate) fn accept(listener: &Socket) -> io::Result<(Socket, SocketAddr)> {
    let fd = unsafe {
        libc::accept4(
            listener.as_raw_fd(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let socket = unsafe { Socket::from_raw_fd(fd) };
    let peer = peer_addr(&socket);
    Ok((socket, peer))
}

pub(crate) fn local_addr(socket: &Socket) -> SocketAddr {
    socket
        .local_addr()
        .ok()
        .and_then(|addr| addr.as_socket())
        .unwrap_or_else(unspecified)
}

pub(crate) fn peer_addr(socket: &Socket) -> SocketAddr {
    socket
        .peer_addr()
        .ok()
        .and_then(|addr| addr.as_socket())
        .unwrap_or_else(unspecified)
}

/// A connect that landed on the socket's own ephemeral port.
pub(crate) fn is_self_connect(socket: &Socket) -> bool {
    let local = local_addr(socket);
    let peer = peer_addr(socket);
    local.port() != 0 && local == peer
}

/// SO_REUSEPORT for load-balanced listeners; socket2 gates this behind a
/// feature, so set it directly.
pub(crate) fn set_reuse_port(socket: &Socket) -> io::Result<()> {
    let optval: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Pending SO_ERROR, if any.
pub(crate) fn socket_error(socket: &Socket) -> Option<io::Error> {
    match socket.take_error() {
        Ok(err) => err,
        Err(e) => Some(e),
    }
}

/// Reserve fd for the EMFILE recovery dance.
pub(crate) fn open_dev_null() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn unspecified() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
}
