//! Raw socket plumbing the std net types don't expose: non-blocking socket
//! creation, `SO_REUSEADDR`, TCP fast-open, and `connect(2)` with
//! `EINPROGRESS` tolerated.

use std::io;
use std::mem::{size_of, MaybeUninit};
use std::net::{self, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::sys::syscall;

/// Backlog used by every listening socket.
pub const LISTEN_BACKLOG: libc::c_int = 1024;

/// A `sockaddr_in` / `sockaddr_in6` by-value union, built field-wise from a
/// `SocketAddr` so no assumption is made about std's layout.
#[repr(C)]
pub(crate) union SocketAddrCRepr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

impl SocketAddrCRepr {
    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        self as *const _ as *const libc::sockaddr
    }
}

pub(crate) fn socket_addr(addr: &SocketAddr) -> (SocketAddrCRepr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(ref addr) => {
            let sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(addr.ip().octets()),
            };
            let sockaddr_in = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr,
                sin_zero: [0; 8],
                #[cfg(any(
                    target_os = "dragonfly",
                    target_os = "freebsd",
                    target_os = "ios",
                    target_os = "macos",
                    target_os = "netbsd",
                    target_os = "openbsd"
                ))]
                sin_len: 0,
            };
            (
                SocketAddrCRepr { v4: sockaddr_in },
                size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(ref addr) => {
            let sockaddr_in6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_flowinfo: addr.flowinfo(),
                sin6_scope_id: addr.scope_id(),
                #[cfg(any(
                    target_os = "dragonfly",
                    target_os = "freebsd",
                    target_os = "ios",
                    target_os = "macos",
                    target_os = "netbsd",
                    target_os = "openbsd"
                ))]
                sin6_len: 0,
            };
            (
                SocketAddrCRepr { v6: sockaddr_in6 },
                size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

/// `storage` must hold an initialised `sockaddr_in` or `sockaddr_in6`.
pub(crate) unsafe fn to_socket_addr(
    storage: *const libc::sockaddr_storage,
) -> io::Result<SocketAddr> {
    match (*storage).ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: &libc::sockaddr_in = &*(storage as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes());
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let addr: &libc::sockaddr_in6 = &*(storage as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

/// Creates a non-blocking, close-on-exec TCP socket for the family of
/// `addr`, not yet bound or connected.
fn new_socket(addr: &SocketAddr) -> io::Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    };

    #[cfg(any(target_os = "android", target_os = "linux"))]
    let socket_type = libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
    #[cfg(not(any(target_os = "android", target_os = "linux")))]
    let socket_type = libc::SOCK_STREAM;

    let socket = syscall!(socket(domain, socket_type, 0))?;

    // Darwin (and the other BSDs' older kernels) don't have SOCK_NONBLOCK or
    // SOCK_CLOEXEC, so set both via fcntl.
    #[cfg(not(any(target_os = "android", target_os = "linux")))]
    {
        if let Err(err) = syscall!(fcntl(socket, libc::F_SETFD, libc::FD_CLOEXEC))
            .and_then(|_| syscall!(fcntl(socket, libc::F_SETFL, libc::O_NONBLOCK)).map(|_| ()))
        {
            let _ = syscall!(close(socket));
            return Err(err);
        }
    }

    Ok(socket)
}

/// Creates a non-blocking TCP socket bound to `addr` with `SO_REUSEADDR`.
///
/// The socket is not yet listening; this leaves room to enable TCP
/// fast-open between `bind` and `listen`.
pub fn bind(addr: SocketAddr) -> io::Result<OwnedFd> {
    // SAFETY: `new_socket` returns a valid, owned fd.
    let socket = unsafe { OwnedFd::from_raw_fd(new_socket(&addr)?) };

    // Allows quickly rebinding the address without waiting for the OS to
    // clean up a socket in TIME_WAIT.
    let opt: libc::c_int = 1;
    syscall!(setsockopt(
        socket.as_raw_fd(),
        libc::SOL_SOCKET,
        libc::SO_REUSEADDR,
        &opt as *const _ as *const libc::c_void,
        size_of::<libc::c_int>() as libc::socklen_t,
    ))?;

    let (raw_addr, raw_addr_length) = socket_addr(&addr);
    syscall!(bind(socket.as_raw_fd(), raw_addr.as_ptr(), raw_addr_length))?;
    Ok(socket)
}

/// Enables listen-side TCP fast-open on `socket`.
///
/// Returns `Unsupported` where the OS has no `TCP_FASTOPEN`; callers are
/// expected to degrade to a normal listen.
pub fn set_fastopen(socket: &OwnedFd) -> io::Result<()> {
    #[cfg(any(target_os = "android", target_os = "linux"))]
    {
        // Limit of pending fast-open handshakes in the SYN queue.
        let qlen: libc::c_int = 5;
        syscall!(setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN,
            &qlen as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .map(|_| ())
    }
    #[cfg(not(any(target_os = "android", target_os = "linux")))]
    {
        let _ = socket;
        Err(io::ErrorKind::Unsupported.into())
    }
}

/// Starts listening on a bound socket and hands it over as a std listener.
pub fn listen(socket: OwnedFd, backlog: libc::c_int) -> io::Result<net::TcpListener> {
    syscall!(listen(socket.as_raw_fd(), backlog))?;
    Ok(net::TcpListener::from(socket))
}

/// Accepts a connection, returning a non-blocking, close-on-exec stream.
pub fn accept(listener: &net::TcpListener) -> io::Result<(net::TcpStream, SocketAddr)> {
    let mut addr: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
    let mut length = size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    #[cfg(any(target_os = "android", target_os = "linux"))]
    let stream = {
        syscall!(accept4(
            listener.as_raw_fd(),
            addr.as_mut_ptr() as *mut _,
            &mut length,
            libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
        ))
        // SAFETY: `accept4` returns a valid, owned fd.
        .map(|socket| unsafe { net::TcpStream::from_raw_fd(socket) })?
    };

    // No `accept4(2)`; accept and set the flags after the fact.
    #[cfg(not(any(target_os = "android", target_os = "linux")))]
    let stream = {
        syscall!(accept(
            listener.as_raw_fd(),
            addr.as_mut_ptr() as *mut _,
            &mut length,
        ))
        .and_then(|socket| {
            syscall!(fcntl(socket, libc::F_SETFD, libc::FD_CLOEXEC))
                .and_then(|_| syscall!(fcntl(socket, libc::F_SETFL, libc::O_NONBLOCK)))
                .map_err(|err| {
                    let _ = syscall!(close(socket));
                    err
                })
                // SAFETY: `accept` returns a valid, owned fd.
                .map(|_| unsafe { net::TcpStream::from_raw_fd(socket) })
        })?
    };

    let addr = unsafe { to_socket_addr(addr.as_ptr())? };
    Ok((stream, addr))
}

/// Creates a non-blocking, unconnected TCP socket for the family of `addr`.
pub fn new_stream(addr: &SocketAddr) -> io::Result<net::TcpStream> {
    // SAFETY: `new_socket` returns a valid, owned fd.
    new_socket(addr).map(|socket| unsafe { net::TcpStream::from_raw_fd(socket) })
}

/// Initiates a non-blocking connect. `EINPROGRESS` is not an error: the
/// socket's writable readiness reports the outcome.
pub fn connect(stream: &net::TcpStream, addr: SocketAddr) -> io::Result<()> {
    let (raw_addr, raw_addr_length) = socket_addr(&addr);
    match syscall!(connect(
        stream.as_raw_fd(),
        raw_addr.as_ptr(),
        raw_addr_length,
    )) {
        Err(err) if err.raw_os_error() != Some(libc::EINPROGRESS) => Err(err),
        _ => Ok(()),
    }
}

/// Sends `buf` on an unconnected socket with `MSG_FASTOPEN`, carrying the
/// payload in the SYN.
///
/// Returns `Unsupported` where the OS has no fast-open sendto; callers are
/// expected to fall back to a plain `connect`.
pub fn sendto_fastopen(
    stream: &net::TcpStream,
    buf: &[u8],
    addr: SocketAddr,
) -> io::Result<usize> {
    #[cfg(any(target_os = "android", target_os = "linux"))]
    {
        let (raw_addr, raw_addr_length) = socket_addr(&addr);
        syscall!(sendto(
            stream.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_FASTOPEN,
            raw_addr.as_ptr(),
            raw_addr_length,
        ))
        .map(|n| n as usize)
    }
    #[cfg(not(any(target_os = "android", target_os = "linux")))]
    {
        let _ = (stream, buf, addr);
        Err(io::ErrorKind::Unsupported.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_addr_round_trip_v4() {
        let addr: SocketAddr = "93.184.216.34:80".parse().unwrap();
        let (raw, _len) = socket_addr(&addr);
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        unsafe {
            std::ptr::copy_nonoverlapping(
                raw.as_ptr() as *const u8,
                &mut storage as *mut _ as *mut u8,
                size_of::<libc::sockaddr_in>(),
            );
            assert_eq!(to_socket_addr(&storage).unwrap(), addr);
        }
    }

    #[test]
    fn socket_addr_round_trip_v6() {
        let addr: SocketAddr = "[2606:2800:220:1:248:1893:25c8:1946]:443".parse().unwrap();
        let (raw, _len) = socket_addr(&addr);
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        unsafe {
            std::ptr::copy_nonoverlapping(
                raw.as_ptr() as *const u8,
                &mut storage as *mut _ as *mut u8,
                size_of::<libc::sockaddr_in6>(),
            );
            assert_eq!(to_socket_addr(&storage).unwrap(), addr);
        }
    }
}
