// src/syscalls.rs
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;

/// Upper bound on iovec segments built on the stack per vectored call.
const MAX_IOVECS: usize = 8;

fn cvt(res: c_int) -> io::Result<c_int> {
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}

fn cvt_size(res: isize) -> io::Result<usize> {
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

// ---- Socket Operations ----

/// Create a non-blocking listening TCP socket.
///
/// `linger` turns on graceful close (SO_LINGER with a 1s timeout) so pending
/// data is flushed before the descriptor is released. SO_REUSEADDR is always
/// set so restarts do not trip over TIME_WAIT.
pub fn create_listen_socket(addr: SocketAddr, linger: bool) -> io::Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    unsafe {
        let fd = cvt(libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        ))?;

        let setup = || -> io::Result<()> {
            let opt_linger = libc::linger {
                l_onoff: linger as c_int,
                l_linger: if linger { 1 } else { 0 },
            };
            cvt(libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &opt_linger as *const _ as *const c_void,
                mem::size_of_val(&opt_linger) as socklen_t,
            ))?;

            let optval: c_int = 1;
            cvt(libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &optval as *const _ as *const c_void,
                mem::size_of_val(&optval) as socklen_t,
            ))?;

            match addr {
                SocketAddr::V4(a) => {
                    let sin = libc::sockaddr_in {
                        sin_family: libc::AF_INET as libc::sa_family_t,
                        sin_port: a.port().to_be(),
                        sin_addr: libc::in_addr {
                            s_addr: u32::from_ne_bytes(a.ip().octets()),
                        },
                        sin_zero: [0; 8],
                    };
                    cvt(libc::bind(
                        fd,
                        &sin as *const _ as *const libc::sockaddr,
                        mem::size_of_val(&sin) as socklen_t,
                    ))?;
                }
                SocketAddr::V6(a) => {
                    let sin6 = libc::sockaddr_in6 {
                        sin6_family: libc::AF_INET6 as libc::sa_family_t,
                        sin6_port: a.port().to_be(),
                        sin6_flowinfo: a.flowinfo(),
                        sin6_addr: libc::in6_addr {
                            s6_addr: a.ip().octets(),
                        },
                        sin6_scope_id: a.scope_id(),
                    };
                    cvt(libc::bind(
                        fd,
                        &sin6 as *const _ as *const libc::sockaddr,
                        mem::size_of_val(&sin6) as socklen_t,
                    ))?;
                }
            }

            cvt(libc::listen(fd, libc::SOMAXCONN))?;
            Ok(())
        };

        if let Err(err) = setup() {
            libc::close(fd);
            return Err(err);
        }
        Ok(fd)
    }
}

/// Address a socket is bound to.
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        cvt(libc::getsockname(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
        sockaddr_to_std(&storage)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family"))
    }
}

/// Accept one pending connection as a non-blocking descriptor.
///
/// Returns `Ok(None)` when the backlog is empty.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }

        let peer = sockaddr_to_std(&storage)
            .unwrap_or_else(|| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
        Ok(Some((fd, peer)))
    }
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = cvt(libc::fcntl(fd, libc::F_GETFL, 0))?;
        cvt(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    }
    Ok(())
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Raw I/O ----

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    unsafe { cvt_size(libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len())) }
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    unsafe { cvt_size(libc::write(fd, buf.as_ptr() as *const c_void, buf.len())) }
}

/// Best-effort send used for one-shot replies such as the "server busy" notice.
pub fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    unsafe {
        cvt_size(libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        ))
    }
}

/// Scatter read: fill `bufs` in order with a single syscall.
pub fn readv(fd: RawFd, bufs: &mut [&mut [u8]]) -> io::Result<usize> {
    let mut iovecs: [libc::iovec; MAX_IOVECS] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(MAX_IOVECS);

    for (iov, buf) in iovecs.iter_mut().zip(bufs.iter_mut()) {
        *iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
    }

    unsafe { cvt_size(libc::readv(fd, iovecs.as_ptr(), iov_count as c_int)) }
}

/// Gather write: transmit `bufs` in order with a single syscall.
/// Empty segments are skipped.
pub fn writev(fd: RawFd, bufs: &[&[u8]]) -> io::Result<usize> {
    let mut iovecs: [libc::iovec; MAX_IOVECS] = unsafe { mem::zeroed() };
    let mut iov_count = 0;

    for buf in bufs.iter().filter(|b| !b.is_empty()).take(MAX_IOVECS) {
        iovecs[iov_count] = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
        iov_count += 1;
    }

    if iov_count == 0 {
        return Ok(0);
    }

    unsafe { cvt_size(libc::writev(fd, iovecs.as_ptr(), iov_count as c_int)) }
}

// ---- Pipe Operations ----

/// Create a Unix pipe with a non-blocking read end. Returns (read_fd, write_fd).
pub fn create_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        cvt(libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC))?;
    }
    if let Err(err) = set_nonblocking(fds[0]) {
        close(fds[0]);
        close(fds[1]);
        return Err(err);
    }
    Ok((fds[0], fds[1]))
}

/// Create a connected pair of non-blocking Unix stream sockets.
pub fn socket_pair() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        cvt(libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        ))?;
    }
    Ok((fds[0], fds[1]))
}
