// src/syscalls.rs
use libc::{c_int, c_void, socklen_t};
use std::io::{self, IoSlice};
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ptr;

// ---- Socket Operations ----

/// Create a non-blocking IPv4 listener on every interface.
///
/// `linger_on` selects `SO_LINGER {1, 1}` (bounded wait on close) over
/// `{0, 1}` (kernel default close).
pub fn create_listen_socket(port: u16, linger_on: bool) -> io::Result<c_int> {
    unsafe {
        let fd = libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let linger = libc::linger {
            l_onoff: linger_on as c_int,
            l_linger: 1,
        };
        let reuse: c_int = 1;
        if set_opt(fd, libc::SO_LINGER, &linger).is_err()
            || set_opt(fd, libc::SO_REUSEADDR, &reuse).is_err()
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY.to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

unsafe fn set_opt<T>(fd: c_int, opt: c_int, val: &T) -> io::Result<()> {
    let res = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            val as *const T as *const c_void,
            mem::size_of::<T>() as socklen_t,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn to_socket_addr(sin: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
        u16::from_be(sin.sin_port),
    )
}

/// Address the socket is bound to.
pub fn local_addr(fd: c_int) -> io::Result<SocketAddrV4> {
    unsafe {
        let mut sin: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of_val(&sin) as socklen_t;
        if libc::getsockname(fd, &mut sin as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(to_socket_addr(&sin))
    }
}

/// Accept one pending connection as a non-blocking socket.
/// `Ok(None)` when the backlog is empty.
pub fn accept_connection(listen_fd: c_int) -> io::Result<Option<(c_int, SocketAddrV4)>> {
    unsafe {
        let mut sin: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of_val(&sin) as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut sin as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(err),
            };
        }
        Ok(Some((fd, to_socket_addr(&sin))))
    }
}

/// Best-effort message to a socket about to be closed.
pub fn send_and_forget(fd: c_int, msg: &[u8]) {
    unsafe {
        libc::send(fd, msg.as_ptr() as *const c_void, msg.len(), libc::MSG_NOSIGNAL);
    }
}

pub fn close(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

pub fn set_nonblocking(fd: c_int) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Connected Unix stream pair, `(read_end, write_end)`. Both ends are
/// non-blocking so a signal handler can never stall on a full pipe.
pub fn socketpair() -> io::Result<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    for fd in fds {
        if let Err(e) = set_nonblocking(fd) {
            close(fds[0]);
            close(fds[1]);
            return Err(e);
        }
    }
    Ok((fds[0], fds[1]))
}

/// Schedule `SIGALRM` after `secs` seconds, replacing any pending alarm.
pub fn alarm(secs: u32) {
    unsafe {
        libc::alarm(secs);
    }
}

// ---- Data Transfer ----

/// One `read(2)`. `WouldBlock` comes back as an error so callers can tell
/// it apart from EOF (`Ok(0)`).
pub fn read(fd: c_int, buf: &mut [u8]) -> io::Result<usize> {
    let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(res as usize)
}

/// Scatter write of up to two segments in one syscall.
pub fn writev(fd: c_int, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    // IoSlice is ABI-compatible with iovec on unix.
    let res = unsafe {
        libc::writev(
            fd,
            bufs.as_ptr() as *const libc::iovec,
            bufs.len().min(libc::c_int::MAX as usize) as c_int,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(res as usize)
}

// ---- Epoll Operations ----

/// Readiness direction a connection is armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ready {
    Read,
    Write,
}

/// Event mask for a connection socket: one-shot, peer-hangup aware.
pub fn conn_interest(ready: Ready, edge: bool) -> u32 {
    let dir = match ready {
        Ready::Read => libc::EPOLLIN,
        Ready::Write => libc::EPOLLOUT,
    };
    let mut events = dir | libc::EPOLLRDHUP | libc::EPOLLONESHOT;
    if edge {
        events |= libc::EPOLLET;
    }
    events as u32
}

/// Event mask for the listener and the signal pipe: readable, never
/// one-shot.
pub fn plain_interest(edge: bool) -> u32 {
    let mut events = libc::EPOLLIN | libc::EPOLLRDHUP;
    if edge {
        events |= libc::EPOLLET;
    }
    events as u32
}

pub const HANGUP_MASK: u32 = (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;
pub const READABLE: u32 = libc::EPOLLIN as u32;
pub const WRITABLE: u32 = libc::EPOLLOUT as u32;

pub use libc::epoll_event;

pub fn empty_events(n: usize) -> Vec<epoll_event> {
    vec![epoll_event { events: 0, u64: 0 }; n]
}

/// Registered descriptors are keyed by their own fd.
pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    fn ctl(&self, op: c_int, fd: c_int, events: u32) -> io::Result<()> {
        let mut event = epoll_event {
            events,
            u64: fd as u64,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn add(&self, fd: c_int, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    /// Re-arm a one-shot registration.
    pub fn modify(&self, fd: c_int, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub fn delete(&self, fd: c_int) -> io::Result<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Interrupted waits report zero events; the signal byte is already in
    /// the pipe and shows up on the next call.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
        let res = unsafe {
            libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(res as usize)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        close(self.fd);
    }
}
