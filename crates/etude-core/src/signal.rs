// src/signal.rs
//! Signal delivery through a self-pipe.
//!
//! The handler only writes the signal number into the pipe's write end; the
//! event loop sees the read end become readable and decides what to do on
//! its own thread. `SIGALRM` requests a timer sweep, `SIGTERM` and `SIGINT`
//! request shutdown.

use std::io;
use std::sync::atomic::{AtomicI32, Ordering};

use libc::c_int;
use tracing::debug;

use crate::syscalls;

/// Write end of the most recently installed pipe, read by the handler.
static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(sig: c_int) {
    // Only async-signal-safe calls here.
    unsafe {
        let errno = libc::__errno_location();
        let saved = *errno;
        let fd = PIPE_WRITE_FD.load(Ordering::Relaxed);
        if fd >= 0 {
            let byte = sig as u8;
            libc::send(fd, &byte as *const u8 as *const libc::c_void, 1, libc::MSG_DONTWAIT);
        }
        *errno = saved;
    }
}

fn install(sig: c_int, handler: libc::sighandler_t) -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler;
        // no SA_RESTART: epoll_wait should return EINTR
        sa.sa_flags = 0;
        libc::sigfillset(&mut sa.sa_mask);
        if libc::sigaction(sig, &sa, std::ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// What the drained signal bytes asked for.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Pending {
    pub sweep: bool,
    pub stop: bool,
}

/// Owner of the self-pipe and the process signal dispositions.
pub struct SignalPipe {
    read_fd: c_int,
    write_fd: c_int,
}

impl SignalPipe {
    /// Create the pipe, point the handler at it and install handlers for
    /// `SIGALRM`, `SIGTERM` and `SIGINT`. `SIGPIPE` is ignored.
    pub fn install() -> io::Result<Self> {
        let (read_fd, write_fd) = syscalls::socketpair()?;
        PIPE_WRITE_FD.store(write_fd, Ordering::Release);

        let handler = on_signal as extern "C" fn(c_int) as libc::sighandler_t;
        let result = install(libc::SIGPIPE, libc::SIG_IGN)
            .and_then(|_| install(libc::SIGALRM, handler))
            .and_then(|_| install(libc::SIGTERM, handler))
            .and_then(|_| install(libc::SIGINT, handler));
        if let Err(e) = result {
            PIPE_WRITE_FD.store(-1, Ordering::Release);
            syscalls::close(read_fd);
            syscalls::close(write_fd);
            return Err(e);
        }
        debug!("signal pipe ready (read fd {}, write fd {})", read_fd, write_fd);
        Ok(Self { read_fd, write_fd })
    }

    pub fn read_fd(&self) -> c_int {
        self.read_fd
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            write_fd: self.write_fd,
        }
    }

    /// Consume every queued signal byte.
    pub fn drain(&self) -> Pending {
        let mut pending = Pending::default();
        let mut buf = [0u8; 1024];
        loop {
            match syscalls::read(self.read_fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &sig in &buf[..n] {
                        match sig as c_int {
                            libc::SIGALRM => pending.sweep = true,
                            libc::SIGTERM | libc::SIGINT => pending.stop = true,
                            _ => {}
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        pending
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        // Stop the handler writing into a descriptor that is about to be
        // reused.
        let _ = PIPE_WRITE_FD.compare_exchange(
            self.write_fd,
            -1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        syscalls::close(self.read_fd);
        syscalls::close(self.write_fd);
    }
}

/// Requests shutdown the same way `SIGTERM` does.
///
/// Only valid while the owning server is alive.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownHandle {
    write_fd: c_int,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        syscalls::send_and_forget(self.write_fd, &[libc::SIGTERM as u8]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test only: the handler target is process-wide.
    #[test]
    fn signal_bytes_translate_to_requests() {
        let pipe = SignalPipe::install().unwrap();
        assert_eq!(pipe.drain(), Pending::default());

        syscalls::send_and_forget(pipe.write_fd, &[libc::SIGALRM as u8, libc::SIGALRM as u8]);
        assert_eq!(
            pipe.drain(),
            Pending {
                sweep: true,
                stop: false
            }
        );

        pipe.shutdown_handle().shutdown();
        assert!(pipe.drain().stop);

        unsafe {
            libc::raise(libc::SIGALRM);
        }
        assert!(pipe.drain().sweep);

        unsafe {
            libc::raise(libc::SIGINT);
        }
        assert!(pipe.drain().stop);
    }
}
