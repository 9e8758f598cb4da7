// src/epoll.rs
//! Thin stateful wrapper around Linux epoll.
//!
//! Descriptors are registered with their fd as the event token, so ready
//! events can be mapped back to connections without a side table.

use libc::{c_int, epoll_event};
use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::time::Duration;

pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
pub const EPOLLET: u32 = libc::EPOLLET as u32;
pub const EPOLLONESHOT: u32 = libc::EPOLLONESHOT as u32;
pub const EPOLLRDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
pub const EPOLLERR: u32 = libc::EPOLLERR as u32;

/// Any of these means the peer is gone or the socket is broken.
pub const HANGUP_MASK: u32 = EPOLLRDHUP | EPOLLHUP | EPOLLERR;

pub const DEFAULT_MAX_EVENTS: usize = 1024;

pub struct Epoller {
    fd: RawFd,
    events: Vec<epoll_event>,
}

impl Epoller {
    pub fn new(max_events: usize) -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd,
            events: vec![epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    pub fn add_fd(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    /// Change the interest set of `fd`. For one-shot registrations this is
    /// also what re-arms the descriptor.
    pub fn modify_fd(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub fn remove_fd(&self, fd: RawFd) -> io::Result<()> {
        let res = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn ctl(&self, op: c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut event = epoll_event {
            events,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.fd, op, fd, &mut event) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until at least one registered descriptor is ready or `timeout`
    /// elapses. `None` waits indefinitely. An interrupted wait reports zero
    /// events.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = match timeout {
            // Round up so a sub-millisecond deadline does not spin at zero.
            Some(t) => t.as_nanos().div_ceil(1_000_000).min(c_int::MAX as u128) as c_int,
            None => -1,
        };

        let res = unsafe {
            libc::epoll_wait(
                self.fd,
                self.events.as_mut_ptr(),
                self.events.len() as c_int,
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

    /// Descriptor of the `i`-th ready event from the last [`wait`](Self::wait).
    pub fn event_fd(&self, i: usize) -> RawFd {
        self.events[i].u64 as RawFd
    }

    /// Event mask of the `i`-th ready event from the last [`wait`](Self::wait).
    pub fn events(&self, i: usize) -> u32 {
        self.events[i].events
    }
}

impl Drop for Epoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
