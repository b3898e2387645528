//! epoll-driven non-blocking I/O poll layer (§4.8).
//!
//! `Poller` only tracks which fds are registered and hands back a ready
//! list; it knows nothing about coroutines or promises. `Vm` pairs each
//! registration with a [`crate::vm::PendingIo`] describing what to do once
//! the fd is ready, so there's no borrow conflict between "the poller is
//! mid-`poll`" and "the callback needs `&mut Vm`".

use std::collections::HashSet;
use std::os::unix::io::RawFd;

use crate::error::FatalError;

pub struct Poller {
    epfd: RawFd,
    registered: HashSet<RawFd>,
}

impl Poller {
    pub fn new() -> Result<Poller, FatalError> {
        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            return Err(FatalError(format!(
                "epoll_create1 failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Poller {
            epfd,
            registered: HashSet::new(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    /// Registers `fd` for `events` (an `EPOLLIN`/`EPOLLOUT` mask). A dup'd
    /// fd the OS happens to reuse reports `EEXIST`; fall back to
    /// `EPOLL_CTL_MOD` for it rather than failing (§4.8).
    pub fn add(&mut self, fd: RawFd, events: u32) -> Result<(), FatalError> {
        let mut ev = libc::epoll_event { events, u64: fd as u64 };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) {
                let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
                if rc < 0 {
                    return Err(FatalError(format!("epoll_ctl(MOD) failed: {err}")));
                }
            } else {
                return Err(FatalError(format!("epoll_ctl(ADD) failed: {err}")));
            }
        }
        self.registered.insert(fd);
        Ok(())
    }

    pub fn remove(&mut self, fd: RawFd) {
        if self.registered.remove(&fd) {
            unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
    }

    /// Waits up to `timeout_ms` (-1 blocks indefinitely, 0 polls without
    /// blocking). Every fd that came back ready is deregistered before
    /// returning — registrations here are one-shot, re-armed by whichever
    /// native issues the next read/write/accept.
    pub fn poll(&mut self, timeout_ms: i32) -> Result<Vec<(RawFd, u32)>, FatalError> {
        let mut events: [libc::epoll_event; 64] = unsafe { std::mem::zeroed() };
        let n = unsafe {
            libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as i32, timeout_ms)
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(Vec::new());
            }
            return Err(FatalError(format!("epoll_wait failed: {err}")));
        }
        let ready: Vec<(RawFd, u32)> =
            events.iter().take(n as usize).map(|ev| (ev.u64 as RawFd, ev.events)).collect();
        for &(fd, _) in &ready {
            self.remove(fd);
        }
        Ok(ready)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
