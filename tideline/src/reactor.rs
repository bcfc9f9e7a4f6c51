//! epoll readiness notifier.
//!
//! The reactor is level-triggered with one-shot arming: a connection or
//! timer fd delivers at most one notification per arming, and the dispatch
//! path re-arms via [`Reactor::modify`] once the corresponding callback or
//! drain cycle has completed. Because the underlying mode is level, any
//! unread input re-fires immediately on re-arm, so a partial read cannot
//! strand data. The listening fd is registered without one-shot and its
//! accept loop drains to `EAGAIN`.
//!
//! `register`/`modify`/`unregister` are callable from any thread; `wait`
//! belongs to the orchestrator's loop thread.

use std::io;
use std::os::fd::RawFd;

/// Interest flags for a registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    pub const READ: Self = Self(libc::EPOLLIN as u32 | libc::EPOLLRDHUP as u32);
    pub const WRITE: Self = Self(libc::EPOLLOUT as u32);

    /// Combine two interest sets.
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Arm for a single notification; re-arm with [`Reactor::modify`].
    pub fn oneshot(self) -> Self {
        Self(self.0 | libc::EPOLLONESHOT as u32)
    }

    fn bits(self) -> u32 {
        self.0
    }
}

/// The kind of readiness delivered for one fd.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Readable,
    Writable,
    /// Peer hang-up or socket error. Takes precedence over the other two
    /// kinds and routes the fd to the close path.
    Hup,
}

/// One readiness notification.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub fd: RawFd,
    pub kind: EventKind,
}

/// epoll handle. Closed on drop.
pub struct Reactor {
    epfd: RawFd,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Reactor { epfd })
    }

    /// Start observing `fd` with the given interest.
    pub fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest.bits())
    }

    /// Replace the interest for `fd`. For one-shot registrations this is
    /// the re-arm operation.
    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest.bits())
    }

    /// Stop observing `fd`. Does not close the fd.
    pub fn unregister(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait up to `timeout_ms` for readiness, appending events to `events`.
    ///
    /// Returns the number of fds that reported readiness. `EINTR` is not
    /// an error and reports an empty batch. Within one fd, a readable
    /// event is appended before a writable one; hup suppresses both.
    pub fn wait(&self, events: &mut Vec<Event>, timeout_ms: i32) -> io::Result<usize> {
        const MAX_EVENTS: usize = 256;
        let mut raw: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };

        let n = unsafe {
            libc::epoll_wait(self.epfd, raw.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }

        let count = n as usize;
        for ev in raw.iter().take(count) {
            let fd = ev.u64 as RawFd;
            let bits = ev.events;
            let hup = bits
                & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32 | libc::EPOLLRDHUP as u32)
                != 0;
            if hup {
                events.push(Event {
                    fd,
                    kind: EventKind::Hup,
                });
                continue;
            }
            if bits & libc::EPOLLIN as u32 != 0 {
                events.push(Event {
                    fd,
                    kind: EventKind::Readable,
                });
            }
            if bits & libc::EPOLLOUT as u32 != 0 {
                events.push(Event {
                    fd,
                    kind: EventKind::Writable,
                });
            }
        }
        Ok(count)
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
