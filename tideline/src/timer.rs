//! timerfd-backed one-shot and periodic timers.
//!
//! Each timer consumes exactly one file descriptor, registered one-shot
//! with the reactor like any connection. A fire enqueues the timer's task
//! to the pool; one-shot timers release their fd after the single fire,
//! periodic timers after the final repetition (0 repetitions = forever).

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::pool::PoolTask;
use crate::server::Server;

pub(crate) enum TimerTask {
    Once(Option<Box<dyn FnOnce(&Server) + Send>>),
    Every(Arc<dyn Fn(&Server) + Send + Sync>),
}

pub(crate) struct TimerEntry {
    pub task: TimerTask,
    /// Remaining repetitions; 0 means forever. Meaningful for `Every`.
    pub remaining: u32,
}

/// Registry of live timer fds, shared between the dispatch loop and the
/// scheduling API.
pub(crate) struct TimerRegistry {
    entries: Mutex<HashMap<RawFd, TimerEntry>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        TimerRegistry {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, fd: RawFd, entry: TimerEntry) {
        self.entries.lock().insert(fd, entry);
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.entries.lock().contains_key(&fd)
    }

    pub fn remove(&self, fd: RawFd) {
        self.entries.lock().remove(&fd);
    }

    /// Account one fire. Returns the task to schedule and whether the fd
    /// is done and must be released.
    pub fn fire(&self, fd: RawFd) -> Option<(PoolTask, bool)> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&fd)?;
        match &mut entry.task {
            TimerTask::Once(slot) => {
                let task = slot.take();
                entries.remove(&fd);
                task.map(|task| (task, true))
            }
            TimerTask::Every(task) => {
                let task = Arc::clone(task);
                let done = entry.remaining == 1;
                if entry.remaining > 0 {
                    entry.remaining -= 1;
                }
                if done {
                    entries.remove(&fd);
                }
                let boxed: PoolTask = Box::new(move |server: &Server| (*task)(server));
                Some((boxed, done))
            }
        }
    }

    /// Remove every entry, returning the fds for the caller to close.
    pub fn take_all(&self) -> Vec<RawFd> {
        self.entries.lock().drain().map(|(fd, _)| fd).collect()
    }
}

/// Create an armed timerfd. `periodic` keeps the interval running; a
/// one-shot fd fires once and then stays quiet until closed.
pub(crate) fn create_timerfd(milliseconds: u64, periodic: bool) -> io::Result<RawFd> {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    // A zero it_value disarms the timer, so clamp to one nanosecond.
    let value = if milliseconds == 0 {
        libc::timespec {
            tv_sec: 0,
            tv_nsec: 1,
        }
    } else {
        millis_to_timespec(milliseconds)
    };
    let interval = if periodic {
        value
    } else {
        libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        }
    };
    let spec = libc::itimerspec {
        it_interval: interval,
        it_value: value,
    };

    let ret = unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }
    Ok(fd)
}

fn millis_to_timespec(milliseconds: u64) -> libc::timespec {
    libc::timespec {
        tv_sec: (milliseconds / 1000) as libc::time_t,
        tv_nsec: ((milliseconds % 1000) * 1_000_000) as libc::c_long,
    }
}

/// Consume the fd's expiration counter. Returns 0 when nothing fired yet.
pub(crate) fn read_expirations(fd: RawFd) -> u64 {
    let mut count: u64 = 0;
    loop {
        let n = unsafe { libc::read(fd, &mut count as *mut u64 as *mut libc::c_void, 8) };
        if n == 8 {
            return count;
        }
        if n < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return 0;
    }
}
