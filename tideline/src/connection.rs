//! The fd-indexed connection table.
//!
//! Slot `i` holds the state for fd `i`; a slot is occupied iff the server
//! currently owns that fd. fds 0..=2 are never occupied by connections,
//! but their udata cells are writable as out-of-band storage (inherently
//! racy with stdio, so callers beware).
//!
//! Locking: each slot carries a reentrant serialization lock that the
//! dispatch machinery holds across every callback (so no two callbacks
//! run concurrently on one fd, and facade calls made from inside a
//! callback on the same fd re-enter without deadlocking), a short-held
//! state lock for field access, and a short-held lock for the write
//! queue. Lock order is serialization → state → queue; the queue lock is
//! a leaf. The busy flag is an atomic readable outside all locks.

use std::any::Any;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};

use crate::error::Error;
use crate::hooks::RwHooks;
use crate::packet::WriteQueue;
use crate::protocol::Protocol;

/// Opaque user data attached to a connection.
pub type Udata = Arc<dyn Any + Send + Sync>;

/// Mutable per-fd fields, guarded by the slot's state lock.
#[derive(Default)]
pub(crate) struct SlotState {
    pub occupied: bool,
    pub protocol: Option<Arc<dyn Protocol>>,
    pub udata: Option<Udata>,
    pub hooks: Option<Arc<dyn RwHooks>>,
    /// Timeout in seconds, 0 = never times out.
    pub timeout: u8,
    /// Seconds since the connection was last touched.
    pub idle: u8,
    /// on_open was delivered; exactly one on_close is owed.
    pub open: bool,
    /// close() was requested; the queue drains, then the fd closes.
    pub closing: bool,
}

/// Per-fd slot.
pub(crate) struct Slot {
    pub serial: ReentrantMutex<()>,
    pub state: Mutex<SlotState>,
    pub queue: Mutex<WriteQueue>,
    pub busy: AtomicBool,
}

impl Slot {
    fn new() -> Self {
        Slot {
            serial: ReentrantMutex::new(()),
            state: Mutex::new(SlotState::default()),
            queue: Mutex::new(WriteQueue::new()),
            busy: AtomicBool::new(false),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }
}

/// Fixed-size array of slots, sized by [`capacity`] at startup.
pub(crate) struct ConnectionTable {
    slots: Box<[Slot]>,
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Self {
        let slots: Vec<Slot> = (0..capacity).map(|_| Slot::new()).collect();
        ConnectionTable {
            slots: slots.into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, fd: RawFd) -> Option<&Slot> {
        if fd < 0 {
            return None;
        }
        self.slots.get(fd as usize)
    }

    /// Initialize the slot for a freshly owned fd. Fails when the fd falls
    /// outside the table or names stdio.
    pub fn reserve(
        &self,
        fd: RawFd,
        protocol: Arc<dyn Protocol>,
        timeout: u8,
    ) -> Result<(), Error> {
        if fd < 3 {
            return Err(Error::VacantSlot);
        }
        let slot = self.slot(fd).ok_or(Error::CapacityReached)?;
        let mut state = slot.state.lock();
        state.occupied = true;
        state.protocol = Some(protocol);
        state.udata = None;
        state.hooks = None;
        state.timeout = timeout;
        state.idle = 0;
        state.open = false;
        state.closing = false;
        slot.queue.lock().clear();
        slot.set_busy(false);
        Ok(())
    }

    /// Vacate the slot: drop pending writes, clear hooks and udata, and
    /// report the protocol plus whether on_close is owed. Must run under
    /// the slot's serialization lock. Returns `None` when already vacant.
    pub fn release(&self, fd: RawFd) -> Option<(Arc<dyn Protocol>, bool)> {
        let slot = self.slot(fd)?;
        let mut state = slot.state.lock();
        if !state.occupied {
            return None;
        }
        state.occupied = false;
        state.closing = false;
        let was_open = std::mem::replace(&mut state.open, false);
        let protocol = state.protocol.take();
        state.udata = None;
        state.hooks = None;
        state.timeout = 0;
        state.idle = 0;
        // Clear the queue while still holding the state lock so a racing
        // write (which checks occupancy under the same lock) cannot land
        // a packet in the vacated slot.
        slot.queue.lock().clear();
        slot.set_busy(false);
        drop(state);
        protocol.map(|p| (p, was_open))
    }

    /// Count occupied slots whose protocol's service matches the filter.
    /// `None` matches every protocol.
    pub fn count(&self, service: Option<&str>) -> usize {
        self.slots
            .iter()
            .filter(|slot| {
                let state = slot.state.lock();
                state.occupied
                    && match (service, &state.protocol) {
                        (None, _) => true,
                        (Some(name), Some(p)) => p.service() == name,
                        (Some(_), None) => false,
                    }
            })
            .count()
    }

    /// Snapshot the occupied fds matching the filter, in fd order.
    pub fn snapshot(&self, service: Option<&str>) -> Vec<RawFd> {
        let mut fds = Vec::new();
        for (fd, slot) in self.slots.iter().enumerate() {
            let state = slot.state.lock();
            let matches = state.occupied
                && match (service, &state.protocol) {
                    (None, _) => true,
                    (Some(name), Some(p)) => p.service() == name,
                    (Some(_), None) => false,
                };
            if matches {
                fds.push(fd as RawFd);
            }
        }
        fds
    }
}

/// The process's adjusted file-descriptor capacity.
///
/// Raises `RLIMIT_NOFILE` toward the hard cap, then subtracts a margin for
/// response-side fds (timers, files being sent, the reactor itself):
/// `min(raised, max(raised - 64, raised * 7 / 8))`.
pub fn capacity() -> Result<usize, Error> {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
    if ret != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    if rlim.rlim_cur < rlim.rlim_max {
        let mut raised = rlim;
        raised.rlim_cur = raised.rlim_max;
        if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &raised) } == 0 {
            rlim = raised;
        }
        // A refused raise keeps the current (still usable) soft limit.
    }

    // The slot table is allocated eagerly at this size, so an unlimited
    // or very high hard cap still needs a bound.
    const TABLE_MAX: u64 = 1 << 16;
    let raised = (rlim.rlim_cur as u64).min(TABLE_MAX);
    let margined = raised.min((raised.saturating_sub(64)).max(raised * 7 / 8));
    if margined == 0 {
        return Err(Error::Setup("file descriptor limit too low".into()));
    }
    Ok(margined as usize)
}
