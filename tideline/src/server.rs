//! The server orchestrator and its public facade.
//!
//! [`listen`] binds the socket, forks worker processes, installs signal
//! traps, and drives the readiness loop: accepts land in the connection
//! table, reactor events become protocol callbacks posted to the pool
//! (writable events drain the write buffer in-line), and a once-a-second
//! sweep advances per-connection timeout counters into `ping` or close.
//!
//! Every per-connection operation on [`Server`] is safe to call from any
//! thread and from inside protocol callbacks on the same fd.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::Settings;
use crate::connection::{self, ConnectionTable, Udata};
use crate::error::Error;
use crate::hooks::{DefaultHooks, RwHooks};
use crate::metrics;
use crate::packet::Drain;
use crate::pool::TaskPool;
use crate::protocol::Protocol;
use crate::reactor::{Event, EventKind, Interest, Reactor};
use crate::timer::{self, TimerEntry, TimerRegistry, TimerTask};

static DEFAULT_HOOKS: DefaultHooks = DefaultHooks;

// ── Process-wide state ───────────────────────────────────────────

/// Running servers in this process, for `stop_all` and signal dispatch.
static REGISTRY: Mutex<Vec<Arc<Server>>> = Mutex::new(Vec::new());

/// Set by the SIGINT/SIGTERM handler, consumed by the event loop.
static STOP_SIGNAL: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_stop_signal(_sig: libc::c_int) {
    STOP_SIGNAL.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        let handler: extern "C" fn(libc::c_int) = handle_stop_signal;
        sa.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
        // A dead peer surfaces as a send error, not process death.
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

/// Stop every server running in this process.
pub fn stop_all() {
    for server in REGISTRY.lock().iter() {
        server.stop();
    }
}

// ── Entry point ──────────────────────────────────────────────────

/// Run a server with the given settings.
///
/// Blocks the calling thread until the server is stopped through
/// [`Server::stop`], [`stop_all`], or SIGINT/SIGTERM. Returns an error on
/// invalid settings or bind/listen failure, before any callback runs.
///
/// With `processes > 1`, `processes - 1` child processes are forked after
/// the bind; the calling process serves too, and child processes exit the
/// process with status 0 once their loop ends.
pub fn listen(settings: Settings) -> Result<(), Error> {
    settings.validate()?;
    let capacity = connection::capacity()?;
    let listen_fd = create_listener(&settings)?;
    let root_pid = unsafe { libc::getpid() };

    let mut children: Vec<libc::pid_t> = Vec::new();
    for _ in 1..settings.processes {
        match unsafe { libc::fork() } {
            0 => {
                let code = match run_process(settings.clone(), listen_fd, capacity, root_pid, Vec::new()) {
                    Ok(()) => 0,
                    Err(e) => {
                        log::error!("worker process failed: {e}");
                        1
                    }
                };
                std::process::exit(code);
            }
            pid if pid > 0 => children.push(pid),
            _ => log::error!("fork failed: {}", io::Error::last_os_error()),
        }
    }

    run_process(settings, listen_fd, capacity, root_pid, children)
}

/// Per-process serve path: builds this process's own reactor, table, and
/// pool (the readiness fd must not be shared across forks), then runs the
/// loop to completion.
fn run_process(
    settings: Settings,
    listen_fd: RawFd,
    capacity: usize,
    root_pid: libc::pid_t,
    children: Vec<libc::pid_t>,
) -> Result<(), Error> {
    install_signal_handlers();

    let threads = settings.threads;
    let queue_capacity = settings.task_queue_capacity;
    let server = Arc::new(Server {
        settings,
        listen_fd,
        reactor: Reactor::new()?,
        table: ConnectionTable::new(capacity),
        pool: TaskPool::new(threads, queue_capacity),
        timers: TimerRegistry::new(),
        running: AtomicBool::new(true),
        root_pid,
        children: Mutex::new(children),
    });
    REGISTRY.lock().push(Arc::clone(&server));

    log::debug!(
        "serving on fd {listen_fd} (pid {}, capacity {capacity}, threads {threads})",
        unsafe { libc::getpid() }
    );

    if let Some(hook) = server.settings.on_init.as_deref() {
        hook(&server);
    }
    server.pool.start(&server)?;
    server
        .reactor
        .register(listen_fd, Interest::READ)
        .map_err(Error::Io)?;

    server.event_loop();
    server.shutdown_sequence();

    if let Some(hook) = server.settings.on_finish.as_deref() {
        hook(&server);
    }
    server.terminate_children();
    REGISTRY.lock().retain(|s| !Arc::ptr_eq(s, &server));
    unsafe {
        libc::close(listen_fd);
    }
    Ok(())
}

// ── The server ───────────────────────────────────────────────────

/// A running server instance. Callbacks receive `&Server` and re-enter
/// through these methods.
pub struct Server {
    settings: Settings,
    listen_fd: RawFd,
    reactor: Reactor,
    table: ConnectionTable,
    pool: TaskPool,
    timers: TimerRegistry,
    running: AtomicBool,
    root_pid: libc::pid_t,
    children: Mutex<Vec<libc::pid_t>>,
}

impl Server {
    // ── Accessors ────────────────────────────────────────────────

    /// The settings this server was started with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Direct access to the readiness reactor.
    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Pid of the originating process (the one that called [`listen`]).
    pub fn root_pid(&self) -> libc::pid_t {
        self.root_pid
    }

    /// Stop this server; the blocked [`listen`] call returns soon after.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Whether a protected callback is currently running on `fd`.
    pub fn is_busy(&self, fd: RawFd) -> bool {
        self.table.slot(fd).is_some_and(|slot| slot.is_busy())
    }

    /// The active protocol for `fd`, if the fd is managed.
    pub fn get_protocol(&self, fd: RawFd) -> Option<Arc<dyn Protocol>> {
        let slot = self.table.slot(fd)?;
        let state = slot.state.lock();
        if state.occupied {
            state.protocol.clone()
        } else {
            None
        }
    }

    /// Number of managed connections whose protocol service matches the
    /// filter (`None` matches all).
    pub fn count(&self, service: Option<&str>) -> usize {
        self.table.count(service)
    }

    // ── Udata and timeouts ───────────────────────────────────────

    /// Opaque data attached to `fd`. fds 0..=2 are usable as out-of-band
    /// storage, though inherently racy with stdio.
    pub fn get_udata(&self, fd: RawFd) -> Option<Udata> {
        let slot = self.table.slot(fd)?;
        slot.state.lock().udata.clone()
    }

    /// Attach opaque data to `fd`, returning the previous value.
    pub fn set_udata(&self, fd: RawFd, udata: Udata) -> Option<Udata> {
        let slot = self.table.slot(fd)?;
        slot.state.lock().udata.replace(udata)
    }

    /// Set the timeout for `fd` in seconds (0 = never).
    pub fn set_timeout(&self, fd: RawFd, seconds: u8) {
        if let Some(slot) = self.table.slot(fd) {
            let mut state = slot.state.lock();
            if state.occupied {
                state.timeout = seconds;
            }
        }
    }

    /// Reset the timeout counter for `fd`.
    pub fn touch(&self, fd: RawFd) {
        if let Some(slot) = self.table.slot(fd) {
            let mut state = slot.state.lock();
            if state.occupied {
                state.idle = 0;
            }
        }
    }

    // ── Reading and writing ──────────────────────────────────────

    /// Install per-fd replacements for read(2)/write(2). Cleared
    /// automatically on close.
    pub fn rw_hooks(&self, fd: RawFd, hooks: Arc<dyn RwHooks>) -> Result<(), Error> {
        let slot = self.table.slot(fd).ok_or(Error::VacantSlot)?;
        let mut state = slot.state.lock();
        if !state.occupied {
            return Err(Error::VacantSlot);
        }
        state.hooks = Some(hooks);
        Ok(())
    }

    /// Read up to `buf.len()` bytes from `fd` through its reading hook.
    ///
    /// `Ok(0)` means no data was available. `Err(Closed)` means EOF or a
    /// fatal error; the connection has been queued for close.
    pub fn read(&self, fd: RawFd, buf: &mut [u8]) -> Result<usize, Error> {
        let slot = self.table.slot(fd).ok_or(Error::VacantSlot)?;
        let hooks = {
            let state = slot.state.lock();
            if !state.occupied {
                return Err(Error::VacantSlot);
            }
            state.hooks.clone()
        };
        let n = hooks.as_deref().unwrap_or(&DEFAULT_HOOKS).read(fd, buf);
        if n > 0 {
            metrics::BYTES_RECEIVED.add(n as u64);
            self.touch(fd);
            Ok(n as usize)
        } else if n == 0 {
            Ok(0)
        } else {
            self.close_now(fd);
            Err(Error::Closed)
        }
    }

    /// Copy `data` into the write buffer. The bytes go out in call order,
    /// as one atomic packet, when the socket is ready.
    pub fn write(&self, fd: RawFd, data: &[u8]) -> Result<(), Error> {
        let data = bytes::Bytes::copy_from_slice(data);
        self.enqueue(fd, |queue| queue.push(data))
    }

    /// Move `data` into the write buffer without copying.
    pub fn write_move(&self, fd: RawFd, data: Vec<u8>) -> Result<(), Error> {
        self.enqueue(fd, |queue| queue.push(bytes::Bytes::from(data)))
    }

    /// Copy `data` into the write buffer right behind the in-flight
    /// packet, ahead of everything else queued.
    pub fn write_urgent(&self, fd: RawFd, data: &[u8]) -> Result<(), Error> {
        let data = bytes::Bytes::copy_from_slice(data);
        self.enqueue(fd, |queue| queue.push_urgent(data))
    }

    /// Move `data` into the write buffer at the urgent position.
    pub fn write_move_urgent(&self, fd: RawFd, data: Vec<u8>) -> Result<(), Error> {
        self.enqueue(fd, |queue| queue.push_urgent(bytes::Bytes::from(data)))
    }

    /// Stream a whole file as a single atomic packet, 64 KiB at a time.
    /// The file is closed after the final byte is sent, or when the
    /// connection goes away first.
    pub fn sendfile(&self, fd: RawFd, file: std::fs::File) -> Result<(), Error> {
        self.enqueue(fd, |queue| queue.push_file(file))
    }

    fn enqueue(&self, fd: RawFd, push: impl FnOnce(&mut crate::packet::WriteQueue)) -> Result<(), Error> {
        let slot = self.table.slot(fd).ok_or(Error::VacantSlot)?;
        {
            let state = slot.state.lock();
            if !state.occupied {
                return Err(Error::VacantSlot);
            }
            push(&mut slot.queue.lock());
        }
        self.arm_write(fd);
        Ok(())
    }

    // ── Connection actions ───────────────────────────────────────

    /// Take over an already-connected foreign fd: insert it into the
    /// table under `protocol`, register it with the reactor, and schedule
    /// `on_open`. The server owns the fd (and its close) from here on.
    pub fn attach(&self, fd: RawFd, protocol: Arc<dyn Protocol>) -> Result<(), Error> {
        set_nonblocking(fd)?;
        self.table.reserve(fd, protocol, self.settings.timeout)?;
        metrics::CONNECTIONS_ACTIVE.increment();
        self.schedule_on_open(fd);
        Ok(())
    }

    /// Close `fd`. Pending writes are flushed first: the fd keeps
    /// draining on writable events and closes once the buffer empties
    /// (or a hook reports a fatal error). No-op on a vacant fd.
    pub fn close(&self, fd: RawFd) {
        let Some(slot) = self.table.slot(fd) else {
            return;
        };
        let empty = {
            let mut state = slot.state.lock();
            if !state.occupied {
                return;
            }
            state.closing = true;
            slot.queue.lock().is_empty()
        };
        if empty {
            let _guard = slot.serial.lock();
            self.finalize_close(fd);
        } else {
            self.arm_write(fd);
        }
    }

    /// Remove `fd` from server management without close semantics: block
    /// until the write buffer empties, unregister from the reactor, and
    /// return the fd. `on_close` is NOT invoked and the fd stays open;
    /// it belongs to the caller now.
    pub fn hijack(&self, fd: RawFd) -> Result<RawFd, Error> {
        let slot = self.table.slot(fd).ok_or(Error::VacantSlot)?;
        let _guard = slot.serial.lock();
        {
            let state = slot.state.lock();
            if !state.occupied {
                return Err(Error::VacantSlot);
            }
        }
        loop {
            let hooks = { slot.state.lock().hooks.clone() };
            let outcome = {
                let mut queue = slot.queue.lock();
                queue.drain(fd, hooks.as_deref().unwrap_or(&DEFAULT_HOOKS))
            };
            match outcome {
                Drain::Emptied(sent) => {
                    metrics::BYTES_SENT.add(sent as u64);
                    break;
                }
                Drain::Blocked(sent) => {
                    metrics::BYTES_SENT.add(sent as u64);
                    wait_writable(fd, 50);
                }
                Drain::Fatal => break,
            }
        }
        let _ = self.reactor.unregister(fd);
        // Cancel the owed on_close before vacating.
        slot.state.lock().open = false;
        let _ = self.table.release(fd);
        metrics::CONNECTIONS_ACTIVE.decrement();
        Ok(fd)
    }

    /// Swap the active protocol: runs the old protocol's `on_close`, then
    /// the new protocol's `on_open`, serialized with every other callback
    /// on this fd. Writes in flight continue; only callbacks change.
    pub fn set_protocol(&self, fd: RawFd, protocol: Arc<dyn Protocol>) -> Result<(), Error> {
        let slot = self.table.slot(fd).ok_or(Error::VacantSlot)?;
        let _guard = slot.serial.lock();
        let old = {
            let state = slot.state.lock();
            if !state.occupied {
                return Err(Error::VacantSlot);
            }
            state.protocol.clone()
        };
        if let Some(old) = old {
            old.on_close(self, fd);
        }
        {
            let mut state = slot.state.lock();
            if !state.occupied {
                // The old on_close tore the connection down.
                return Err(Error::Closed);
            }
            state.protocol = Some(Arc::clone(&protocol));
        }
        protocol.on_open(self, fd);
        Ok(())
    }

    // ── Tasks ────────────────────────────────────────────────────

    /// Run a task asynchronously on the pool. With `threads <= 1` the
    /// task executes on the calling thread before this returns. Errors
    /// when the queue is full; nothing was scheduled.
    pub fn run_async<T>(&self, task: T) -> Result<(), Error>
    where
        T: FnOnce(&Server) + Send + 'static,
    {
        self.pool.spawn(self, task)
    }

    /// Schedule `task` to run under `fd`'s lock with the busy flag set.
    /// If the fd is vacant by execution time, `fallback` runs instead;
    /// exactly one of the two runs per successful schedule.
    pub fn fd_task<T>(
        &self,
        fd: RawFd,
        task: T,
        fallback: Option<Box<dyn FnOnce(&Server, RawFd) + Send>>,
    ) -> Result<(), Error>
    where
        T: FnOnce(&Server, RawFd) + Send + 'static,
    {
        if self.table.slot(fd).is_none() {
            return Err(Error::VacantSlot);
        }
        self.pool.spawn(self, move |server: &Server| {
            let Some(slot) = server.table.slot(fd) else {
                return;
            };
            let _guard = slot.serial.lock();
            let occupied = slot.state.lock().occupied;
            if occupied {
                slot.set_busy(true);
                task(server, fd);
                slot.set_busy(false);
            } else if let Some(fallback) = fallback {
                fallback(server, fd);
            }
        })
    }

    /// Schedule `task` for every currently-managed fd whose protocol
    /// service matches the filter (`None` matches all). The fd set is
    /// snapshotted now; protocol switches during the broadcast do not
    /// re-target a slot. `on_finish` runs for every targeted fd: after
    /// its task (or the vacant-fd fallback) completes, or inline when
    /// the task could not be scheduled at all. Returns the number of
    /// fds whose task was scheduled.
    pub fn each<T>(
        &self,
        service: Option<&str>,
        task: T,
        on_finish: Option<Box<dyn Fn(&Server, RawFd) + Send + Sync>>,
    ) -> Result<usize, Error>
    where
        T: Fn(&Server, RawFd) + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        let on_finish: Option<Arc<dyn Fn(&Server, RawFd) + Send + Sync>> =
            on_finish.map(Arc::from);
        let mut scheduled = 0;
        for fd in self.table.snapshot(service) {
            let task = Arc::clone(&task);
            let finish = on_finish.clone();
            let finish_fallback = on_finish.clone();
            let result = self.fd_task(
                fd,
                move |server, fd| {
                    (*task)(server, fd);
                    if let Some(finish) = finish {
                        (*finish)(server, fd);
                    }
                },
                Some(Box::new(move |server: &Server, fd: RawFd| {
                    if let Some(finish) = finish_fallback {
                        (*finish)(server, fd);
                    }
                })),
            );
            match result {
                Ok(()) => scheduled += 1,
                Err(_) => {
                    // A full queue must not leak the fd's cleanup.
                    if let Some(finish) = on_finish.as_deref() {
                        finish(self, fd);
                    }
                }
            }
        }
        Ok(scheduled)
    }

    /// Synchronous broadcast: iterate matching fds in fd order, acquire
    /// each slot's lock in turn, and run `task`. Returns once every task
    /// completed. Must not be called from inside a protected callback on
    /// this server; the deadlock risk is the caller's.
    pub fn each_block<T>(&self, service: Option<&str>, mut task: T) -> usize
    where
        T: FnMut(&Server, RawFd),
    {
        let mut count = 0;
        for fd in self.table.snapshot(service) {
            let Some(slot) = self.table.slot(fd) else {
                continue;
            };
            let _guard = slot.serial.lock();
            let occupied = slot.state.lock().occupied;
            if occupied {
                slot.set_busy(true);
                task(self, fd);
                slot.set_busy(false);
                count += 1;
            }
        }
        count
    }

    // ── Timers ───────────────────────────────────────────────────

    /// Fire `task` once after `milliseconds`, at the cost of one fd.
    /// Returns the timer's fd. Do not call from inside `on_close`: the
    /// new timer may take the fd number just released and collide with
    /// the still-finalizing slot.
    pub fn run_after<T>(&self, milliseconds: u64, task: T) -> Result<RawFd, Error>
    where
        T: FnOnce(&Server) + Send + 'static,
    {
        self.register_timer(
            milliseconds,
            false,
            TimerTask::Once(Some(Box::new(task))),
            0,
        )
    }

    /// Fire `task` every `milliseconds`, `repetitions` times (0 =
    /// forever), at the cost of one fd. Returns the timer's fd. The same
    /// `on_close` restriction as [`run_after`](Self::run_after) applies.
    pub fn run_every<T>(
        &self,
        milliseconds: u64,
        repetitions: u32,
        task: T,
    ) -> Result<RawFd, Error>
    where
        T: Fn(&Server) + Send + Sync + 'static,
    {
        self.register_timer(
            milliseconds,
            true,
            TimerTask::Every(Arc::new(task)),
            repetitions,
        )
    }

    fn register_timer(
        &self,
        milliseconds: u64,
        periodic: bool,
        task: TimerTask,
        remaining: u32,
    ) -> Result<RawFd, Error> {
        let fd = timer::create_timerfd(milliseconds, periodic)?;
        self.timers.insert(fd, TimerEntry { task, remaining });
        if let Err(e) = self.reactor.register(fd, Interest::READ.oneshot()) {
            self.timers.remove(fd);
            unsafe {
                libc::close(fd);
            }
            return Err(Error::Io(e));
        }
        Ok(fd)
    }

    // ── Event loop ───────────────────────────────────────────────

    fn event_loop(&self) {
        let mut events: Vec<Event> = Vec::with_capacity(256);
        let mut last_sweep = Instant::now();

        while self.running.load(Ordering::Acquire) {
            if STOP_SIGNAL.swap(false, Ordering::AcqRel) {
                stop_all();
            }
            events.clear();
            let batch = match self.reactor.wait(&mut events, 1000) {
                Ok(n) => n,
                Err(e) => {
                    log::error!("reactor wait failed: {e}");
                    break;
                }
            };
            for event in events.drain(..) {
                self.dispatch(event);
            }
            if last_sweep.elapsed() >= Duration::from_secs(1) {
                last_sweep = Instant::now();
                self.sweep_timeouts();
            }
            if let Some(hook) = self.settings.on_tick.as_deref() {
                hook(self);
            }
            if batch == 0 {
                if let Some(hook) = self.settings.on_idle.as_deref() {
                    hook(self);
                }
            }
        }
    }

    fn dispatch(&self, event: Event) {
        if event.fd == self.listen_fd {
            if event.kind == EventKind::Readable {
                self.accept_loop();
            }
            return;
        }
        if self.timers.contains(event.fd) {
            self.handle_timer(event.fd);
            return;
        }
        match event.kind {
            EventKind::Hup => self.close_now(event.fd),
            EventKind::Readable => {
                let fd = event.fd;
                if self
                    .pool
                    .spawn(self, move |server: &Server| server.run_on_data(fd))
                    .is_err()
                {
                    // Queue full: re-arm so the level-triggered event
                    // comes back and we retry.
                    self.rearm(fd);
                }
            }
            EventKind::Writable => self.drain_writable(event.fd),
        }
    }

    fn accept_loop(&self) {
        loop {
            let fd = unsafe {
                libc::accept4(
                    self.listen_fd,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::ECONNABORTED) => continue,
                    Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => break,
                    Some(libc::EMFILE) | Some(libc::ENFILE) => {
                        log::warn!("accept backoff, fd limit hit: {err}");
                        break;
                    }
                    _ => {
                        log::warn!("accept failed: {err}");
                        break;
                    }
                }
            }

            metrics::CONNECTIONS_ACCEPTED.increment();

            if fd as usize >= self.table.capacity() {
                metrics::CONNECTIONS_REFUSED.increment();
                if let Some(msg) = &self.settings.busy_msg {
                    unsafe {
                        libc::send(
                            fd,
                            msg.as_ptr() as *const libc::c_void,
                            msg.len(),
                            libc::MSG_NOSIGNAL,
                        );
                    }
                }
                unsafe {
                    libc::close(fd);
                }
                continue;
            }

            if self.settings.tcp_nodelay {
                set_nodelay(fd);
            }

            if self
                .table
                .reserve(fd, Arc::clone(&self.settings.protocol), self.settings.timeout)
                .is_err()
            {
                unsafe {
                    libc::close(fd);
                }
                continue;
            }
            metrics::CONNECTIONS_ACTIVE.increment();
            self.schedule_on_open(fd);
        }
    }

    fn schedule_on_open(&self, fd: RawFd) {
        if self
            .pool
            .spawn(self, move |server: &Server| server.run_on_open(fd))
            .is_err()
        {
            self.run_on_open(fd);
        }
    }

    /// Deliver `on_open`, then make the first reactor registration, so
    /// no other callback can be observed before `on_open`.
    fn run_on_open(&self, fd: RawFd) {
        let Some(slot) = self.table.slot(fd) else {
            return;
        };
        let _guard = slot.serial.lock();
        let protocol = {
            let mut state = slot.state.lock();
            if !state.occupied || state.open {
                None
            } else {
                state.open = true;
                state.protocol.clone()
            }
        };
        let Some(protocol) = protocol else {
            return;
        };
        protocol.on_open(self, fd);

        // The callback may have closed or hijacked the fd.
        let interest = {
            let state = slot.state.lock();
            if !state.occupied {
                return;
            }
            if state.closing || !slot.queue.lock().is_empty() {
                Interest::READ.union(Interest::WRITE)
            } else {
                Interest::READ
            }
        };
        if let Err(e) = self.reactor.register(fd, interest.oneshot()) {
            log::debug!("register fd {fd} failed: {e}");
        }
    }

    /// Protected `on_data` delivery: serialized, busy flag set.
    fn run_on_data(&self, fd: RawFd) {
        let Some(slot) = self.table.slot(fd) else {
            return;
        };
        let _guard = slot.serial.lock();
        let protocol = {
            let mut state = slot.state.lock();
            if !state.occupied || state.closing {
                None
            } else {
                state.idle = 0;
                state.protocol.clone()
            }
        };
        if let Some(protocol) = protocol {
            slot.set_busy(true);
            protocol.on_data(self, fd);
            slot.set_busy(false);
        }
        // Re-arm even when no callback ran: a readable-only event on a
        // closing fd consumed the one-shot arming, and the pending write
        // buffer still needs writable events to drain. No-op once the
        // slot is vacated.
        self.rearm(fd);
    }

    /// Drain the write buffer in-line under the fd's queue lock; on a
    /// fully-drained buffer deliver `on_ready` or finish a pending close.
    fn drain_writable(&self, fd: RawFd) {
        let Some(slot) = self.table.slot(fd) else {
            return;
        };
        let (hooks, closing) = {
            let state = slot.state.lock();
            if !state.occupied {
                return;
            }
            (state.hooks.clone(), state.closing)
        };
        let outcome = {
            let mut queue = slot.queue.lock();
            queue.drain(fd, hooks.as_deref().unwrap_or(&DEFAULT_HOOKS))
        };
        match outcome {
            Drain::Fatal => self.close_now(fd),
            Drain::Blocked(sent) => {
                if sent > 0 {
                    metrics::BYTES_SENT.add(sent as u64);
                    self.touch(fd);
                }
                self.arm_write(fd);
            }
            Drain::Emptied(sent) => {
                if sent > 0 {
                    metrics::BYTES_SENT.add(sent as u64);
                    self.touch(fd);
                }
                if closing {
                    let _guard = slot.serial.lock();
                    self.finalize_close(fd);
                    return;
                }
                let protocol = {
                    let state = slot.state.lock();
                    if state.occupied {
                        state.protocol.clone()
                    } else {
                        None
                    }
                };
                if let Some(protocol) = protocol {
                    let _guard = slot.serial.lock();
                    protocol.on_ready(self, fd);
                }
                self.rearm(fd);
            }
        }
    }

    /// Close without flushing: pending packets are dropped, their owned
    /// resources freed. Used for hup and fatal transport errors.
    fn close_now(&self, fd: RawFd) {
        let Some(slot) = self.table.slot(fd) else {
            return;
        };
        let _guard = slot.serial.lock();
        {
            let state = slot.state.lock();
            if !state.occupied {
                return;
            }
            slot.queue.lock().clear();
        }
        self.finalize_close(fd);
    }

    /// Vacate the slot, close the fd, and deliver the owed `on_close`.
    /// Caller holds the slot's serialization lock.
    fn finalize_close(&self, fd: RawFd) {
        let Some((protocol, was_open)) = self.table.release(fd) else {
            return;
        };
        let _ = self.reactor.unregister(fd);
        unsafe {
            libc::close(fd);
        }
        metrics::CONNECTIONS_CLOSED.increment();
        metrics::CONNECTIONS_ACTIVE.decrement();

        if was_open {
            // on_close runs with the protocol captured here: it must not
            // read the slot, which may already host a new connection by
            // the time the task runs.
            let inline = Arc::clone(&protocol);
            let scheduled = self.pool.spawn(self, move |server: &Server| {
                if let Some(slot) = server.table.slot(fd) {
                    let _guard = slot.serial.lock();
                    protocol.on_close(server, fd);
                }
            });
            if scheduled.is_err() {
                inline.on_close(self, fd);
            }
        }
    }

    // ── Timeout sweep ────────────────────────────────────────────

    fn sweep_timeouts(&self) {
        for fd in 3..self.table.capacity() {
            let fd = fd as RawFd;
            let Some(slot) = self.table.slot(fd) else {
                continue;
            };
            let expired = {
                let mut state = slot.state.lock();
                if !state.occupied || state.closing || state.timeout == 0 {
                    false
                } else {
                    state.idle = state.idle.saturating_add(1);
                    state.idle >= state.timeout
                }
            };
            if expired {
                // Queue full: the counter stays expired and the next
                // sweep retries.
                let _ = self
                    .pool
                    .spawn(self, move |server: &Server| server.run_ping(fd));
            }
        }
    }

    fn run_ping(&self, fd: RawFd) {
        let Some(slot) = self.table.slot(fd) else {
            return;
        };
        let _guard = slot.serial.lock();
        let protocol = {
            let state = slot.state.lock();
            let still_expired = state.occupied
                && !state.closing
                && state.timeout != 0
                && state.idle >= state.timeout;
            if still_expired {
                state.protocol.clone()
            } else {
                None
            }
        };
        if let Some(protocol) = protocol {
            protocol.ping(self, fd);
        }
    }

    // ── Timer dispatch ───────────────────────────────────────────

    fn handle_timer(&self, fd: RawFd) {
        if timer::read_expirations(fd) == 0 {
            let _ = self.reactor.modify(fd, Interest::READ.oneshot());
            return;
        }
        metrics::TIMERS_FIRED.increment();
        match self.timers.fire(fd) {
            Some((task, done)) => {
                if done {
                    let _ = self.reactor.unregister(fd);
                    unsafe {
                        libc::close(fd);
                    }
                } else {
                    let _ = self.reactor.modify(fd, Interest::READ.oneshot());
                }
                if let Err(task) = self.pool.try_spawn_boxed(self, task) {
                    task(self);
                }
            }
            None => {
                let _ = self.reactor.unregister(fd);
                unsafe {
                    libc::close(fd);
                }
            }
        }
    }

    // ── Re-arming ────────────────────────────────────────────────

    fn rearm(&self, fd: RawFd) {
        let Some(slot) = self.table.slot(fd) else {
            return;
        };
        let state = slot.state.lock();
        if !state.occupied {
            return;
        }
        let interest = if state.closing || !slot.queue.lock().is_empty() {
            Interest::READ.union(Interest::WRITE)
        } else {
            Interest::READ
        };
        let _ = self.reactor.modify(fd, interest.oneshot());
    }

    fn arm_write(&self, fd: RawFd) {
        // ENOENT before the first registration is fine: run_on_open
        // registers with write interest when the queue is non-empty.
        let _ = self
            .reactor
            .modify(fd, Interest::READ.union(Interest::WRITE).oneshot());
    }

    // ── Shutdown ─────────────────────────────────────────────────

    fn shutdown_sequence(&self) {
        let _ = self.reactor.unregister(self.listen_fd);

        for fd in 3..self.table.capacity() {
            let fd = fd as RawFd;
            let Some(slot) = self.table.slot(fd) else {
                continue;
            };
            let protocol = {
                let state = slot.state.lock();
                if state.occupied {
                    state.protocol.clone()
                } else {
                    None
                }
            };
            let Some(protocol) = protocol else {
                continue;
            };
            {
                let _guard = slot.serial.lock();
                protocol.on_shutdown(self, fd);
            }
            // One courtesy flush, then close regardless.
            let hooks = { slot.state.lock().hooks.clone() };
            let outcome = {
                let mut queue = slot.queue.lock();
                queue.drain(fd, hooks.as_deref().unwrap_or(&DEFAULT_HOOKS))
            };
            if let Drain::Emptied(sent) | Drain::Blocked(sent) = outcome {
                metrics::BYTES_SENT.add(sent as u64);
            }
            let _guard = slot.serial.lock();
            {
                let state = slot.state.lock();
                if !state.occupied {
                    continue;
                }
                slot.queue.lock().clear();
            }
            self.finalize_close(fd);
        }

        // Runs any on_close tasks still queued, then joins the workers.
        self.pool.shutdown(self);

        for fd in self.timers.take_all() {
            let _ = self.reactor.unregister(fd);
            unsafe {
                libc::close(fd);
            }
        }
    }

    fn terminate_children(&self) {
        let children: Vec<libc::pid_t> = self.children.lock().drain(..).collect();
        for pid in children {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
                let mut status: libc::c_int = 0;
                libc::waitpid(pid, &mut status, 0);
            }
        }
    }
}

// ── Socket plumbing ──────────────────────────────────────────────

fn create_listener(settings: &Settings) -> Result<RawFd, Error> {
    let port: u16 = settings
        .port
        .parse()
        .map_err(|_| Error::Setup(format!("invalid port: {:?}", settings.port)))?;
    let ip: IpAddr = settings
        .address
        .as_deref()
        .unwrap_or("0.0.0.0")
        .parse()
        .map_err(|_| Error::Setup(format!("invalid address: {:?}", settings.address)))?;
    let addr = SocketAddr::new(ip, port);

    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addrlen = socket_addr_to_sockaddr(addr, &mut storage);
    let ret = unsafe {
        libc::bind(
            fd,
            &storage as *const _ as *const libc::sockaddr,
            addrlen,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(Error::Setup(format!("bind {addr} failed: {err}")));
    }

    let ret = unsafe { libc::listen(fd, settings.backlog) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(Error::Setup(format!("listen on {addr} failed: {err}")));
    }
    Ok(fd)
}

/// Write a SocketAddr into a sockaddr_storage, returning the length.
fn socket_addr_to_sockaddr(addr: SocketAddr, storage: &mut libc::sockaddr_storage) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

fn set_nodelay(fd: RawFd) {
    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), Error> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

fn wait_writable(fd: RawFd, timeout_ms: i32) {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    unsafe {
        libc::poll(&mut pfd, 1, timeout_ms);
    }
}
