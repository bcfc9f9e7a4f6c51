//! Integration tests for the task/timer scheduler and connection
//! bookkeeping: run_async, fd_task fallbacks, broadcasts, timers,
//! timeout pings, udata, and attach.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tideline::{listen, Error, Protocol, Server, Settings, SettingsBuilder};

// ── Helpers ─────────────────────────────────────────────────────────

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn launch(settings: Settings) -> thread::JoinHandle<Result<(), Error>> {
    thread::spawn(move || listen(settings))
}

fn wait_for_server(addr: &str) {
    for _ in 0..200 {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("server did not start on {addr}");
}

fn stop_server(addr: &str, handle: thread::JoinHandle<Result<(), Error>>) {
    if let Ok(mut stream) = TcpStream::connect(addr) {
        let _ = stream.write_all(b"#stop");
    }
    handle.join().unwrap().unwrap();
}

fn read_some(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = vec![0u8; len];
    let mut total = 0;
    while total < len {
        match stream.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => panic!("read error: {e}"),
        }
    }
    buf.truncate(total);
    buf
}

/// Asserts no further bytes arrive within a short window.
fn assert_quiet(stream: &mut TcpStream) {
    stream
        .set_read_timeout(Some(Duration::from_millis(150)))
        .unwrap();
    let mut byte = [0u8; 1];
    match stream.read(&mut byte) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected extra bytes: {:?}", &byte[..n]),
        Err(e)
            if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {}
        Err(e) => panic!("read error: {e}"),
    }
}

// ── Timers and run_async (checked from on_init) ────────────────────

static AFTER_FIRES: AtomicUsize = AtomicUsize::new(0);
static EVERY_FIRES: AtomicUsize = AtomicUsize::new(0);
static ASYNC_WAS_SYNCHRONOUS: AtomicBool = AtomicBool::new(false);
static FALLBACK_RAN: AtomicBool = AtomicBool::new(false);
static VACANT_TASK_RAN: AtomicBool = AtomicBool::new(false);

struct TimerEcho;

impl Protocol for TimerEcho {
    fn on_data(&self, server: &Server, fd: RawFd) {
        let mut buf = [0u8; 1024];
        while let Ok(n) = server.read(fd, &mut buf) {
            if n == 0 {
                break;
            }
            if &buf[..n] == b"#stop" {
                server.stop();
                return;
            }
            let _ = server.write(fd, &buf[..n]);
        }
    }
}

#[test]
fn timers_and_inline_async() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let settings = SettingsBuilder::new(Arc::new(TimerEcho))
        .address("127.0.0.1")
        .port(port.to_string())
        .on_init(|server| {
            // threads = 1: run_async completes before returning.
            let ran = Arc::new(AtomicBool::new(false));
            let ran2 = Arc::clone(&ran);
            server
                .run_async(move |_| ran2.store(true, Ordering::SeqCst))
                .unwrap();
            ASYNC_WAS_SYNCHRONOUS.store(ran.load(Ordering::SeqCst), Ordering::SeqCst);

            server
                .run_after(50, |_| {
                    AFTER_FIRES.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            server
                .run_every(40, 3, |_| {
                    EVERY_FIRES.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();

            // A vacant fd routes the scheduled task to its fallback.
            server
                .fd_task(
                    99,
                    |_, _| {
                        VACANT_TASK_RAN.store(true, Ordering::SeqCst);
                    },
                    Some(Box::new(|_: &Server, _: RawFd| {
                        FALLBACK_RAN.store(true, Ordering::SeqCst);
                    })),
                )
                .unwrap();
        })
        .build()
        .unwrap();
    let handle = launch(settings);
    wait_for_server(&addr);

    thread::sleep(Duration::from_millis(800));

    assert!(ASYNC_WAS_SYNCHRONOUS.load(Ordering::SeqCst));
    assert!(FALLBACK_RAN.load(Ordering::SeqCst));
    assert!(!VACANT_TASK_RAN.load(Ordering::SeqCst));
    assert_eq!(AFTER_FIRES.load(Ordering::SeqCst), 1);
    // A finite periodic timer fires exactly its repetition count, then
    // releases its fd.
    assert_eq!(EVERY_FIRES.load(Ordering::SeqCst), 3);

    stop_server(&addr, handle);
}

// ── Broadcasts, fd tasks, and count ─────────────────────────────────

static BROADCAST_FINISHED: AtomicUsize = AtomicUsize::new(0);

struct Control;

impl Protocol for Control {
    fn service(&self) -> &str {
        "ctl"
    }

    fn on_data(&self, server: &Server, fd: RawFd) {
        let mut buf = [0u8; 1024];
        while let Ok(n) = server.read(fd, &mut buf) {
            if n == 0 {
                break;
            }
            match &buf[..n] {
                b"#stop" => {
                    server.stop();
                    return;
                }
                b"#hi" => {
                    server
                        .each(
                            None,
                            |srv, target| {
                                let _ = srv.write(target, b"hi");
                            },
                            Some(Box::new(|_: &Server, _: RawFd| {
                                BROADCAST_FINISHED.fetch_add(1, Ordering::SeqCst);
                            })),
                        )
                        .unwrap();
                }
                b"#count" => {
                    let count = server.count(Some("ctl"));
                    let _ = server.write(fd, count.to_string().as_bytes());
                }
                b"#eachblock" => {
                    let visited = server.each_block(None, |_, _| {});
                    let _ = server.write(fd, visited.to_string().as_bytes());
                }
                b"#fdtask" => {
                    server
                        .fd_task(
                            fd,
                            |srv, target| {
                                let _ = srv.write(target, b"T");
                            },
                            None,
                        )
                        .unwrap();
                }
                other => {
                    let _ = server.write(fd, other);
                }
            }
        }
    }
}

#[test]
fn broadcast_reaches_every_connection_once() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let settings = SettingsBuilder::new(Arc::new(Control))
        .address("127.0.0.1")
        .port(port.to_string())
        .build()
        .unwrap();
    let handle = launch(settings);
    wait_for_server(&addr);
    // Let the probe connection finish closing so it is not broadcast to.
    thread::sleep(Duration::from_millis(200));

    // Three passive clients, synced so their slots are live.
    let mut clients = Vec::new();
    for i in 0..3 {
        let mut stream = TcpStream::connect(&addr).unwrap();
        let sync = format!("sync-{i}");
        stream.write_all(sync.as_bytes()).unwrap();
        assert_eq!(read_some(&mut stream, sync.len()), sync.as_bytes());
        clients.push(stream);
    }

    let mut control = TcpStream::connect(&addr).unwrap();
    control.write_all(b"sync-ctl").unwrap();
    assert_eq!(read_some(&mut control, 8), b"sync-ctl");

    control.write_all(b"#hi").unwrap();
    control.flush().unwrap();

    // Every live connection (the three clients and the control) gets
    // "hi" exactly once, and on_finish ran once per targeted fd.
    for stream in &mut clients {
        assert_eq!(read_some(stream, 2), b"hi");
        assert_quiet(stream);
    }
    assert_eq!(read_some(&mut control, 2), b"hi");

    thread::sleep(Duration::from_millis(300));
    assert_eq!(BROADCAST_FINISHED.load(Ordering::SeqCst), 4);

    stop_server(&addr, handle);
}

#[test]
fn count_and_each_block_see_live_connections() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let settings = SettingsBuilder::new(Arc::new(Control))
        .address("127.0.0.1")
        .port(port.to_string())
        .build()
        .unwrap();
    let handle = launch(settings);
    wait_for_server(&addr);
    // Let the probe connection finish closing before counting.
    thread::sleep(Duration::from_millis(200));

    let mut clients = Vec::new();
    for i in 0..3 {
        let mut stream = TcpStream::connect(&addr).unwrap();
        let sync = format!("sync-{i}");
        stream.write_all(sync.as_bytes()).unwrap();
        assert_eq!(read_some(&mut stream, sync.len()), sync.as_bytes());
        clients.push(stream);
    }

    let mut control = TcpStream::connect(&addr).unwrap();
    control.write_all(b"sync-ctl").unwrap();
    assert_eq!(read_some(&mut control, 8), b"sync-ctl");

    control.write_all(b"#count").unwrap();
    assert_eq!(read_some(&mut control, 1), b"4");

    control.write_all(b"#eachblock").unwrap();
    assert_eq!(read_some(&mut control, 1), b"4");

    control.write_all(b"#fdtask").unwrap();
    assert_eq!(read_some(&mut control, 1), b"T");

    stop_server(&addr, handle);
}

// ── Timeout and ping ────────────────────────────────────────────────

static PINGS: AtomicUsize = AtomicUsize::new(0);

struct KeepAlive;

impl Protocol for KeepAlive {
    fn on_data(&self, server: &Server, fd: RawFd) {
        let mut buf = [0u8; 1024];
        while let Ok(n) = server.read(fd, &mut buf) {
            if n == 0 {
                break;
            }
            if &buf[..n] == b"#stop" {
                server.stop();
                return;
            }
            let _ = server.write(fd, &buf[..n]);
        }
    }

    fn ping(&self, server: &Server, fd: RawFd) {
        PINGS.fetch_add(1, Ordering::SeqCst);
        server.touch(fd);
    }
}

#[test]
fn ping_keeps_idle_connection_alive() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let settings = SettingsBuilder::new(Arc::new(KeepAlive))
        .address("127.0.0.1")
        .port(port.to_string())
        .timeout(2)
        .build()
        .unwrap();
    let handle = launch(settings);
    wait_for_server(&addr);

    let mut stream = TcpStream::connect(&addr).unwrap();
    // Stay idle past the timeout; the ping must have touched us alive.
    thread::sleep(Duration::from_millis(3500));
    assert!(PINGS.load(Ordering::SeqCst) >= 1);

    stream.write_all(b"still here").unwrap();
    assert_eq!(read_some(&mut stream, 10), b"still here");

    stop_server(&addr, handle);
}

struct NoPing;

impl Protocol for NoPing {
    fn on_data(&self, server: &Server, fd: RawFd) {
        let mut buf = [0u8; 1024];
        while let Ok(n) = server.read(fd, &mut buf) {
            if n == 0 {
                break;
            }
            if &buf[..n] == b"#stop" {
                server.stop();
                return;
            }
        }
    }
}

#[test]
fn default_ping_closes_idle_connection() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let settings = SettingsBuilder::new(Arc::new(NoPing))
        .address("127.0.0.1")
        .port(port.to_string())
        .timeout(1)
        .build()
        .unwrap();
    let handle = launch(settings);
    wait_for_server(&addr);

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // No ping override: the expired timeout closes the connection and
    // the client observes EOF.
    let mut byte = [0u8; 1];
    let eof = loop {
        match stream.read(&mut byte) {
            Ok(0) => break true,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if e.kind() == io::ErrorKind::ConnectionReset
                    || e.kind() == io::ErrorKind::ConnectionAborted =>
            {
                break true
            }
            Err(_) => break false,
        }
    };
    assert!(eof, "expected the server to close the idle connection");

    stop_server(&addr, handle);
}

// ── Udata ───────────────────────────────────────────────────────────

static UDATA_ROUND_TRIP: AtomicBool = AtomicBool::new(false);
static UDATA_OUT_OF_BAND: AtomicBool = AtomicBool::new(false);

struct UdataProto;

impl Protocol for UdataProto {
    fn on_open(&self, server: &Server, fd: RawFd) {
        let previous = server.set_udata(fd, Arc::new(42u32));
        let stored = server
            .get_udata(fd)
            .and_then(|udata| udata.downcast::<u32>().ok())
            .map(|n| *n);
        if previous.is_none() && stored == Some(42) {
            UDATA_ROUND_TRIP.store(true, Ordering::SeqCst);
        }
    }

    fn on_data(&self, server: &Server, fd: RawFd) {
        let mut buf = [0u8; 64];
        while let Ok(n) = server.read(fd, &mut buf) {
            if n == 0 {
                break;
            }
            if &buf[..n] == b"#stop" {
                server.stop();
                return;
            }
        }
    }
}

#[test]
fn udata_round_trips_per_connection_and_out_of_band() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let settings = SettingsBuilder::new(Arc::new(UdataProto))
        .address("127.0.0.1")
        .port(port.to_string())
        .on_init(|server| {
            // fds 0..=2 never carry connections; their udata cells are
            // usable as out-of-band storage.
            server.set_udata(0, Arc::new("global".to_string()));
            let found = server
                .get_udata(0)
                .and_then(|udata| udata.downcast::<String>().ok())
                .map(|s| (*s).clone());
            if found.as_deref() == Some("global") {
                UDATA_OUT_OF_BAND.store(true, Ordering::SeqCst);
            }
        })
        .build()
        .unwrap();
    let handle = launch(settings);
    wait_for_server(&addr);
    thread::sleep(Duration::from_millis(200));

    assert!(UDATA_OUT_OF_BAND.load(Ordering::SeqCst));
    assert!(UDATA_ROUND_TRIP.load(Ordering::SeqCst));

    stop_server(&addr, handle);
}

// ── Attach ──────────────────────────────────────────────────────────

static ATTACH_PEER: AtomicI32 = AtomicI32::new(-1);

struct AttachEcho;

impl Protocol for AttachEcho {
    fn on_data(&self, server: &Server, fd: RawFd) {
        let mut buf = [0u8; 1024];
        while let Ok(n) = server.read(fd, &mut buf) {
            if n == 0 {
                break;
            }
            let _ = server.write(fd, &buf[..n]);
        }
    }
}

struct AttachHost;

impl Protocol for AttachHost {
    fn on_data(&self, server: &Server, fd: RawFd) {
        let mut buf = [0u8; 64];
        while let Ok(n) = server.read(fd, &mut buf) {
            if n == 0 {
                break;
            }
            if &buf[..n] == b"#stop" {
                server.stop();
                return;
            }
        }
    }
}

#[test]
fn attach_manages_a_foreign_fd() {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let settings = SettingsBuilder::new(Arc::new(AttachHost))
        .address("127.0.0.1")
        .port(port.to_string())
        .on_init(|server| {
            let mut pair = [0 as RawFd; 2];
            let ret = unsafe {
                libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, pair.as_mut_ptr())
            };
            assert_eq!(ret, 0);
            server.attach(pair[0], Arc::new(AttachEcho)).unwrap();
            ATTACH_PEER.store(pair[1], Ordering::SeqCst);
        })
        .build()
        .unwrap();
    let handle = launch(settings);
    wait_for_server(&addr);

    let peer = ATTACH_PEER.load(Ordering::SeqCst);
    assert!(peer >= 0);

    let msg = b"over the socketpair";
    let sent = unsafe { libc::write(peer, msg.as_ptr() as *const libc::c_void, msg.len()) };
    assert_eq!(sent, msg.len() as isize);

    // The attached end echoes through the server.
    let mut got = Vec::new();
    let mut buf = [0u8; 64];
    while got.len() < msg.len() {
        let mut pfd = libc::pollfd {
            fd: peer,
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pfd, 1, 5000) };
        assert_eq!(ready, 1, "attached echo timed out");
        let n = unsafe { libc::read(peer, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert!(n > 0);
        got.extend_from_slice(&buf[..n as usize]);
    }
    assert_eq!(got, msg);

    unsafe {
        libc::close(peer);
    }
    stop_server(&addr, handle);
}
