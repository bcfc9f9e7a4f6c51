//! The per-connection asynchronous write buffer.
//!
//! Writes never hit the socket directly: they enqueue a packet and arm the
//! reactor for writability. Each packet is atomic on the wire: its bytes
//! are sent contiguously before any other packet's bytes. Urgent packets
//! are inserted right behind the in-flight head, never splitting it.
//!
//! File-backed packets stream a [`std::fs::File`] through a fixed-size
//! chunk buffer; the file is dropped (closed) when fully sent or when the
//! connection goes away with the packet still queued.

use std::collections::VecDeque;
use std::io::Read;
use std::os::fd::RawFd;

use bytes::Bytes;

use crate::hooks::RwHooks;

/// How much of a file is pulled into memory per refill.
const FILE_CHUNK: usize = 64 * 1024;

/// One atomic unit in the write queue.
pub(crate) enum Packet {
    Mem {
        data: Bytes,
        offset: usize,
    },
    File {
        file: std::fs::File,
        chunk: Vec<u8>,
        offset: usize,
    },
}

/// Outcome of one drain cycle. The payload is the number of bytes moved.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Drain {
    /// The queue is empty; everything was sent.
    Emptied(usize),
    /// The transport reported no progress; the head packet stays put until
    /// the next writable notification.
    Blocked(usize),
    /// The transport reported a fatal error; the connection must close.
    Fatal,
}

/// FIFO of pending packets for one connection.
pub(crate) struct WriteQueue {
    packets: VecDeque<Packet>,
}

impl WriteQueue {
    pub fn new() -> Self {
        WriteQueue {
            packets: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Append a memory packet at the tail.
    pub fn push(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.packets.push_back(Packet::Mem { data, offset: 0 });
        }
    }

    /// Insert a memory packet right behind the current head (position 1,
    /// or 0 when the queue is empty) so the in-flight packet finishes
    /// intact.
    pub fn push_urgent(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let at = self.packets.len().min(1);
        self.packets.insert(at, Packet::Mem { data, offset: 0 });
    }

    /// Append a file packet at the tail. The queue owns the file from this
    /// moment on and closes it on completion or teardown.
    pub fn push_file(&mut self, file: std::fs::File) {
        self.packets.push_back(Packet::File {
            file,
            chunk: Vec::new(),
            offset: 0,
        });
    }

    /// Drop every pending packet without sending. Owned files are closed.
    pub fn clear(&mut self) {
        self.packets.clear();
    }

    /// Push packets into the transport until the queue empties, the
    /// transport blocks, or it fails.
    pub fn drain(&mut self, fd: RawFd, hooks: &dyn RwHooks) -> Drain {
        let mut sent = 0usize;
        loop {
            let Some(head) = self.packets.front_mut() else {
                return Drain::Emptied(sent);
            };
            match head {
                Packet::Mem { data, offset } => {
                    if *offset >= data.len() {
                        self.packets.pop_front();
                        continue;
                    }
                    let n = hooks.write(fd, &data[*offset..]);
                    if n < 0 {
                        return Drain::Fatal;
                    }
                    if n == 0 {
                        return Drain::Blocked(sent);
                    }
                    *offset += n as usize;
                    sent += n as usize;
                    if *offset >= data.len() {
                        self.packets.pop_front();
                    }
                }
                Packet::File {
                    file,
                    chunk,
                    offset,
                } => {
                    if *offset >= chunk.len() {
                        chunk.resize(FILE_CHUNK, 0);
                        match file.read(&mut chunk[..]) {
                            Ok(0) => {
                                // EOF: packet complete, pop drops the file.
                                self.packets.pop_front();
                                continue;
                            }
                            Ok(n) => {
                                chunk.truncate(n);
                                *offset = 0;
                            }
                            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                                chunk.clear();
                                *offset = 0;
                                continue;
                            }
                            Err(_) => return Drain::Fatal,
                        }
                    }
                    let n = hooks.write(fd, &chunk[*offset..]);
                    if n < 0 {
                        return Drain::Fatal;
                    }
                    if n == 0 {
                        return Drain::Blocked(sent);
                    }
                    *offset += n as usize;
                    sent += n as usize;
                }
            }
        }
    }
}
