use std::io;

use thiserror::Error;

/// Errors returned by the tideline server.
#[derive(Debug, Error)]
pub enum Error {
    /// A system call failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Setup failed (invalid settings, bind/listen failure).
    #[error("setup: {0}")]
    Setup(String),
    /// No free connection slots available.
    #[error("connection capacity reached")]
    CapacityReached,
    /// The file descriptor is not managed by the server.
    #[error("vacant file descriptor")]
    VacantSlot,
    /// The task queue is full; nothing was scheduled.
    #[error("task queue full")]
    QueueFull,
    /// The connection was closed (EOF or fatal socket error).
    #[error("connection closed")]
    Closed,
}
