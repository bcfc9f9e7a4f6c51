use std::os::fd::RawFd;

/// Per-fd replacements for `read(2)`/`write(2)`.
///
/// Hooks let a transport layer (TLS, instrumentation) sit between the
/// server's buffers and the socket. Both methods follow the same contract:
///
/// - a return value `> 0` is the number of bytes moved;
/// - `0` means no progress but no fatal error; the hook will not be
///   invoked again until the next readiness edge;
/// - `< 0` means a fatal error and the connection must be closed.
///
/// A hook MUST actually attempt I/O on every invocation. Returning a
/// positive count without touching the network stalls the write buffer
/// until the next readiness edge, which may never come.
///
/// Hooks are installed with [`Server::rw_hooks`](crate::Server::rw_hooks)
/// and cleared automatically when the connection closes.
pub trait RwHooks: Send + Sync {
    /// Read up to `buf.len()` bytes from the transport into `buf`.
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> isize;

    /// Write bytes from `data` to the transport.
    fn write(&self, fd: RawFd, data: &[u8]) -> isize;
}

/// The default transport: plain `recv(2)`/`send(2)` with
/// `EAGAIN`/`EWOULDBLOCK`/`EINTR` mapped to 0 and everything else to -1.
/// EOF on read is fatal (-1): the peer is gone.
pub(crate) struct DefaultHooks;

impl RwHooks for DefaultHooks {
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> isize {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n > 0 {
            return n as isize;
        }
        if n < 0 && transient_errno() {
            return 0;
        }
        -1
    }

    fn write(&self, fd: RawFd, data: &[u8]) -> isize {
        let n = unsafe {
            libc::send(
                fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n >= 0 {
            return n as isize;
        }
        if transient_errno() {
            return 0;
        }
        -1
    }
}

fn transient_errno() -> bool {
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::EINTR
}
