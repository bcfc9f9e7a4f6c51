use std::os::fd::RawFd;

use crate::server::Server;

/// The callbacks driving one application-layer behavior for a connection.
///
/// A protocol is attached to every managed fd. All methods have default
/// bodies, so an implementation only overrides what it needs. Callbacks
/// receive the owning [`Server`] and the connection's fd and re-enter the
/// server through its public API (`read`, `write`, `close`, ...).
///
/// Callbacks for a single fd never run concurrently with each other.
/// `on_data` additionally marks the connection busy for its duration, so
/// scheduled fd tasks queue up behind it.
pub trait Protocol: Send + Sync {
    /// Identity string used by broadcast filtering ([`Server::each`]) and
    /// [`Server::count`]. The default is the empty string.
    fn service(&self) -> &str {
        ""
    }

    /// Called once when the connection enters the server's management
    /// (accept, [`Server::attach`], or [`Server::set_protocol`]).
    fn on_open(&self, server: &Server, fd: RawFd) {
        let _ = (server, fd);
    }

    /// Called when data is available on the socket. Protected: the
    /// connection is marked busy while this runs.
    fn on_data(&self, server: &Server, fd: RawFd) {
        let _ = (server, fd);
    }

    /// Called when the socket becomes writable and the write buffer is
    /// empty: an opportunity to push more data.
    fn on_ready(&self, server: &Server, fd: RawFd) {
        let _ = (server, fd);
    }

    /// Called for each open connection when the server shuts down, before
    /// the connection is closed.
    fn on_shutdown(&self, server: &Server, fd: RawFd) {
        let _ = (server, fd);
    }

    /// Called exactly once after the connection left the server, as the
    /// last callback observed for it.
    ///
    /// The fd number may already belong to a new connection by the time
    /// this runs. Treat it as an identifier for cleanup bookkeeping
    /// only: do not read, write, close, or look it up through the
    /// server.
    fn on_close(&self, server: &Server, fd: RawFd) {
        let _ = (server, fd);
    }

    /// Called when the connection's timeout counter expires. Override and
    /// call [`Server::touch`] to keep the connection alive; the default
    /// closes it.
    fn ping(&self, server: &Server, fd: RawFd) {
        server.close(fd);
    }
}
