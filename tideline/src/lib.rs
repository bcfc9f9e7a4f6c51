//! tideline — a reactor-based TCP server framework for Linux.
//!
//! Applications supply a [`Protocol`] (a bundle of per-connection
//! callbacks) and [`Settings`]; tideline owns the listening socket, the
//! readiness loop, the worker pool, and all per-connection state: an
//! asynchronous write buffer with urgent insertion and file streaming,
//! per-fd task scheduling, broadcasts, timers, and pluggable transport
//! hooks for TLS or instrumentation.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::os::fd::RawFd;
//! use std::sync::Arc;
//! use tideline::{Protocol, Server, SettingsBuilder};
//!
//! struct Echo;
//!
//! impl Protocol for Echo {
//!     fn service(&self) -> &str {
//!         "echo"
//!     }
//!
//!     fn on_data(&self, server: &Server, fd: RawFd) {
//!         let mut buf = [0u8; 1024];
//!         while let Ok(n) = server.read(fd, &mut buf) {
//!             if n == 0 {
//!                 break;
//!             }
//!             let _ = server.write(fd, &buf[..n]);
//!         }
//!     }
//! }
//!
//! fn main() -> Result<(), tideline::Error> {
//!     let settings = SettingsBuilder::new(Arc::new(Echo))
//!         .port("7878")
//!         .threads(4)
//!         .timeout(30)
//!         .build()?;
//!     tideline::listen(settings)
//! }
//! ```
//!
//! # Concurrency model
//!
//! Callbacks for one fd are serialized; callbacks across fds run in
//! parallel on the worker pool. With `threads = 1` (the default) there is
//! no pool and everything runs inline on the reactor thread. With
//! `processes > 1` the listener is shared across forked processes, each
//! with its own reactor and pool.
//!
//! # Platform
//!
//! Linux only: epoll and timerfd back the reactor and timer facility.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod connection;
pub(crate) mod metrics;
pub(crate) mod packet;
pub(crate) mod pool;
pub(crate) mod timer;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod error;
pub mod hooks;
pub mod protocol;
pub mod reactor;
pub mod server;

// ── Re-exports: core types ──────────────────────────────────────────────

/// Server configuration; `protocol` is the only required field.
pub use config::Settings;
/// Builder for [`Settings`] with discoverable methods and `build()` validation.
pub use config::SettingsBuilder;
/// A server lifecycle hook (`on_init`, `on_tick`, ...).
pub use config::LifecycleHook;
/// Opaque per-connection user data.
pub use connection::Udata;
/// Library errors.
pub use error::Error;
/// Per-fd replacements for read(2)/write(2) (TLS, instrumentation).
pub use hooks::RwHooks;
/// The per-connection callback bundle.
pub use protocol::Protocol;
/// A running server instance, passed to every callback.
pub use server::Server;

// ── Re-exports: operations ──────────────────────────────────────────────

/// The process's adjusted file-descriptor capacity.
pub use connection::capacity;
/// Run a server; blocks until it is stopped.
pub use server::listen;
/// Stop every server running in this process.
pub use server::stop_all;

// ── Re-exports: reactor surface ─────────────────────────────────────────

/// A readiness notification.
pub use reactor::Event;
/// The kind of readiness delivered for one fd.
pub use reactor::EventKind;
/// Interest flags for a reactor registration.
pub use reactor::Interest;
/// The epoll readiness notifier.
pub use reactor::Reactor;
