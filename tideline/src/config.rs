use std::sync::Arc;

use crate::connection::Udata;
use crate::error::Error;
use crate::protocol::Protocol;
use crate::server::Server;

/// A server lifecycle hook (`on_init`, `on_tick`, ...).
pub type LifecycleHook = Arc<dyn Fn(&Server) + Send + Sync>;

/// Server configuration. Only `protocol` (the default protocol installed
/// on accepted connections) is required; every other field has a default.
#[derive(Clone)]
pub struct Settings {
    /// The default protocol for new connections.
    pub protocol: Arc<dyn Protocol>,
    /// Port to listen on. Default "8080".
    pub port: String,
    /// Address to bind. `None` binds all addresses.
    pub address: Option<String>,
    /// Called once per process when the server starts, before the loop.
    pub on_init: Option<LifecycleHook>,
    /// Called once per process after the loop ends, for cleanup.
    pub on_finish: Option<LifecycleHook>,
    /// Called after every event-loop cycle.
    pub on_tick: Option<LifecycleHook>,
    /// Called after event-loop cycles that saw no events.
    pub on_idle: Option<LifecycleHook>,
    /// Called inside each worker thread as it starts.
    pub on_init_thread: Option<LifecycleHook>,
    /// Sent (then disconnect) when an accept exceeds capacity.
    /// `None` drops the connection silently.
    pub busy_msg: Option<Vec<u8>>,
    /// Server-wide opaque user data, readable via [`Server::settings`].
    pub udata: Option<Udata>,
    /// Worker threads for the task pool. With 1 (the default) everything
    /// runs inline on the reactor thread.
    pub threads: usize,
    /// Worker processes. With more than 1, `processes - 1` children are
    /// forked; the parent serves too. Default 1 (no forking).
    pub processes: usize,
    /// Default connection timeout in seconds (0..=255, 0 = none).
    /// Default 5.
    pub timeout: u8,
    /// Set TCP_NODELAY on accepted connections. Default true.
    pub tcp_nodelay: bool,
    /// TCP listen backlog. Default 1024.
    pub backlog: i32,
    /// Bound of the task queue; `run_async` and fd tasks fail when it is
    /// full. Default 4096.
    pub task_queue_capacity: usize,
}

impl Settings {
    /// Settings with all defaults and the given default protocol.
    pub fn new(protocol: Arc<dyn Protocol>) -> Self {
        Settings {
            protocol,
            port: "8080".to_string(),
            address: None,
            on_init: None,
            on_finish: None,
            on_tick: None,
            on_idle: None,
            on_init_thread: None,
            busy_msg: None,
            udata: None,
            threads: 1,
            processes: 1,
            timeout: 5,
            tcp_nodelay: true,
            backlog: 1024,
            task_queue_capacity: 4096,
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), Error> {
        if self.port.parse::<u16>().is_err() {
            return Err(Error::Setup(format!("invalid port: {:?}", self.port)));
        }
        if self.threads == 0 {
            return Err(Error::Setup("threads must be >= 1".into()));
        }
        if self.processes == 0 {
            return Err(Error::Setup("processes must be >= 1".into()));
        }
        if self.task_queue_capacity == 0 {
            return Err(Error::Setup("task_queue_capacity must be > 0".into()));
        }
        if self.backlog <= 0 {
            return Err(Error::Setup("backlog must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for [`Settings`] with discoverable methods and `build()`
/// validation.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use tideline::{Protocol, SettingsBuilder};
///
/// struct Echo;
/// impl Protocol for Echo {}
///
/// let settings = SettingsBuilder::new(Arc::new(Echo))
///     .port("9000")
///     .threads(4)
///     .timeout(30)
///     .build()
///     .expect("invalid settings");
/// ```
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    /// Create a builder with default settings and the given protocol.
    pub fn new(protocol: Arc<dyn Protocol>) -> Self {
        SettingsBuilder {
            settings: Settings::new(protocol),
        }
    }

    // ── Listener settings ────────────────────────────────────────────

    /// Set the port to listen on.
    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.settings.port = port.into();
        self
    }

    /// Set the address to bind.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.settings.address = Some(address.into());
        self
    }

    /// Set the TCP listen backlog.
    pub fn backlog(mut self, backlog: i32) -> Self {
        self.settings.backlog = backlog;
        self
    }

    /// Enable or disable TCP_NODELAY on accepted connections.
    pub fn tcp_nodelay(mut self, enable: bool) -> Self {
        self.settings.tcp_nodelay = enable;
        self
    }

    // ── Concurrency settings ─────────────────────────────────────────

    /// Set the number of worker threads.
    pub fn threads(mut self, n: usize) -> Self {
        self.settings.threads = n;
        self
    }

    /// Set the number of worker processes.
    pub fn processes(mut self, n: usize) -> Self {
        self.settings.processes = n;
        self
    }

    /// Set the task queue bound.
    pub fn task_queue_capacity(mut self, n: usize) -> Self {
        self.settings.task_queue_capacity = n;
        self
    }

    // ── Connection settings ──────────────────────────────────────────

    /// Set the default connection timeout in seconds (0 = none).
    pub fn timeout(mut self, seconds: u8) -> Self {
        self.settings.timeout = seconds;
        self
    }

    /// Set the message sent before disconnecting when capacity is
    /// exceeded.
    pub fn busy_msg(mut self, msg: impl Into<Vec<u8>>) -> Self {
        self.settings.busy_msg = Some(msg.into());
        self
    }

    /// Attach server-wide opaque user data.
    pub fn udata(mut self, udata: Udata) -> Self {
        self.settings.udata = Some(udata);
        self
    }

    // ── Lifecycle hooks ──────────────────────────────────────────────

    /// Called once per process when the server starts.
    pub fn on_init(mut self, hook: impl Fn(&Server) + Send + Sync + 'static) -> Self {
        self.settings.on_init = Some(Arc::new(hook));
        self
    }

    /// Called once per process after the loop ends.
    pub fn on_finish(mut self, hook: impl Fn(&Server) + Send + Sync + 'static) -> Self {
        self.settings.on_finish = Some(Arc::new(hook));
        self
    }

    /// Called after every event-loop cycle.
    pub fn on_tick(mut self, hook: impl Fn(&Server) + Send + Sync + 'static) -> Self {
        self.settings.on_tick = Some(Arc::new(hook));
        self
    }

    /// Called after event-loop cycles that saw no events.
    pub fn on_idle(mut self, hook: impl Fn(&Server) + Send + Sync + 'static) -> Self {
        self.settings.on_idle = Some(Arc::new(hook));
        self
    }

    /// Called inside each worker thread as it starts.
    pub fn on_init_thread(mut self, hook: impl Fn(&Server) + Send + Sync + 'static) -> Self {
        self.settings.on_init_thread = Some(Arc::new(hook));
        self
    }

    // ── Terminal ─────────────────────────────────────────────────────

    /// Validate and build the final [`Settings`].
    pub fn build(self) -> Result<Settings, Error> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;
    impl Protocol for Dummy {}

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::new(Arc::new(Dummy));
        assert!(settings.validate().is_ok());
        assert_eq!(settings.port, "8080");
        assert_eq!(settings.threads, 1);
        assert_eq!(settings.processes, 1);
        assert_eq!(settings.timeout, 5);
    }

    #[test]
    fn invalid_values_rejected() {
        let mut settings = Settings::new(Arc::new(Dummy));
        settings.port = "not-a-port".into();
        assert!(settings.validate().is_err());

        let mut settings = Settings::new(Arc::new(Dummy));
        settings.threads = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::new(Arc::new(Dummy));
        settings.task_queue_capacity = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn builder_round_trip() {
        let settings = SettingsBuilder::new(Arc::new(Dummy))
            .port("9001")
            .address("127.0.0.1")
            .threads(4)
            .timeout(30)
            .busy_msg(&b"busy\n"[..])
            .build()
            .unwrap();
        assert_eq!(settings.port, "9001");
        assert_eq!(settings.address.as_deref(), Some("127.0.0.1"));
        assert_eq!(settings.threads, 4);
        assert_eq!(settings.timeout, 30);
        assert_eq!(settings.busy_msg.as_deref(), Some(&b"busy\n"[..]));
    }

    #[test]
    fn builder_rejects_invalid() {
        assert!(SettingsBuilder::new(Arc::new(Dummy))
            .port("eighty")
            .build()
            .is_err());
    }
}
