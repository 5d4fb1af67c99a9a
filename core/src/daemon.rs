//! Daemon — the uisync main event loop.
//!
//! The daemon is single-threaded for state mutation. All flag updates flow
//! through the main loop: one-shot socket commands, relay port traffic, and
//! internal events sent over an mpsc channel by other threads. The main loop
//! is the single consumer.
//!
//! # Main loop tick
//!
//! 1. Drain channel — apply each pending event
//! 2. Accept socket connections (non-blocking with timeout)
//! 3. Pump registered relay ports — answer queries, drop dead ports
//! 4. Tick liveness — per-port snapshot and alive broadcasts

use std::path::Path;
use std::sync::mpsc;

use crate::service::ServiceSocket;
use crate::store::registry::PortRegistry;
use crate::store::storage::{FileStorage, Storage};
use crate::store::FlagStore;
use crate::types::config::{self, Settings};

/// Events that can be sent to the daemon's main loop via the channel.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A flag mutation from an internal source.
    SetFlag {
        key: String,
        value: Option<bool>,
        /// Label for log output (e.g. "popup", "relay").
        source: String,
    },
    /// Request the daemon to shut down gracefully.
    Shutdown,
}


/// Handle for sending events to the daemon from other threads.
#[derive(Clone)]
pub struct DaemonHandle {
    sender: mpsc::Sender<DaemonEvent>,
}

impl DaemonHandle {
    /// Queue a flag mutation for execution on the main loop.
    pub fn set_flag(&self, key: &str, value: Option<bool>, source: &str) -> Result<(), String> {
        self.sender
            .send(DaemonEvent::SetFlag {
                key: key.to_string(),
                value,
                source: source.to_string(),
            })
            .map_err(|e| format!("Channel send failed: {}", e))
    }

    /// Request daemon shutdown.
    pub fn shutdown(&self) -> Result<(), String> {
        self.sender
            .send(DaemonEvent::Shutdown)
            .map_err(|e| format!("Channel send failed: {}", e))
    }
}


/// The uisync daemon: owns the flag store, the service socket, and the
/// registry of relay ports.
pub struct Daemon {
    store: FlagStore,
    service: ServiceSocket,
    ports: PortRegistry,
    receiver: mpsc::Receiver<DaemonEvent>,
    handle: DaemonHandle,
    settings: Settings,
    shutdown: bool,
}

impl Daemon {
    /// Initialize the daemon: load settings, open file storage, initialize
    /// flags, and bind the service socket.
    pub fn new(config_dir: &Path) -> Result<Daemon, String> {
        std::fs::create_dir_all(config_dir)
            .map_err(|e| format!("Cannot create {}: {}", config_dir.display(), e))?;
        let settings = config::load(&config_dir.join("settings.yaml"))?;
        let storage = FileStorage::new(&config_dir.join("flags.json"));
        Daemon::with_storage(config_dir, settings, Box::new(storage))
    }

    /// Initialize with explicit settings and storage. Tests use this with
    /// memory storage.
    pub fn with_storage(
        config_dir: &Path,
        settings: Settings,
        storage: Box<dyn Storage>,
    ) -> Result<Daemon, String> {
        let mut store = FlagStore::new(storage);
        store.init_all(
            settings
                .extra_flags
                .iter()
                .map(|f| (f.key.as_str(), f.default_value)),
        );

        let service = ServiceSocket::start(config_dir)?;
        let ports = PortRegistry::new(settings.liveness_interval_ms);
        let (sender, receiver) = mpsc::channel();

        Ok(Daemon {
            store,
            service,
            ports,
            receiver,
            handle: DaemonHandle { sender },
            settings,
            shutdown: false,
        })
    }

    /// Handle for sending events into the loop from other threads.
    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    pub fn store(&self) -> &FlagStore {
        &self.store
    }

    pub fn socket_path(&self) -> &Path {
        self.service.path()
    }

    /// Run the main loop until a shutdown is requested, then remove the
    /// socket file.
    pub fn run(&mut self) -> Result<(), String> {
        while !self.shutdown {
            self.tick()?;
        }
        self.service.shutdown_ref();
        Ok(())
    }

    /// One loop iteration. Tests drive the loop with this directly.
    pub fn tick(&mut self) -> Result<(), String> {
        self.drain_events();
        if self.shutdown {
            return Ok(());
        }

        self.service.accept_nonblocking(
            &mut self.store,
            &mut self.ports,
            self.settings.socket_poll_ms,
        )?;
        if self.service.shutdown_requested() {
            self.shutdown = true;
            return Ok(());
        }

        self.ports.pump(&self.store);
        self.ports.tick(&self.store, now_ms());
        Ok(())
    }

    /// Apply every pending channel event.
    pub fn drain_events(&mut self) {
        while let Ok(event) = self.receiver.try_recv() {
            match event {
                DaemonEvent::SetFlag { key, value, source } => {
                    if let Some(frame) = self.store.set_flag(&key, value) {
                        self.ports.broadcast(&frame);
                        eprintln!("uisync: {} set {} = {:?}", source, key, value);
                    }
                }
                DaemonEvent::Shutdown => {
                    self.shutdown = true;
                }
            }
        }
    }
}


/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::storage::MemoryStorage;
    use crate::types::config::{default_settings, ExtraFlag};
    use crate::types::flag::THEME_ENABLED;

    fn temp_config_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("uisync-daemon-test-{}", name));
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    fn daemon(name: &str) -> Daemon {
        let mut settings = default_settings();
        settings.socket_poll_ms = 1;
        Daemon::with_storage(
            &temp_config_dir(name),
            settings,
            Box::new(MemoryStorage::new()),
        )
        .unwrap()
    }

    #[test]
    fn new_daemon_initializes_flags() {
        let daemon = daemon("init");
        assert!(daemon.store().init_complete());
        assert_eq!(daemon.store().get_flag(THEME_ENABLED), Some(true));
        daemon.service.shutdown_ref();
    }

    #[test]
    fn extra_flags_from_settings_are_initialized() {
        let mut settings = default_settings();
        settings.socket_poll_ms = 1;
        settings.extra_flags.push(ExtraFlag {
            key: "sidebar-enabled".into(),
            default_value: true,
        });
        let daemon = Daemon::with_storage(
            &temp_config_dir("extra"),
            settings,
            Box::new(MemoryStorage::new()),
        )
        .unwrap();
        assert_eq!(daemon.store().get_flag("sidebar-enabled"), Some(true));
        daemon.service.shutdown_ref();
    }

    #[test]
    fn set_flag_event_is_applied() {
        let mut daemon = daemon("set-event");
        daemon
            .handle()
            .set_flag(THEME_ENABLED, Some(false), "test")
            .unwrap();
        daemon.drain_events();
        assert_eq!(daemon.store().get_flag(THEME_ENABLED), Some(false));
        daemon.service.shutdown_ref();
    }

    #[test]
    fn none_value_event_is_dropped() {
        let mut daemon = daemon("none-event");
        daemon.handle().set_flag(THEME_ENABLED, None, "test").unwrap();
        daemon.drain_events();
        assert_eq!(daemon.store().get_flag(THEME_ENABLED), Some(true));
        daemon.service.shutdown_ref();
    }

    #[test]
    fn shutdown_event_stops_the_loop() {
        let mut daemon = daemon("shutdown");
        daemon.handle().shutdown().unwrap();
        daemon.tick().unwrap();
        assert!(daemon.shutdown);
        daemon.service.shutdown_ref();
    }

    #[test]
    fn socket_dialer_upgrades_into_a_live_port() {
        use crate::transport::{Port as _, PortDialer as _, SocketDialer};
        use crate::types::protocol::PortFrame;
        use std::time::{Duration, Instant};

        let mut daemon = daemon("dialer");
        let socket_path = daemon.socket_path().to_path_buf();
        let handle = daemon.handle();
        let thread = std::thread::spawn(move || {
            daemon.run().unwrap();
        });
        std::thread::sleep(Duration::from_millis(100));

        let mut port = SocketDialer::new(&socket_path).dial().unwrap();

        // The initial snapshot covers every builtin flag.
        let snapshot = recv_flag_frame(&mut *port);
        assert_eq!(snapshot.entries.len(), 3);
        assert_eq!(snapshot.entries.get(THEME_ENABLED), Some(&true));

        // A query gets the authoritative value back.
        port.send(&PortFrame::query(THEME_ENABLED)).unwrap();
        let reply = recv_flag_frame(&mut *port);
        assert_eq!(reply, PortFrame::reply(THEME_ENABLED, true));

        handle.shutdown().unwrap();
        thread.join().unwrap();

        fn recv_flag_frame(port: &mut dyn crate::transport::Port) -> PortFrame {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                match port.try_recv().unwrap() {
                    // Liveness frames may interleave; skip them.
                    Some(frame) if !frame.is_liveness() => return frame,
                    _ => {
                        assert!(Instant::now() < deadline, "no frame within 5s");
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
            }
        }
    }
}
