//! Unix domain socket service for the store daemon.
//!
//! Accepts one connection at a time, reads a length-prefixed JSON command,
//! executes it against the flag store, and writes back a length-prefixed
//! JSON response.
//!
//! `Port` commands are intercepted at this layer: the stream is upgraded
//! into a long-lived relay port and moved into the `PortRegistry` instead of
//! getting a response.

use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::command::Command;
use crate::store::registry::PortRegistry;
use crate::store::FlagStore;
use crate::transport::{read_json_frame, write_json_frame, SocketPort};
use crate::types::protocol::Response;

pub struct ServiceSocket {
    listener: UnixListener,
    path: PathBuf,
    shutdown_requested: std::cell::Cell<bool>,
}

/// Result of handling a single connection.
enum HandleResult {
    /// A regular command was dispatched against the store.
    Dispatched,
    /// A Port command was received — the stream was moved to the registry.
    Upgraded,
    /// A DaemonStop command was received — the response was sent, the
    /// daemon should shut down.
    Shutdown,
}

impl ServiceSocket {
    /// Bind a new Unix domain socket at the given path.
    /// Removes any stale socket file first.
    pub fn bind(path: &Path) -> Result<ServiceSocket, String> {
        if path.exists() {
            std::fs::remove_file(path)
                .map_err(|e| format!("Cannot remove stale socket {}: {}", path.display(), e))?;
        }
        let listener = UnixListener::bind(path)
            .map_err(|e| format!("Cannot bind socket {}: {}", path.display(), e))?;
        Ok(ServiceSocket {
            listener,
            path: path.to_path_buf(),
            shutdown_requested: std::cell::Cell::new(false),
        })
    }

    /// Start the service: bind the socket in the config directory.
    pub fn start(config_dir: &Path) -> Result<ServiceSocket, String> {
        let sock_path = config_dir.join("uisync.sock");
        ServiceSocket::bind(&sock_path)
    }

    /// Accept connections with a poll timeout so the caller can interleave
    /// other work (pumping ports, ticking liveness).
    ///
    /// Returns `Ok(true)` if a command was handled, `Ok(false)` if the
    /// timeout elapsed with no incoming connection.
    pub fn accept_nonblocking(
        &self,
        store: &mut FlagStore,
        ports: &mut PortRegistry,
        timeout_ms: u64,
    ) -> Result<bool, String> {
        self.listener
            .set_nonblocking(true)
            .map_err(|e| format!("Failed to set non-blocking: {}", e))?;

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let poll_interval = Duration::from_millis(10);

        let result = loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    let _ = self.listener.set_nonblocking(false);
                    if let HandleResult::Shutdown = handle_connection(stream, store, ports)? {
                        self.shutdown_requested.set(true);
                    }
                    break Ok(true);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        break Ok(false);
                    }
                    std::thread::sleep(poll_interval);
                }
                Err(e) => {
                    break Err(format!("Accept failed: {}", e));
                }
            }
        };

        // Always restore blocking mode
        let _ = self.listener.set_nonblocking(false);
        result
    }

    /// Cleanup socket file without consuming self.
    pub fn shutdown_ref(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.get()
    }
}

/// Handle a single connection: read one command, dispatch or upgrade.
fn handle_connection(
    mut stream: UnixStream,
    store: &mut FlagStore,
    ports: &mut PortRegistry,
) -> Result<HandleResult, String> {
    let cmd: Command = read_json_frame(&mut stream)?;

    match cmd {
        Command::Port => {
            ports.register(Box::new(SocketPort::new(stream)));
            Ok(HandleResult::Upgraded)
        }
        Command::DaemonStop => {
            let response = Response::Ok { output: "stopping".into() };
            write_json_frame(&mut stream, &response)?;
            Ok(HandleResult::Shutdown)
        }
        cmd => {
            let response = execute(store, ports, cmd);
            write_json_frame(&mut stream, &response)?;
            Ok(HandleResult::Dispatched)
        }
    }
}

/// Execute a one-shot command against the store.
///
/// `flag.set` broadcasts the new value to every registered port in the same
/// turn, before the response goes back to the caller.
pub fn execute(store: &mut FlagStore, ports: &mut PortRegistry, cmd: Command) -> Response {
    match cmd {
        Command::FlagGet { key } => match store.get_flag(&key) {
            Some(value) => Response::Ok {
                output: format!("{} = {}", key, on_off(value)),
            },
            None => Response::Error {
                message: format!("unknown flag: {}", key),
            },
        },
        Command::FlagSet { key, value } => match store.set_flag(&key, value) {
            Some(frame) => {
                ports.broadcast(&frame);
                Response::Ok {
                    output: format!("{} = {}", key, on_off(frame.entries[&key])),
                }
            }
            // Absent value: dropped silently, still a success for the caller.
            None => Response::Ok { output: String::new() },
        },
        Command::FlagList => {
            let lines: Vec<String> = store
                .snapshot()
                .iter()
                .map(|(key, value)| {
                    let default = store
                        .flag(key)
                        .map(|f| f.default_value)
                        .unwrap_or(*value);
                    format!("{} = {} [default {}]", key, on_off(*value), on_off(default))
                })
                .collect();
            Response::Ok { output: lines.join("\n") }
        }
        Command::Status => Response::Ok {
            output: format!(
                "flags: {}, ports: {}, storage errors: {}",
                store.flag_count(),
                ports.len(),
                store.storage_errors()
            ),
        },
        Command::DaemonRun => Response::Error {
            message: "daemon.run is handled by the CLI, not the socket".into(),
        },
        Command::Port | Command::DaemonStop => Response::Error {
            message: "handled at the connection layer".into(),
        },
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}
