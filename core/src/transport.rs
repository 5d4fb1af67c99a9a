//! Port transports between a relay and the store daemon.
//!
//! The relay logic is written against the `Port` capability trait so the
//! same state machines run over a unix-domain socket in production and over
//! an in-memory loopback pair in tests and the single-process session.
//!
//! Wire format on sockets: 4 bytes big-endian length, then that many bytes
//! of JSON — the same framing the command service uses.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::command::Command;
use crate::types::protocol::PortFrame;

/// Upper bound on a single frame, matching the command service.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// A live, bidirectional frame channel. Any error means the channel is dead
/// and must be replaced by a fresh dial.
pub trait Port: Send {
    fn send(&mut self, frame: &PortFrame) -> Result<(), String>;

    /// Non-blocking receive: `Ok(None)` when no complete frame is waiting.
    fn try_recv(&mut self) -> Result<Option<PortFrame>, String>;
}

/// Establishes new port connections. Injected into the relay so connection
/// logic never reaches for a transport by name.
pub trait PortDialer {
    fn dial(&self) -> Result<Box<dyn Port>, String>;
}

// ---------------------------------------------------------------------------
// Frame codec (blocking, for the command service and client)
// ---------------------------------------------------------------------------

/// Write a length-prefixed JSON frame.
pub fn write_json_frame<T: Serialize>(stream: &mut impl Write, value: &T) -> Result<(), String> {
    let json = serde_json::to_vec(value).map_err(|e| format!("Failed to serialize frame: {}", e))?;
    let len = json.len() as u32;
    stream
        .write_all(&len.to_be_bytes())
        .map_err(|e| format!("Failed to write frame length: {}", e))?;
    stream
        .write_all(&json)
        .map_err(|e| format!("Failed to write frame payload: {}", e))?;
    stream.flush().map_err(|e| format!("Failed to flush: {}", e))?;
    Ok(())
}

/// Read a length-prefixed JSON frame, blocking until complete.
pub fn read_json_frame<T: DeserializeOwned>(stream: &mut impl Read) -> Result<T, String> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .map_err(|e| format!("Failed to read frame length: {}", e))?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len == 0 {
        return Err("Empty frame".into());
    }
    if len > MAX_FRAME_BYTES {
        return Err(format!("Frame too large: {} bytes", len));
    }

    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .map_err(|e| format!("Failed to read frame payload: {}", e))?;

    serde_json::from_slice(&payload).map_err(|e| format!("Failed to parse frame JSON: {}", e))
}

// ---------------------------------------------------------------------------
// LoopbackPort
// ---------------------------------------------------------------------------

/// In-memory port: two paired endpoints over shared queues. Closing either
/// endpoint kills both directions, like a dropped socket.
pub struct LoopbackPort {
    inbox: Arc<Mutex<VecDeque<PortFrame>>>,
    peer_inbox: Arc<Mutex<VecDeque<PortFrame>>>,
    closed: Arc<AtomicBool>,
}

/// Create a connected pair of loopback ports.
pub fn loopback_pair() -> (LoopbackPort, LoopbackPort) {
    let a_inbox = Arc::new(Mutex::new(VecDeque::new()));
    let b_inbox = Arc::new(Mutex::new(VecDeque::new()));
    let closed = Arc::new(AtomicBool::new(false));
    let a = LoopbackPort {
        inbox: a_inbox.clone(),
        peer_inbox: b_inbox.clone(),
        closed: closed.clone(),
    };
    let b = LoopbackPort {
        inbox: b_inbox,
        peer_inbox: a_inbox,
        closed,
    };
    (a, b)
}

impl LoopbackPort {
    /// Simulate a connection loss.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Handle that can still close the pair after the port has been moved
    /// into a registry.
    pub fn kill_switch(&self) -> PortKillSwitch {
        PortKillSwitch {
            closed: self.closed.clone(),
        }
    }
}

/// Detached close handle for a loopback pair.
#[derive(Clone)]
pub struct PortKillSwitch {
    closed: Arc<AtomicBool>,
}

impl PortKillSwitch {
    pub fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Port for LoopbackPort {
    fn send(&mut self, frame: &PortFrame) -> Result<(), String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err("port closed".into());
        }
        self.peer_inbox.lock().unwrap().push_back(frame.clone());
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<PortFrame>, String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err("port closed".into());
        }
        Ok(self.inbox.lock().unwrap().pop_front())
    }
}

// ---------------------------------------------------------------------------
// LoopbackHub
// ---------------------------------------------------------------------------

/// Dialer for in-process wiring: every dial creates a fresh loopback pair
/// and parks the store-side endpoint for the host to adopt.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    pending: Arc<Mutex<Vec<LoopbackPort>>>,
    refuse: Arc<AtomicBool>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        LoopbackHub::default()
    }

    /// Store-side endpoints created since the last call.
    pub fn take_new_ports(&self) -> Vec<LoopbackPort> {
        self.pending.lock().unwrap().drain(..).collect()
    }

    /// Make subsequent dials fail, simulating a store that is down.
    pub fn set_refuse_dials(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl PortDialer for LoopbackHub {
    fn dial(&self) -> Result<Box<dyn Port>, String> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err("store not reachable".into());
        }
        let (store_side, relay_side) = loopback_pair();
        self.pending.lock().unwrap().push(store_side);
        Ok(Box::new(relay_side))
    }
}

// ---------------------------------------------------------------------------
// SocketPort
// ---------------------------------------------------------------------------

/// Port over a framed unix-domain socket. Reads are non-blocking with an
/// internal reassembly buffer; writes are blocking.
pub struct SocketPort {
    stream: UnixStream,
    buf: Vec<u8>,
}

impl SocketPort {
    pub fn new(stream: UnixStream) -> Self {
        SocketPort {
            stream,
            buf: Vec::new(),
        }
    }

    fn fill_buffer(&mut self) -> Result<(), String> {
        self.stream
            .set_nonblocking(true)
            .map_err(|e| format!("Failed to set non-blocking: {}", e))?;
        let mut tmp = [0u8; 4096];
        loop {
            match self.stream.read(&mut tmp) {
                Ok(0) => return Err("peer closed the port".into()),
                Ok(n) => self.buf.extend_from_slice(&tmp[..n]),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(format!("Port read failed: {}", e)),
            }
        }
    }

    fn take_frame(&mut self) -> Result<Option<PortFrame>, String> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len == 0 {
            return Err("Empty frame".into());
        }
        if len > MAX_FRAME_BYTES {
            return Err(format!("Frame too large: {} bytes", len));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let raw: Vec<u8> = self.buf.drain(..4 + len).collect();
        serde_json::from_slice(&raw[4..])
            .map(Some)
            .map_err(|e| format!("Failed to parse port frame: {}", e))
    }
}

impl Port for SocketPort {
    fn send(&mut self, frame: &PortFrame) -> Result<(), String> {
        self.stream
            .set_nonblocking(false)
            .map_err(|e| format!("Failed to set blocking: {}", e))?;
        write_json_frame(&mut self.stream, frame)
    }

    fn try_recv(&mut self) -> Result<Option<PortFrame>, String> {
        self.fill_buffer()?;
        self.take_frame()
    }
}

// ---------------------------------------------------------------------------
// SocketDialer
// ---------------------------------------------------------------------------

/// Dials the daemon socket and upgrades the connection into a relay port by
/// sending the `Port` command first.
pub struct SocketDialer {
    socket_path: PathBuf,
}

impl SocketDialer {
    pub fn new(socket_path: &Path) -> Self {
        SocketDialer {
            socket_path: socket_path.to_path_buf(),
        }
    }
}

impl PortDialer for SocketDialer {
    fn dial(&self) -> Result<Box<dyn Port>, String> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .map_err(|e| format!("Cannot connect to {}: {}", self.socket_path.display(), e))?;
        write_json_frame(&mut stream, &Command::Port)?;
        Ok(Box::new(SocketPort::new(stream)))
    }
}
