//! Relay — the bridge between the store's port protocol and the page bus.
//!
//! The relay owns no flag state. It owns the single `PortConnection`,
//! buffers inbound frames until the page agent signals ready, republishes
//! store frames as window messages, and forwards the agent's queries and
//! toggle requests store-ward. It tolerates the store or the page coming up
//! in any order relative to its own startup.

pub mod connection;
pub mod queue;

use std::collections::VecDeque;

use crate::transport::PortDialer;
use crate::types::protocol::{PortFrame, WindowMessage};
use connection::PortConnection;
use queue::MessageQueue;

/// Store-ward flag mutation capability. In production this sends a one-shot
/// `SetFlag` command to the daemon; in a session it writes the store directly.
pub trait FlagWriter {
    /// Returns `false` when the write could not be forwarded; the poll-based
    /// convergence loop absorbs the loss.
    fn write_flag(&mut self, key: &str, value: bool) -> bool;
}

pub struct Relay {
    connection: PortConnection,
    queue: MessageQueue,
    dialer: Box<dyn PortDialer>,
    writer: Box<dyn FlagWriter>,
    agent_ready: bool,
    /// Live frames received after readiness, delivered on the next poll turn
    /// so delivery stays decoupled from the receiving turn.
    deferred: VecDeque<PortFrame>,
}

impl Relay {
    pub fn new(
        dialer: Box<dyn PortDialer>,
        writer: Box<dyn FlagWriter>,
        reconnect_delay_ms: u64,
    ) -> Self {
        Relay {
            connection: PortConnection::new(reconnect_delay_ms),
            queue: MessageQueue::new(),
            dialer,
            writer,
            agent_ready: false,
            deferred: VecDeque::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Identity of the current connection (bumps on every reconnect).
    pub fn generation(&self) -> u64 {
        self.connection.generation()
    }

    /// Forward a frame to the store. `false` when no live connection exists;
    /// the caller retries later.
    pub fn send(&mut self, frame: &PortFrame, now_ms: u64) -> bool {
        self.connection.send(frame, now_ms)
    }

    /// One turn of the relay loop: advance the reconnect schedule, hand out
    /// messages deferred from the previous turn, then pull inbound frames —
    /// buffering them while the agent is not ready, deferring them otherwise.
    pub fn poll(&mut self, now_ms: u64) -> Vec<WindowMessage> {
        if self.connection.tick(self.dialer.as_ref(), now_ms) {
            // Fresh connection: the inbound handler is registered once per
            // connection lifetime.
            self.connection.register_listener();
        }

        let mut out = Vec::new();
        for frame in self.deferred.drain(..) {
            out.extend(frame.to_window_messages());
        }

        while let Some(frame) = self.connection.try_recv(now_ms) {
            if self.agent_ready {
                self.deferred.push_back(frame);
            } else {
                self.queue.push(frame);
            }
        }
        out
    }

    /// Handle one message from the page bus.
    pub fn handle_window_message(&mut self, msg: &WindowMessage, now_ms: u64) -> Vec<WindowMessage> {
        match msg {
            WindowMessage::AgentReady => self.mark_agent_ready(),
            WindowMessage::FlagQuery { key } => {
                // Best effort: a dropped query is reissued by the agent's
                // poll cycle.
                self.send(&PortFrame::query(key), now_ms);
                Vec::new()
            }
            WindowMessage::ToggleRequest { key, value } => {
                self.writer.write_flag(key, *value);
                vec![WindowMessage::ToggleReceived { key: key.clone() }]
            }
            _ => Vec::new(),
        }
    }

    /// The page agent signaled readiness: drain the buffer (newest first)
    /// through the dispatch path. Idempotent — the queue is never reused.
    pub fn mark_agent_ready(&mut self) -> Vec<WindowMessage> {
        if self.agent_ready {
            return Vec::new();
        }
        self.agent_ready = true;
        let mut out = Vec::new();
        for frame in self.queue.drain() {
            out.extend(frame.to_window_messages());
        }
        out
    }

    pub fn agent_ready(&self) -> bool {
        self.agent_ready
    }

    pub fn buffered_len(&self) -> usize {
        self.queue.len()
    }
}
