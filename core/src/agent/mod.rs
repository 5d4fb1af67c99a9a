//! Page agent — the consumer of synchronized flags inside the page context.
//!
//! Owns one `StateController` per tracked flag plus the `CallbackRegistry`
//! that fans inbound window messages out to ad-hoc listeners. The agent
//! never talks to the store directly; everything goes through the relay's
//! window bus.

pub mod controller;
pub mod registry;

use crate::types::protocol::WindowMessage;
use controller::{ApplyFn, StateController};
use registry::CallbackRegistry;

pub struct PageAgent {
    controllers: Vec<StateController>,
    registry: CallbackRegistry,
    ready_announced: bool,
}

impl PageAgent {
    pub fn new() -> Self {
        PageAgent {
            controllers: Vec::new(),
            registry: CallbackRegistry::new(),
            ready_announced: false,
        }
    }

    /// Start converging on a flag. `apply` is the visual side effect; it
    /// returns `false` to reject a value and have it retried next cycle.
    pub fn track_flag(&mut self, key: &str, apply: ApplyFn, now_ms: u64) {
        self.controllers.push(StateController::new(key, apply, now_ms));
    }

    /// Ad-hoc listener registration, for page features that want raw
    /// messages rather than a converged flag.
    pub fn registry(&mut self) -> &mut CallbackRegistry {
        &mut self.registry
    }

    /// The readiness signal for the relay. Emitted once; the relay responds
    /// by draining its buffered messages through us.
    pub fn announce_ready(&mut self) -> Option<WindowMessage> {
        if self.ready_announced {
            return None;
        }
        self.ready_announced = true;
        Some(WindowMessage::AgentReady)
    }

    /// Queries that are due this turn, across all controllers.
    pub fn tick(&mut self, now_ms: u64) -> Vec<WindowMessage> {
        self.controllers
            .iter_mut()
            .filter_map(|ctrl| ctrl.tick(now_ms))
            .collect()
    }

    /// Handle one inbound window message: fan out to the registry, then
    /// route authoritative values to the matching controllers.
    pub fn on_window_message(&mut self, msg: &WindowMessage, now_ms: u64) {
        self.registry.dispatch(msg);
        match msg {
            WindowMessage::FlagState { key, value } => {
                self.route_reply(key, *value, now_ms);
            }
            WindowMessage::StorageSnapshot { entries } => {
                for (key, value) in entries {
                    self.route_reply(key, *value, now_ms);
                }
            }
            _ => {}
        }
    }

    /// A user-initiated flag change, to be handed to the relay.
    pub fn request_toggle(&self, key: &str, value: bool) -> WindowMessage {
        WindowMessage::ToggleRequest {
            key: key.to_string(),
            value,
        }
    }

    pub fn controller(&self, key: &str) -> Option<&StateController> {
        self.controllers.iter().find(|ctrl| ctrl.key() == key)
    }

    fn route_reply(&mut self, key: &str, value: bool, now_ms: u64) {
        for ctrl in &mut self.controllers {
            if ctrl.key() == key {
                ctrl.on_reply(value, now_ms);
            }
        }
    }
}

impl Default for PageAgent {
    fn default() -> Self {
        PageAgent::new()
    }
}
