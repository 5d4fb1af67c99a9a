//! Session — all four roles wired together in one process.
//!
//! A session hosts a flag store, its port registry, a relay, and a page
//! agent over loopback ports, driven by a manual clock. It is the harness
//! for exercising the full synchronization pipeline deterministically:
//! embedding hosts and tests advance it with `step()` instead of waiting on
//! wall-clock timers.

use std::cell::RefCell;
use std::rc::Rc;

use crate::agent::controller::ApplyFn;
use crate::agent::PageAgent;
use crate::relay::{FlagWriter, Relay};
use crate::store::registry::PortRegistry;
use crate::store::storage::Storage;
use crate::store::FlagStore;
use crate::transport::{LoopbackHub, PortKillSwitch};
use crate::types::config::{LIVENESS_INTERVAL_MS, RECONNECT_DELAY_MS};
use crate::types::protocol::WindowMessage;

/// Writes flags straight into the shared store and broadcasts the resulting
/// frame, standing in for the daemon command path.
struct StoreWriter {
    store: Rc<RefCell<FlagStore>>,
    ports: Rc<RefCell<PortRegistry>>,
}

impl FlagWriter for StoreWriter {
    fn write_flag(&mut self, key: &str, value: bool) -> bool {
        match self.store.borrow_mut().set_flag(key, Some(value)) {
            Some(frame) => {
                self.ports.borrow_mut().broadcast(&frame);
                true
            }
            None => false,
        }
    }
}

pub struct Session {
    store: Rc<RefCell<FlagStore>>,
    ports: Rc<RefCell<PortRegistry>>,
    hub: LoopbackHub,
    relay: Relay,
    agent: PageAgent,
    now_ms: u64,
    /// Close handles for adopted store-side ports, newest last.
    links: Vec<PortKillSwitch>,
}

impl Session {
    /// Build a session over the given storage. Flags are initialized
    /// immediately, so the store starts ready to answer queries.
    pub fn new(storage: Box<dyn Storage>) -> Self {
        let mut store = FlagStore::new(storage);
        store.init_all(std::iter::empty());

        let store = Rc::new(RefCell::new(store));
        let ports = Rc::new(RefCell::new(PortRegistry::new(LIVENESS_INTERVAL_MS)));
        let hub = LoopbackHub::new();

        let writer = StoreWriter {
            store: store.clone(),
            ports: ports.clone(),
        };
        let relay = Relay::new(Box::new(hub.clone()), Box::new(writer), RECONNECT_DELAY_MS);

        Session {
            store,
            ports,
            hub,
            relay,
            agent: PageAgent::new(),
            now_ms: 0,
            links: Vec::new(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn is_connected(&self) -> bool {
        self.relay.is_connected()
    }

    /// Current store-side value of a flag.
    pub fn flag(&self, key: &str) -> Option<bool> {
        self.store.borrow().get_flag(key)
    }

    /// Last value the page side applied for a flag.
    pub fn applied(&self, key: &str) -> Option<bool> {
        self.agent.controller(key).and_then(|c| c.last_applied())
    }

    /// Register a page-side side effect for a flag. The controller starts
    /// querying on the next step.
    pub fn track_flag(&mut self, key: &str, apply: ApplyFn) {
        self.agent.track_flag(key, apply, self.now_ms);
    }

    /// Register a page-side listener for every bus message.
    pub fn on_message(
        &mut self,
        callback: Box<dyn FnMut(&WindowMessage)>,
        run_once: bool,
    ) -> u64 {
        self.agent.registry().register(callback, run_once)
    }

    /// Mutate a flag through the store path, as the transient UI does.
    /// An undefined value is dropped without effect.
    pub fn set_flag(&mut self, key: &str, value: Option<bool>) {
        if let Some(frame) = self.store.borrow_mut().set_flag(key, value) {
            self.ports.borrow_mut().broadcast(&frame);
        }
    }

    /// Issue a toggle request from the page side.
    pub fn request_toggle(&mut self, key: &str, value: bool) {
        let msg = self.agent.request_toggle(key, value);
        self.route_to_relay(msg);
    }

    /// Sever the store side of the current connection, as a store restart
    /// would. The relay notices on its next receive and backs off.
    pub fn drop_store_links(&mut self) {
        for link in self.links.drain(..) {
            link.kill();
        }
    }

    /// Advance the clock by `dt_ms` and run one turn of every role.
    pub fn step(&mut self, dt_ms: u64) {
        self.now_ms += dt_ms;
        let now = self.now_ms;

        // Store side adopts ports dialed since the last turn.
        for port in self.hub.take_new_ports() {
            self.links.push(port.kill_switch());
            self.ports.borrow_mut().register(Box::new(port));
        }

        // Relay turn: reconnect schedule plus deliveries deferred from the
        // previous turn.
        for msg in self.relay.poll(now) {
            self.agent.on_window_message(&msg, now);
        }

        // Agent turn: the one-time ready announcement, then due queries.
        if let Some(ready) = self.agent.announce_ready() {
            self.route_to_relay(ready);
        }
        for msg in self.agent.tick(now) {
            self.route_to_relay(msg);
        }

        // Store turn: answer queries, send snapshots and liveness.
        {
            let store = self.store.borrow();
            let mut ports = self.ports.borrow_mut();
            ports.pump(&store);
            ports.tick(&store, now);
        }
    }

    /// Run `count` steps of `dt_ms` each.
    pub fn run(&mut self, count: u32, dt_ms: u64) {
        for _ in 0..count {
            self.step(dt_ms);
        }
    }

    fn route_to_relay(&mut self, msg: WindowMessage) {
        let now = self.now_ms;
        for response in self.relay.handle_window_message(&msg, now) {
            self.agent.on_window_message(&response, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::storage::MemoryStorage;
    use crate::types::flag::{MENU_ANIMATIONS_ENABLED, THEME_ENABLED};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn session() -> Session {
        Session::new(Box::new(MemoryStorage::new()))
    }

    /// Records every value handed to the side effect.
    fn recording_apply(log: &Rc<RefCell<Vec<bool>>>) -> ApplyFn {
        let log = log.clone();
        Box::new(move |value| {
            log.borrow_mut().push(value);
            true
        })
    }

    #[test]
    fn page_converges_to_store_state() {
        let mut session = session();
        let log = Rc::new(RefCell::new(Vec::new()));
        session.track_flag(THEME_ENABLED, recording_apply(&log));

        session.run(5, 50);

        assert_eq!(session.applied(THEME_ENABLED), Some(true));
        assert_eq!(log.borrow().as_slice(), &[true]);
    }

    #[test]
    fn store_toggle_reaches_the_page_within_the_poll_window() {
        let mut session = session();
        let log = Rc::new(RefCell::new(Vec::new()));
        session.track_flag(THEME_ENABLED, recording_apply(&log));
        session.run(5, 50);
        assert_eq!(session.applied(THEME_ENABLED), Some(true));

        let toggled_at = session.now_ms();
        session.set_flag(THEME_ENABLED, Some(false));
        // Settled recheck (300ms) plus delivery lag bounds this at 400ms.
        session.run(8, 50);

        assert_eq!(session.applied(THEME_ENABLED), Some(false));
        assert_eq!(log.borrow().as_slice(), &[true, false]);
        assert!(session.now_ms() - toggled_at <= 400);
    }

    #[test]
    fn undefined_value_is_dropped_silently() {
        let mut session = session();
        let log = Rc::new(RefCell::new(Vec::new()));
        session.track_flag(THEME_ENABLED, recording_apply(&log));
        session.run(5, 50);

        session.set_flag(THEME_ENABLED, None);
        session.run(8, 50);

        assert_eq!(session.flag(THEME_ENABLED), Some(true));
        assert_eq!(log.borrow().as_slice(), &[true]);
    }

    #[test]
    fn page_toggle_round_trips_through_the_store() {
        let mut session = session();
        let log = Rc::new(RefCell::new(Vec::new()));
        session.track_flag(MENU_ANIMATIONS_ENABLED, recording_apply(&log));
        session.run(5, 50);
        assert_eq!(session.applied(MENU_ANIMATIONS_ENABLED), Some(false));

        session.request_toggle(MENU_ANIMATIONS_ENABLED, true);
        assert_eq!(session.flag(MENU_ANIMATIONS_ENABLED), Some(true));

        session.run(8, 50);
        assert_eq!(session.applied(MENU_ANIMATIONS_ENABLED), Some(true));
        assert_eq!(log.borrow().as_slice(), &[false, true]);
    }

    #[test]
    fn toggle_ack_reaches_listeners() {
        let mut session = session();
        let acks = Rc::new(RefCell::new(Vec::new()));
        let sink = acks.clone();
        session.on_message(
            Box::new(move |msg| {
                if let WindowMessage::ToggleReceived { key } = msg {
                    sink.borrow_mut().push(key.clone());
                }
            }),
            false,
        );
        session.step(50);

        session.request_toggle(THEME_ENABLED, false);
        assert_eq!(acks.borrow().as_slice(), &[THEME_ENABLED.to_string()]);
    }

    #[test]
    fn run_once_listener_fires_for_a_single_message() {
        let mut session = session();
        let hits = Rc::new(RefCell::new(0u32));
        let sink = hits.clone();
        session.on_message(
            Box::new(move |_| {
                *sink.borrow_mut() += 1;
            }),
            true,
        );

        // Liveness and snapshot traffic produces several messages; the
        // listener must only see the first.
        session.run(30, 50);
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn liveness_broadcast_is_periodic() {
        let mut session = session();
        let alive = Rc::new(RefCell::new(0u32));
        let sink = alive.clone();
        session.on_message(
            Box::new(move |msg| {
                if matches!(msg, WindowMessage::StoreAlive) {
                    *sink.borrow_mut() += 1;
                }
            }),
            false,
        );

        // 3 seconds of session time at a 1000ms liveness interval.
        session.run(60, 50);
        let count = *alive.borrow();
        assert!((2..=4).contains(&count), "got {} liveness messages", count);
    }

    #[test]
    fn relay_reconnects_after_store_restart() {
        let mut session = session();
        let log = Rc::new(RefCell::new(Vec::new()));
        session.track_flag(THEME_ENABLED, recording_apply(&log));
        session.run(5, 50);
        assert!(session.is_connected());

        session.drop_store_links();
        // A toggle while disconnected still lands in the store; the frame
        // broadcast is lost with the dead port.
        session.set_flag(THEME_ENABLED, Some(false));
        session.step(50);
        assert!(!session.is_connected());

        // The relay holds a fixed 1000ms backoff before redialing.
        session.run(19, 50);
        assert!(!session.is_connected());
        session.step(50);
        assert!(session.is_connected());

        // The agent's poll cycle recovers the missed update.
        session.run(10, 50);
        assert_eq!(session.applied(THEME_ENABLED), Some(false));
    }

    #[test]
    fn repeated_queries_are_idempotent() {
        let mut session = session();
        let log = Rc::new(RefCell::new(Vec::new()));
        session.track_flag(THEME_ENABLED, recording_apply(&log));

        // Long quiet run: the settled recheck keeps querying but the side
        // effect only ever fires on change.
        session.run(60, 50);
        assert_eq!(log.borrow().as_slice(), &[true]);
    }

    #[test]
    fn snapshot_covers_untracked_flags() {
        let mut session = session();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        session.on_message(
            Box::new(move |msg| {
                if let WindowMessage::StorageSnapshot { entries } = msg {
                    sink.borrow_mut().push(entries.clone());
                }
            }),
            false,
        );

        session.run(6, 50);
        let snapshots = seen.borrow();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].get(THEME_ENABLED), Some(&true));
        assert_eq!(snapshots[0].get(MENU_ANIMATIONS_ENABLED), Some(&false));
    }
}
