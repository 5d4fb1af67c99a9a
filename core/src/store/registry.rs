//! Registry of live relay ports on the store side.
//!
//! The daemon moves every upgraded port connection in here. The registry
//! answers inbound queries, fans out flag-change broadcasts, drives the
//! per-connection liveness cadence, and prunes ports whose transport died.
//! A dead port is simply dropped; reconnecting is the relay's job.

use super::{FlagStore, LivenessClock};
use crate::transport::Port;
use crate::types::protocol::PortFrame;

struct PortEntry {
    id: u64,
    port: Box<dyn Port>,
    liveness: LivenessClock,
    snapshot_sent: bool,
}

pub struct PortRegistry {
    entries: Vec<PortEntry>,
    next_id: u64,
    liveness_interval_ms: u64,
}

impl PortRegistry {
    pub fn new(liveness_interval_ms: u64) -> Self {
        PortRegistry {
            entries: Vec::new(),
            next_id: 1,
            liveness_interval_ms,
        }
    }

    /// Adopt a freshly upgraded port connection. Returns its id.
    pub fn register(&mut self, port: Box<dyn Port>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(PortEntry {
            id,
            port,
            liveness: LivenessClock::new(self.liveness_interval_ms),
            snapshot_sent: false,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain inbound frames from every port and answer queries with the
    /// store's authoritative values. Returns the number of replies sent.
    pub fn pump(&mut self, store: &FlagStore) -> usize {
        let mut replies = 0;
        let mut dead: Vec<u64> = Vec::new();
        for entry in &mut self.entries {
            loop {
                match entry.port.try_recv() {
                    Ok(Some(frame)) => {
                        if let Some(reply) = store.handle_frame(&frame) {
                            if entry.port.send(&reply).is_err() {
                                dead.push(entry.id);
                                break;
                            }
                            replies += 1;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        dead.push(entry.id);
                        break;
                    }
                }
            }
        }
        self.prune(&dead);
        replies
    }

    /// Send one frame to every live port. Returns how many ports got it.
    pub fn broadcast(&mut self, frame: &PortFrame) -> usize {
        let mut sent = 0;
        let mut dead: Vec<u64> = Vec::new();
        for entry in &mut self.entries {
            match entry.port.send(frame) {
                Ok(()) => sent += 1,
                Err(_) => dead.push(entry.id),
            }
        }
        self.prune(&dead);
        sent
    }

    /// Drive the per-connection liveness broadcast and the one-time initial
    /// snapshot. Nothing happens until the store finishes initializing.
    pub fn tick(&mut self, store: &FlagStore, now_ms: u64) -> usize {
        if !store.init_complete() {
            return 0;
        }
        let mut sent = 0;
        let mut dead: Vec<u64> = Vec::new();
        for entry in &mut self.entries {
            if !entry.snapshot_sent {
                let snapshot = PortFrame {
                    entries: store.snapshot(),
                };
                if entry.port.send(&snapshot).is_err() {
                    dead.push(entry.id);
                    continue;
                }
                entry.snapshot_sent = true;
                sent += 1;
            }
            entry.liveness.start(now_ms);
            if entry.liveness.tick(now_ms) {
                if entry.port.send(&PortFrame::liveness()).is_err() {
                    dead.push(entry.id);
                    continue;
                }
                sent += 1;
            }
        }
        self.prune(&dead);
        sent
    }

    fn prune(&mut self, dead: &[u64]) {
        if !dead.is_empty() {
            self.entries.retain(|entry| !dead.contains(&entry.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::storage::MemoryStorage;
    use crate::transport::{loopback_pair, LoopbackPort, Port as _};
    use crate::types::flag::THEME_ENABLED;

    fn store() -> FlagStore {
        let mut store = FlagStore::new(Box::new(MemoryStorage::new()));
        store.init_all([]);
        store
    }

    fn registered() -> (PortRegistry, LoopbackPort) {
        let mut registry = PortRegistry::new(1000);
        let (store_side, relay_side) = loopback_pair();
        registry.register(Box::new(store_side));
        (registry, relay_side)
    }

    #[test]
    fn pump_answers_queries() {
        let store = store();
        let (mut registry, mut relay) = registered();

        relay.send(&PortFrame::query(THEME_ENABLED)).unwrap();
        assert_eq!(registry.pump(&store), 1);
        assert_eq!(
            relay.try_recv().unwrap(),
            Some(PortFrame::reply(THEME_ENABLED, true))
        );
    }

    #[test]
    fn repeated_queries_get_repeated_identical_replies() {
        let store = store();
        let (mut registry, mut relay) = registered();

        for _ in 0..3 {
            relay.send(&PortFrame::query(THEME_ENABLED)).unwrap();
        }
        assert_eq!(registry.pump(&store), 3);
        for _ in 0..3 {
            assert_eq!(
                relay.try_recv().unwrap(),
                Some(PortFrame::reply(THEME_ENABLED, true))
            );
        }
    }

    #[test]
    fn broadcast_reaches_every_port() {
        let mut registry = PortRegistry::new(1000);
        let (store_a, mut relay_a) = loopback_pair();
        let (store_b, mut relay_b) = loopback_pair();
        registry.register(Box::new(store_a));
        registry.register(Box::new(store_b));

        let frame = PortFrame::reply(THEME_ENABLED, false);
        assert_eq!(registry.broadcast(&frame), 2);
        assert_eq!(relay_a.try_recv().unwrap(), Some(frame.clone()));
        assert_eq!(relay_b.try_recv().unwrap(), Some(frame));
    }

    #[test]
    fn dead_ports_are_pruned() {
        let store = store();
        let (mut registry, relay) = registered();
        assert_eq!(registry.len(), 1);

        relay.close();
        registry.pump(&store);
        assert!(registry.is_empty());
    }

    #[test]
    fn tick_sends_snapshot_then_liveness() {
        let store = store();
        let (mut registry, mut relay) = registered();

        // First tick after init: the initial snapshot goes out, liveness is armed.
        registry.tick(&store, 0);
        let snapshot = relay.try_recv().unwrap().unwrap();
        assert_eq!(snapshot.entries.len(), store.flag_count());
        assert_eq!(relay.try_recv().unwrap(), None);

        // Liveness fires once per period.
        registry.tick(&store, 500);
        assert_eq!(relay.try_recv().unwrap(), None);
        registry.tick(&store, 1000);
        assert_eq!(relay.try_recv().unwrap(), Some(PortFrame::liveness()));
        registry.tick(&store, 1400);
        assert_eq!(relay.try_recv().unwrap(), None);
        registry.tick(&store, 2000);
        assert_eq!(relay.try_recv().unwrap(), Some(PortFrame::liveness()));
    }

    #[test]
    fn tick_waits_for_init_complete() {
        let store = FlagStore::new(Box::new(MemoryStorage::new()));
        let (mut registry, mut relay) = registered();
        assert_eq!(registry.tick(&store, 0), 0);
        assert_eq!(relay.try_recv().unwrap(), None);
    }
}
