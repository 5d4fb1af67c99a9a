//! Port connection lifecycle for the relay.
//!
//! `PortConnection` owns the single channel to the store and its reconnect
//! schedule. There is never more than one live port; every reconnect gets a
//! fresh generation number so stale handlers can be told apart. While
//! disconnected, sends are no-ops that report failure instead of throwing.

use crate::transport::{Port, PortDialer};

// ---------------------------------------------------------------------------
// LinkState
// ---------------------------------------------------------------------------

/// `Disconnected -> Connecting -> Connected -> Disconnected -> [delay] -> ...`
/// No terminal state; the cycle runs for the lifetime of the hosting context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// No live port. Carries the time the next dial attempt is due, or
    /// `None` when a dial should happen immediately.
    Disconnected { retry_at_ms: Option<u64> },
    /// A dial attempt is in progress.
    Connecting,
    /// The port is live.
    Connected { since_ms: u64 },
}

// ---------------------------------------------------------------------------
// PortConnection
// ---------------------------------------------------------------------------

pub struct PortConnection {
    state: LinkState,
    port: Option<Box<dyn Port>>,
    generation: u64,
    reconnect_delay_ms: u64,
    listener_registered: bool,
}

impl PortConnection {
    pub fn new(reconnect_delay_ms: u64) -> Self {
        PortConnection {
            state: LinkState::Disconnected { retry_at_ms: None },
            port: None,
            generation: 0,
            reconnect_delay_ms,
            listener_registered: false,
        }
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, LinkState::Connected { .. })
    }

    /// Identity of the current connection; bumps on every successful dial.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Guarded inbound-handler registration: `true` on the first call per
    /// connection, `false` on repeats. Reset by every reconnect.
    pub fn register_listener(&mut self) -> bool {
        if self.listener_registered {
            return false;
        }
        self.listener_registered = true;
        true
    }

    /// Advance the reconnect schedule. Dials when disconnected and the
    /// backoff delay has elapsed (or no delay is pending). Returns `true`
    /// when a new connection was established this tick.
    pub fn tick(&mut self, dialer: &dyn PortDialer, now_ms: u64) -> bool {
        let due = match self.state {
            LinkState::Disconnected { retry_at_ms: None } => true,
            LinkState::Disconnected {
                retry_at_ms: Some(at),
            } => now_ms >= at,
            _ => false,
        };
        if !due {
            return false;
        }
        self.state = LinkState::Connecting;
        match dialer.dial() {
            Ok(port) => {
                self.port = Some(port);
                self.generation += 1;
                self.listener_registered = false;
                self.state = LinkState::Connected { since_ms: now_ms };
                true
            }
            Err(_) => {
                // Dial failed; try again after the fixed delay.
                self.schedule_retry(now_ms);
                false
            }
        }
    }

    /// Forward a frame. Returns `false` immediately when no live connection
    /// exists. A transport error tears the connection down and schedules a
    /// reconnect — callers treat `false` as "retry later", never as fatal.
    pub fn send(&mut self, frame: &crate::types::protocol::PortFrame, now_ms: u64) -> bool {
        let Some(port) = self.port.as_mut() else {
            return false;
        };
        match port.send(frame) {
            Ok(()) => true,
            Err(_) => {
                self.disconnect(now_ms);
                false
            }
        }
    }

    /// Pull one inbound frame, if any. A transport error tears the
    /// connection down and schedules a reconnect.
    pub fn try_recv(&mut self, now_ms: u64) -> Option<crate::types::protocol::PortFrame> {
        let port = self.port.as_mut()?;
        match port.try_recv() {
            Ok(frame) => frame,
            Err(_) => {
                self.disconnect(now_ms);
                None
            }
        }
    }

    /// Tear down the current port (if any) and schedule a reconnect after
    /// the fixed delay.
    pub fn disconnect(&mut self, now_ms: u64) {
        self.port = None;
        self.schedule_retry(now_ms);
    }

    fn schedule_retry(&mut self, now_ms: u64) {
        self.state = LinkState::Disconnected {
            retry_at_ms: Some(now_ms + self.reconnect_delay_ms),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackHub;
    use crate::types::protocol::PortFrame;

    #[test]
    fn first_tick_dials_immediately() {
        let hub = LoopbackHub::new();
        let mut conn = PortConnection::new(1000);
        assert!(!conn.is_connected());
        assert!(conn.tick(&hub, 0));
        assert!(conn.is_connected());
        assert_eq!(conn.generation(), 1);
    }

    #[test]
    fn send_while_disconnected_returns_false() {
        let mut conn = PortConnection::new(1000);
        assert!(!conn.send(&PortFrame::liveness(), 0));
    }

    #[test]
    fn send_after_connect_returns_true() {
        let hub = LoopbackHub::new();
        let mut conn = PortConnection::new(1000);
        conn.tick(&hub, 0);
        assert!(conn.send(&PortFrame::query("theme-enabled"), 0));

        let mut store_side = hub.take_new_ports().pop().unwrap();
        use crate::transport::Port as _;
        assert_eq!(
            store_side.try_recv().unwrap(),
            Some(PortFrame::query("theme-enabled"))
        );
    }

    #[test]
    fn transport_error_schedules_reconnect_after_fixed_delay() {
        let hub = LoopbackHub::new();
        let mut conn = PortConnection::new(1000);
        conn.tick(&hub, 0);
        let store_side = hub.take_new_ports().pop().unwrap();

        // Kill the link; the failed send tears the connection down.
        store_side.close();
        assert!(!conn.send(&PortFrame::liveness(), 100));
        assert!(!conn.is_connected());

        // Inside the backoff window every send fails and no redial happens.
        assert!(!conn.tick(&hub, 600));
        assert!(!conn.send(&PortFrame::liveness(), 600));

        // After 1000ms the redial goes through with a new identity.
        assert!(conn.tick(&hub, 1100));
        assert!(conn.is_connected());
        assert_eq!(conn.generation(), 2);
        assert!(conn.send(&PortFrame::liveness(), 1100));
    }

    #[test]
    fn failed_dial_retries_after_delay() {
        let hub = LoopbackHub::new();
        hub.set_refuse_dials(true);
        let mut conn = PortConnection::new(1000);
        assert!(!conn.tick(&hub, 0));
        assert!(!conn.tick(&hub, 500));

        hub.set_refuse_dials(false);
        assert!(!conn.tick(&hub, 900)); // delay not yet elapsed
        assert!(conn.tick(&hub, 1000));
    }

    #[test]
    fn listener_guard_resets_per_connection() {
        let hub = LoopbackHub::new();
        let mut conn = PortConnection::new(1000);
        conn.tick(&hub, 0);
        assert!(conn.register_listener());
        assert!(!conn.register_listener());

        conn.disconnect(10);
        conn.tick(&hub, 1100);
        // Fresh connection, fresh guard.
        assert!(conn.register_listener());
        assert!(!conn.register_listener());
    }
}
