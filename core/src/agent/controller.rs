//! Per-flag poll/ack convergence state machine.
//!
//! The transport between the page and the store guarantees nothing across
//! reconnects, so each controller converges by polling: fast (100ms) until
//! the first reply arrives, then a relaxed 300ms recheck cadence. A dropped
//! broadcast self-heals within one cycle. The 100/300 pair is a studied
//! responsiveness-vs-overhead tradeoff; do not tune it casually.

use crate::types::config::{POLL_INTERVAL_MS, RECHECK_INTERVAL_MS};
use crate::types::protocol::WindowMessage;

/// Side effect applied when the remote value changes. Returning `false`
/// means "not applicable yet" (say, the DOM is not ready); the value is not
/// recorded as applied and the next convergence cycle retries it.
pub type ApplyFn = Box<dyn FnMut(bool) -> bool>;

/// `Polling` until the first matching reply, then `Settled` with periodic
/// rechecks. Every reply re-arms the recheck timer, which doubles as the
/// cancel-before-reschedule discipline: there is never more than one
/// pending timer per controller.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Polling { next_query_ms: u64 },
    Settled { recheck_at_ms: u64 },
}

pub struct StateController {
    key: String,
    last_applied: Option<bool>,
    phase: Phase,
    apply: ApplyFn,
}

impl StateController {
    /// Create a controller for `key`. The first query is due immediately.
    pub fn new(key: &str, apply: ApplyFn, now_ms: u64) -> Self {
        StateController {
            key: key.to_string(),
            last_applied: None,
            phase: Phase::Polling { next_query_ms: now_ms },
            apply,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The last value the side effect accepted, if any.
    pub fn last_applied(&self) -> Option<bool> {
        self.last_applied
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.phase, Phase::Settled { .. })
    }

    /// Emit the query for this flag if one is due, re-arming the current
    /// phase's interval.
    pub fn tick(&mut self, now_ms: u64) -> Option<WindowMessage> {
        match &mut self.phase {
            Phase::Polling { next_query_ms } if now_ms >= *next_query_ms => {
                *next_query_ms = now_ms + POLL_INTERVAL_MS;
            }
            Phase::Settled { recheck_at_ms } if now_ms >= *recheck_at_ms => {
                *recheck_at_ms = now_ms + RECHECK_INTERVAL_MS;
            }
            _ => return None,
        }
        Some(WindowMessage::FlagQuery {
            key: self.key.clone(),
        })
    }

    /// Process an authoritative reply for this flag.
    ///
    /// Cancels the fast poll and any pending recheck, applies the side
    /// effect when the value differs from the last applied one, and
    /// schedules the next recheck. Returns `true` when the side effect ran
    /// and accepted the value.
    pub fn on_reply(&mut self, value: bool, now_ms: u64) -> bool {
        self.phase = Phase::Settled {
            recheck_at_ms: now_ms + RECHECK_INTERVAL_MS,
        };
        if self.last_applied == Some(value) {
            // Stale or duplicate reply; a no-op, not an error.
            return false;
        }
        if (self.apply)(value) {
            self.last_applied = Some(value);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Applied {
        calls: Rc<RefCell<Vec<bool>>>,
        accept: Rc<RefCell<bool>>,
    }

    fn controller(now_ms: u64) -> (StateController, Applied) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let accept = Rc::new(RefCell::new(true));
        let calls_clone = calls.clone();
        let accept_clone = accept.clone();
        let apply: ApplyFn = Box::new(move |value| {
            calls_clone.borrow_mut().push(value);
            *accept_clone.borrow()
        });
        (
            StateController::new("theme-enabled", apply, now_ms),
            Applied { calls, accept },
        )
    }

    #[test]
    fn first_query_is_immediate_then_every_100ms() {
        let (mut ctrl, _) = controller(0);
        assert!(ctrl.tick(0).is_some());
        assert!(ctrl.tick(50).is_none());
        assert!(ctrl.tick(100).is_some());
        assert!(ctrl.tick(150).is_none());
        assert!(ctrl.tick(200).is_some());
    }

    #[test]
    fn reply_moves_to_settled_cadence() {
        let (mut ctrl, applied) = controller(0);
        ctrl.tick(0);
        assert!(ctrl.on_reply(true, 10));
        assert!(ctrl.is_settled());
        assert_eq!(applied.calls.borrow().as_slice(), &[true]);

        // The 100ms poll is canceled; the next query is the 300ms recheck.
        assert!(ctrl.tick(110).is_none());
        assert!(ctrl.tick(210).is_none());
        assert!(ctrl.tick(310).is_some());
    }

    #[test]
    fn rechecks_repeat_when_replies_are_lost() {
        let (mut ctrl, _) = controller(0);
        ctrl.tick(0);
        ctrl.on_reply(true, 0);
        assert!(ctrl.tick(300).is_some());
        // No reply came back; the recheck keeps its cadence.
        assert!(ctrl.tick(400).is_none());
        assert!(ctrl.tick(600).is_some());
    }

    #[test]
    fn duplicate_reply_is_a_noop() {
        let (mut ctrl, applied) = controller(0);
        ctrl.on_reply(true, 0);
        assert!(!ctrl.on_reply(true, 300));
        assert!(!ctrl.on_reply(true, 600));
        assert_eq!(applied.calls.borrow().len(), 1);
        assert_eq!(ctrl.last_applied(), Some(true));
    }

    #[test]
    fn changed_value_reapplies() {
        let (mut ctrl, applied) = controller(0);
        ctrl.on_reply(true, 0);
        assert!(ctrl.on_reply(false, 300));
        assert_eq!(applied.calls.borrow().as_slice(), &[true, false]);
        assert_eq!(ctrl.last_applied(), Some(false));
    }

    #[test]
    fn rejected_side_effect_is_retried_without_desync() {
        let (mut ctrl, applied) = controller(0);
        *applied.accept.borrow_mut() = false;

        // Side effect says "not yet" — last_applied must not advance.
        assert!(!ctrl.on_reply(true, 0));
        assert_eq!(ctrl.last_applied(), None);

        // Next cycle retries the same value once the side effect can apply it.
        *applied.accept.borrow_mut() = true;
        assert!(ctrl.on_reply(true, 300));
        assert_eq!(ctrl.last_applied(), Some(true));
        assert_eq!(applied.calls.borrow().as_slice(), &[true, true]);
    }

    #[test]
    fn each_reply_rearms_the_recheck_timer() {
        let (mut ctrl, _) = controller(0);
        ctrl.on_reply(true, 0);
        // A reply at 250 supersedes the recheck due at 300.
        ctrl.on_reply(true, 250);
        assert!(ctrl.tick(300).is_none());
        assert!(ctrl.tick(550).is_some());
    }
}
