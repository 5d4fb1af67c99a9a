//! Message fan-out inside the page agent.
//!
//! Every inbound window message is handed to every registered callback, in
//! registration order, synchronously. Callbacks filter by key themselves.
//! One-shot entries are pruned after each dispatch whether or not they
//! matched the message.

use crate::types::protocol::WindowMessage;

type Callback = Box<dyn FnMut(&WindowMessage)>;

struct Entry {
    id: u64,
    run_once: bool,
    callback: Callback,
}

/// Owned, encapsulated listener set with explicit register/deregister
/// operations — no ambient rebinding of listener arrays.
#[derive(Default)]
pub struct CallbackRegistry {
    entries: Vec<Entry>,
    next_id: u64,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        CallbackRegistry {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    pub fn register(&mut self, callback: Callback, run_once: bool) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(Entry {
            id,
            run_once,
            callback,
        });
        id
    }

    /// Remove one entry by id. Returns whether it existed.
    pub fn deregister(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    /// Call every callback with the full message, then drop all one-shots.
    pub fn dispatch(&mut self, msg: &WindowMessage) {
        for entry in &mut self.entries {
            (entry.callback)(msg);
        }
        self.entries.retain(|entry| !entry.run_once);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
