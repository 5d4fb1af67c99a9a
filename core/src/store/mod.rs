//! Flag store — the authoritative owner of every feature flag.
//!
//! The store answers queries and accepts mutation requests from two
//! independent callers (the transient CLI and a relay on behalf of the page
//! agent) without either caller's lifecycle affecting the other. Persistent
//! storage is the single source of truth; the store is the only component
//! that writes it.

pub mod registry;
pub mod storage;

use std::collections::BTreeMap;

use crate::types::flag::{builtin_default, FeatureFlag, BUILTIN_FLAGS};
use crate::types::protocol::PortFrame;
use storage::Storage;

// ---------------------------------------------------------------------------
// FlagStore
// ---------------------------------------------------------------------------

/// In-memory mirror of the persisted flags, plus the persistence capability.
///
/// Constructed once per process and injected where needed; there is no
/// module-global state.
pub struct FlagStore {
    storage: Box<dyn Storage>,
    flags: BTreeMap<String, FeatureFlag>,
    init_complete: bool,
    storage_errors: u64,
}

impl FlagStore {
    pub fn new(storage: Box<dyn Storage>) -> Self {
        FlagStore {
            storage,
            flags: BTreeMap::new(),
            init_complete: false,
            storage_errors: 0,
        }
    }

    /// Initialize one flag from persistent storage, seeding `default_value`
    /// in memory when the key is absent. The seed is not written back; the
    /// first explicit `set_flag` is what persists it.
    ///
    /// Idempotent: a second call returns the already-resolved value and
    /// ignores its `default_value` argument entirely.
    pub fn init_flag(&mut self, key: &str, default_value: bool) -> bool {
        if let Some(flag) = self.flags.get(key) {
            return flag.value;
        }
        let value = match self.storage.get(key) {
            Ok(Some(stored)) => stored,
            Ok(None) => default_value,
            Err(_) => {
                // Storage trouble never blocks initialization.
                self.storage_errors += 1;
                default_value
            }
        };
        self.flags
            .insert(key.to_string(), FeatureFlag::new(key, value, default_value));
        value
    }

    /// Initialize the compiled-in flag table plus any extra keys, then mark
    /// initialization complete so the liveness broadcast may begin.
    pub fn init_all<'a>(&mut self, extra: impl IntoIterator<Item = (&'a str, bool)>) {
        for spec in BUILTIN_FLAGS {
            self.init_flag(spec.key, spec.default_value);
        }
        for (key, default_value) in extra {
            self.init_flag(key, default_value);
        }
        self.init_complete = true;
    }

    /// Whether every configured flag has been initialized.
    pub fn init_complete(&self) -> bool {
        self.init_complete
    }

    /// Set a flag. `None` models an absent/undefined payload and is dropped
    /// silently — some callers forward optional values and rely on that.
    ///
    /// On `Some`, the value is persisted before this method returns and the
    /// broadcast frame for the connected relays is handed back for same-tick
    /// delivery.
    pub fn set_flag(&mut self, key: &str, value: Option<bool>) -> Option<PortFrame> {
        let value = value?;
        match self.flags.get_mut(key) {
            Some(flag) => flag.value = value,
            None => {
                // First contact with this key: a direct set also defines it.
                let default_value = builtin_default(key).unwrap_or(value);
                self.flags
                    .insert(key.to_string(), FeatureFlag::new(key, value, default_value));
            }
        }
        if self.storage.set(key, value).is_err() {
            // Keep serving the in-memory value; persistence catches up on
            // the next successful write.
            self.storage_errors += 1;
        }
        Some(PortFrame::reply(key, value))
    }

    /// Last known in-memory value.
    pub fn get_flag(&self, key: &str) -> Option<bool> {
        self.flags.get(key).map(|flag| flag.value)
    }

    /// Full flag metadata, for status output.
    pub fn flag(&self, key: &str) -> Option<&FeatureFlag> {
        self.flags.get(key)
    }

    /// Answer an inbound port frame: each known key present in the frame is
    /// a query and gets the authoritative value in the reply. Unknown keys
    /// and the liveness marker are ignored.
    pub fn handle_frame(&self, frame: &PortFrame) -> Option<PortFrame> {
        let mut reply = PortFrame::new();
        for (key, _) in frame.flag_entries() {
            if let Some(flag) = self.flags.get(key) {
                reply.entries.insert(key.to_string(), flag.value);
            }
        }
        if reply.is_empty() {
            None
        } else {
            Some(reply)
        }
    }

    /// Current value of every initialized flag.
    pub fn snapshot(&self) -> BTreeMap<String, bool> {
        self.flags
            .iter()
            .map(|(key, flag)| (key.clone(), flag.value))
            .collect()
    }

    pub fn flag_count(&self) -> usize {
        self.flags.len()
    }

    /// Number of storage operations that have failed so far.
    pub fn storage_errors(&self) -> u64 {
        self.storage_errors
    }
}

// ---------------------------------------------------------------------------
// LivenessClock
// ---------------------------------------------------------------------------

/// Per-connection "I am alive" broadcast schedule.
///
/// Armed once per connection after all flags are initialized; `start` is
/// idempotent so a reconnect cannot double the broadcast cadence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessClock {
    interval_ms: u64,
    next_due_ms: Option<u64>,
}

impl LivenessClock {
    pub fn new(interval_ms: u64) -> Self {
        LivenessClock {
            interval_ms,
            next_due_ms: None,
        }
    }

    /// Arm the clock. A no-op when already running.
    pub fn start(&mut self, now_ms: u64) {
        if self.next_due_ms.is_none() {
            self.next_due_ms = Some(now_ms + self.interval_ms);
        }
    }

    pub fn stop(&mut self) {
        self.next_due_ms = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_due_ms.is_some()
    }

    /// Whether a broadcast is due. Re-arms for the next period when it is.
    pub fn tick(&mut self, now_ms: u64) -> bool {
        match self.next_due_ms {
            Some(due) if now_ms >= due => {
                self.next_due_ms = Some(now_ms + self.interval_ms);
                true
            }
            _ => false,
        }
    }
}
