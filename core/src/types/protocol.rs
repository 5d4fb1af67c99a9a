//! Wire formats for the two message buses.
//!
//! Port frames travel between the store daemon and a relay: a plain JSON
//! object of `flagKey -> bool`. A key present in a relay-to-store frame is a
//! query (the payload value is ignored); a store-to-relay frame carries
//! authoritative values. The reserved `backgroundPageInitialized` key marks
//! the once-per-second liveness signal.
//!
//! Window messages travel between a relay and the page agent as tagged
//! `{action, payload}` objects.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Reserved port-frame key used as the store liveness signal.
pub const LIVENESS_KEY: &str = "backgroundPageInitialized";

// ---------------------------------------------------------------------------
// PortFrame
// ---------------------------------------------------------------------------

/// One message on the store<->relay port: a flat map of flag keys to booleans.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortFrame {
    pub entries: BTreeMap<String, bool>,
}

impl PortFrame {
    pub fn new() -> Self {
        PortFrame::default()
    }

    /// A query for the current value of `key`. The payload value carries no
    /// meaning for queries; `false` is the placeholder.
    pub fn query(key: &str) -> Self {
        let mut frame = PortFrame::new();
        frame.entries.insert(key.to_string(), false);
        frame
    }

    /// An authoritative value broadcast for `key`.
    pub fn reply(key: &str, value: bool) -> Self {
        let mut frame = PortFrame::new();
        frame.entries.insert(key.to_string(), value);
        frame
    }

    /// The once-per-second "store is alive" signal.
    pub fn liveness() -> Self {
        let mut frame = PortFrame::new();
        frame.entries.insert(LIVENESS_KEY.to_string(), true);
        frame
    }

    pub fn is_liveness(&self) -> bool {
        self.entries.contains_key(LIVENESS_KEY)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flag entries in the frame, excluding the reserved liveness key.
    pub fn flag_entries(&self) -> impl Iterator<Item = (&str, bool)> {
        self.entries
            .iter()
            .filter(|(key, _)| key.as_str() != LIVENESS_KEY)
            .map(|(key, value)| (key.as_str(), *value))
    }

    /// Republish this frame into the page context as window messages.
    ///
    /// Single-key frames become `FlagState`; a multi-key frame is the
    /// store's initial dump and becomes one `StorageSnapshot`.
    pub fn to_window_messages(&self) -> Vec<WindowMessage> {
        let mut out = Vec::new();
        if self.is_liveness() {
            out.push(WindowMessage::StoreAlive);
        }
        let flags: BTreeMap<String, bool> = self
            .flag_entries()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        if flags.len() > 1 {
            out.push(WindowMessage::StorageSnapshot { entries: flags });
        } else if let Some((key, value)) = flags.into_iter().next() {
            out.push(WindowMessage::FlagState { key, value });
        }
        out
    }
}

// ---------------------------------------------------------------------------
// WindowMessage
// ---------------------------------------------------------------------------

/// One message on the relay<->page-agent bus, serialized as
/// `{"action": <tag>, "payload": <object>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum WindowMessage {
    /// Authoritative flag value republished from the store.
    FlagState { key: String, value: bool },
    /// Page-agent poll for a flag's current value.
    FlagQuery { key: String },
    /// Page-agent request to change a flag.
    ToggleRequest { key: String, value: bool },
    /// Relay acknowledgement of a toggle request.
    ToggleReceived { key: String },
    /// Initial dump of every known flag, pushed once after connect.
    StorageSnapshot { entries: BTreeMap<String, bool> },
    /// Page agent signals it is ready to receive buffered messages.
    AgentReady,
    /// Republished store liveness signal.
    StoreAlive,
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Service-protocol response sent back to one-shot command clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok { output: String },
    Error { message: String },
}
