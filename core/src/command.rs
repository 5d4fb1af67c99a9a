//! Command — the typed interface for all uisync daemon operations.
//!
//! Every operation a client can ask of the daemon is a variant of the
//! `Command` enum. The enum is both the wire format (JSON over the unix
//! socket) and the API documentation for the core crate.
//!
//! # Wire Format
//!
//! Commands are serialized as JSON objects with a `"command"` discriminant:
//!
//! ```json
//! {"command": "flag.get", "key": "theme-enabled"}
//! {"command": "flag.set", "key": "theme-enabled", "value": false}
//! {"command": "port"}
//! ```
//!
//! `flag.set` with the `value` field omitted is accepted and dropped by the
//! store — callers forwarding optional payloads rely on that.

use serde::{Deserialize, Serialize};

/// A typed command sent to the uisync daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "command")]
pub enum Command {
    /// Read one flag's current value.
    #[serde(rename = "flag.get")]
    FlagGet { key: String },

    /// Set one flag. An absent `value` is a silent no-op.
    #[serde(rename = "flag.set")]
    FlagSet {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<bool>,
    },

    /// List every initialized flag with its default.
    #[serde(rename = "flag.list")]
    FlagList,

    /// Summary of daemon state (flag count, connected ports).
    #[serde(rename = "status")]
    Status,

    /// Upgrade this connection into a long-lived relay port. The stream is
    /// moved into the port registry; no response is written.
    #[serde(rename = "port")]
    Port,

    /// Run the daemon in the current process (handled by the CLI, never
    /// dispatched over the socket).
    #[serde(rename = "daemon.run")]
    DaemonRun,

    /// Ask the daemon to shut down gracefully.
    #[serde(rename = "daemon.stop")]
    DaemonStop,
}
