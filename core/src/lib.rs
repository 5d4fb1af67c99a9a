//! uisync core — feature-flag synchronization across process boundaries.
//!
//! One store process owns the flags; any number of relays bridge the store's
//! port protocol onto a page bus where agents poll their way to convergence.
//! Everything here is plain synchronous Rust: timers are explicit due-times,
//! transports are trait objects, and the daemon loop is the only thread that
//! mutates flag state.

pub mod agent;
pub mod cli;
pub mod client;
pub mod command;
pub mod daemon;
pub mod relay;
pub mod service;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;
