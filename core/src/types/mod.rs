pub mod config;
pub mod flag;
pub mod protocol;
