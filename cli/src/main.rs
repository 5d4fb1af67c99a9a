//! uisync CLI — the command-line entry point for the flag store.
//!
//! # Usage
//!
//! ```text
//! uisync flag list
//! uisync flag get theme-enabled
//! uisync flag set theme-enabled off
//! uisync status
//! uisync daemon run
//! uisync daemon stop
//! ```

use std::path::{Path, PathBuf};
use std::process;

use uisync_core::cli::parse_args;
use uisync_core::command::Command;
use uisync_core::service;
use uisync_core::store::registry::PortRegistry;
use uisync_core::store::storage::FileStorage;
use uisync_core::store::FlagStore;
use uisync_core::types::config;
use uisync_core::types::protocol::Response;


fn main() {
    let args: Vec<String> = std::env::args().collect();
    let arg_refs: Vec<&str> = args[1..].iter().map(|s| s.as_str()).collect();

    let cmd = match parse_args(&arg_refs) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("uisync: {}", e);
            process::exit(1);
        }
    };

    let config_dir = resolve_config_dir();

    // DaemonRun is handled directly — run the daemon in this process.
    if matches!(cmd, Command::DaemonRun) {
        let pid_path = config_dir.join("uisync.pid");
        let _ = std::fs::create_dir_all(&config_dir);
        let _ = std::fs::write(&pid_path, std::process::id().to_string());

        match uisync_core::daemon::Daemon::new(&config_dir) {
            Ok(mut daemon) => {
                if let Err(e) = daemon.run() {
                    eprintln!("uisync daemon: {}", e);
                    let _ = std::fs::remove_file(&pid_path);
                    process::exit(1);
                }
                let _ = std::fs::remove_file(&pid_path);
            }
            Err(e) => {
                eprintln!("uisync daemon: failed to start: {}", e);
                let _ = std::fs::remove_file(&pid_path);
                process::exit(1);
            }
        }
        return;
    }

    let timeout_ms = config::load(&config_dir.join("settings.yaml"))
        .map(|s| s.command_timeout_ms)
        .unwrap_or(10_000);

    // All other commands: use execute_remote (handles daemon lifecycle).
    let response = match uisync_core::client::execute_remote(&config_dir, &cmd, timeout_ms) {
        Ok(resp) => resp,
        Err(e) => {
            eprintln!("uisync: daemon unavailable ({}), using local mode", e);
            execute_local(&config_dir, cmd)
        }
    };

    match response {
        Response::Ok { output } => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Response::Error { message } => {
            eprintln!("uisync error: {}", message);
            process::exit(1);
        }
    }
}


fn resolve_config_dir() -> PathBuf {
    resolve_config_dir_from(
        std::env::var("UISYNC_CONFIG_DIR").ok(),
        std::env::var("HOME").ok(),
    )
}

/// Pure resolution rule, split out so tests never have to mutate the
/// process environment.
fn resolve_config_dir_from(override_dir: Option<String>, home: Option<String>) -> PathBuf {
    if let Some(dir) = override_dir {
        return PathBuf::from(dir);
    }
    let home = home.unwrap_or_else(|| "/tmp".into());
    PathBuf::from(home).join(".config").join("uisync")
}


/// Run a command against the on-disk store without a daemon. No port
/// registry exists here, so flag changes reach relays only after the
/// daemon comes back and re-reads storage.
fn execute_local(config_dir: &Path, cmd: Command) -> Response {
    let settings = match config::load(&config_dir.join("settings.yaml")) {
        Ok(s) => s,
        Err(e) => return Response::Error { message: e },
    };
    let storage = FileStorage::new(&config_dir.join("flags.json"));
    let mut store = FlagStore::new(Box::new(storage));
    store.init_all(
        settings
            .extra_flags
            .iter()
            .map(|f| (f.key.as_str(), f.default_value)),
    );
    let mut ports = PortRegistry::new(settings.liveness_interval_ms);
    service::execute(&mut store, &mut ports, cmd)
}
