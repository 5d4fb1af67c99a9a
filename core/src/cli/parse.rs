use crate::command::Command;

/// Parse CLI arguments into a typed Command enum.
///
/// Arguments are expected WITHOUT the program name (i.e., `args` should be
/// `["flag", "get", "theme-enabled"]`, not `["uisync", "flag", ...]`).
pub fn parse_args(args: &[&str]) -> Result<Command, String> {
    if args.is_empty() {
        return Err("No command specified. Run 'uisync help' for usage.".into());
    }

    match args[0] {
        "flag" => parse_flag(args),
        "status" => Ok(Command::Status),
        "daemon" => parse_daemon(args),
        "help" | "--help" | "-h" => Err(usage().into()),
        _ => Err(format!("Unknown command: '{}'", args[0])),
    }
}

/// Top-level usage text.
pub fn usage() -> &'static str {
    "Usage:\n  uisync flag get <key>\n  uisync flag set <key> <on|off>\n  uisync flag list\n  uisync status\n  uisync daemon run\n  uisync daemon stop"
}

// ---------------------------------------------------------------------------
// Sub-parsers
// ---------------------------------------------------------------------------

/// `uisync flag <get|set|list> ...`
fn parse_flag(args: &[&str]) -> Result<Command, String> {
    if args.len() < 2 {
        return Err("Usage: uisync flag <get|set|list>".into());
    }
    match args[1] {
        "get" => {
            if args.len() < 3 {
                return Err("Usage: uisync flag get <key>".into());
            }
            Ok(Command::FlagGet { key: args[2].into() })
        }
        "set" => {
            if args.len() < 4 {
                return Err("Usage: uisync flag set <key> <on|off>".into());
            }
            Ok(Command::FlagSet {
                key: args[2].into(),
                value: Some(parse_bool(args[3])?),
            })
        }
        "list" => Ok(Command::FlagList),
        _ => Err(format!("Unknown flag subcommand: '{}'", args[1])),
    }
}

/// `uisync daemon <run|stop>`
fn parse_daemon(args: &[&str]) -> Result<Command, String> {
    if args.len() < 2 {
        return Err("Usage: uisync daemon <run|stop>".into());
    }
    match args[1] {
        "run" => Ok(Command::DaemonRun),
        "stop" => Ok(Command::DaemonStop),
        _ => Err(format!("Unknown daemon subcommand: '{}'", args[1])),
    }
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        _ => Err(format!("Expected on|off, got '{}'", raw)),
    }
}
