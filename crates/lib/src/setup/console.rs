//! Debug console: a fixed table of pseudo-commands, each mapped to a supervisor action or
//! an openclaw argument list. Anything not in the table is rejected.

use serde::Deserialize;

/// Body of `POST /setup/api/console/run`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleRequest {
    pub cmd: String,
    #[serde(default)]
    pub arg: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayOp {
    Start,
    Stop,
    Restart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleAction {
    Gateway(GatewayOp),
    Cli(Vec<String>),
}

#[derive(Debug, Clone, Copy)]
enum ArgRule {
    Forbidden,
    Required,
    /// Optional positive count with a default.
    Count(u32),
}

struct Entry {
    name: &'static str,
    argv: &'static [&'static str],
    arg: ArgRule,
}

const CLI_COMMANDS: &[Entry] = &[
    Entry { name: "openclaw.version", argv: &["--version"], arg: ArgRule::Forbidden },
    Entry { name: "openclaw.status", argv: &["status"], arg: ArgRule::Forbidden },
    Entry { name: "openclaw.health", argv: &["health"], arg: ArgRule::Forbidden },
    Entry { name: "openclaw.doctor", argv: &["doctor"], arg: ArgRule::Forbidden },
    Entry { name: "openclaw.logs.tail", argv: &["logs", "--tail"], arg: ArgRule::Count(200) },
    Entry { name: "openclaw.config.get", argv: &["config", "get"], arg: ArgRule::Required },
    Entry { name: "openclaw.devices.list", argv: &["devices", "list"], arg: ArgRule::Forbidden },
    Entry { name: "openclaw.devices.approve", argv: &["devices", "approve"], arg: ArgRule::Required },
    Entry { name: "openclaw.plugins.list", argv: &["plugins", "list"], arg: ArgRule::Forbidden },
    Entry { name: "openclaw.plugins.enable", argv: &["plugins", "enable"], arg: ArgRule::Required },
];

const MAX_ARG_LEN: usize = 256;

/// All command names, for the UI dropdown.
pub fn command_names() -> Vec<&'static str> {
    ["gateway.start", "gateway.stop", "gateway.restart"]
        .into_iter()
        .chain(CLI_COMMANDS.iter().map(|e| e.name))
        .collect()
}

/// Argument charset: `[A-Za-z0-9._:/@-]`, no leading `-` (so it can never become a flag).
pub fn validate_arg(arg: &str) -> Result<(), String> {
    if arg.is_empty() {
        return Err("argument is empty".to_string());
    }
    if arg.len() > MAX_ARG_LEN {
        return Err("argument too long".to_string());
    }
    if arg.starts_with('-') {
        return Err("argument may not start with '-'".to_string());
    }
    if let Some(c) = arg
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '/' | '@' | '-')))
    {
        return Err(format!("argument contains disallowed character {:?}", c));
    }
    Ok(())
}

pub fn resolve(cmd: &str, arg: Option<&str>) -> Result<ConsoleAction, String> {
    let arg = arg.map(str::trim).filter(|a| !a.is_empty());
    let gateway = match cmd {
        "gateway.start" => Some(GatewayOp::Start),
        "gateway.stop" => Some(GatewayOp::Stop),
        "gateway.restart" => Some(GatewayOp::Restart),
        _ => None,
    };
    if let Some(op) = gateway {
        if arg.is_some() {
            return Err(format!("{} takes no argument", cmd));
        }
        return Ok(ConsoleAction::Gateway(op));
    }

    let entry = CLI_COMMANDS
        .iter()
        .find(|e| e.name == cmd)
        .ok_or_else(|| format!("unknown command: {}", cmd))?;
    let mut argv: Vec<String> = entry.argv.iter().map(|s| s.to_string()).collect();
    match (entry.arg, arg) {
        (ArgRule::Forbidden, None) => {}
        (ArgRule::Forbidden, Some(_)) => return Err(format!("{} takes no argument", cmd)),
        (ArgRule::Required, None) => return Err(format!("{} needs an argument", cmd)),
        (ArgRule::Required, Some(a)) => {
            validate_arg(a)?;
            argv.push(a.to_string());
        }
        (ArgRule::Count(default), a) => {
            let n = match a {
                None => default,
                Some(a) => match a.parse::<u32>() {
                    Ok(n) if (1..=5000).contains(&n) => n,
                    _ => return Err(format!("{} expects a line count between 1 and 5000", cmd)),
                },
            };
            argv.push(n.to_string());
        }
    }
    Ok(ConsoleAction::Cli(argv))
}
