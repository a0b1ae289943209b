//! Runtime configuration resolved from the environment.
//!
//! The wrapper has no config file of its own: everything comes from environment
//! variables (with legacy aliases) plus the persisted gateway token under the state
//! directory. The openclaw config file path is resolved here too, since its existence
//! is what "configured" means everywhere else.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const DEFAULT_LISTEN_PORT: u16 = 8080;
const DEFAULT_GATEWAY_HOST: &str = "127.0.0.1";
const DEFAULT_GATEWAY_PORT: u16 = 18789;
const DEFAULT_VOICE_WEBHOOK_PORT: u16 = 3334;
const DEFAULT_ENTRY: &str = "/openclaw/dist/entry.js";
const DEFAULT_RUNTIME: &str = "node";

/// File name of the openclaw config inside the state directory.
pub const CONFIG_FILE_NAME: &str = "openclaw.json";
const LEGACY_CONFIG_FILE_NAME: &str = "clawdbot.json";
/// File name of the persisted gateway token inside the state directory.
pub const TOKEN_FILE_NAME: &str = "gateway.token";

/// Environment variables that belong to the wrapper only and must never reach the openclaw process.
pub const WRAPPER_ONLY_VARS: &[&str] = &["SETUP_PASSWORD"];

/// Snapshot of environment variables with legacy-key fallback.
///
/// Each deprecated key is warned about at most once per resolver.
pub struct EnvResolver {
    vars: HashMap<String, String>,
    warned: Mutex<HashSet<String>>,
}

impl EnvResolver {
    /// Capture the current process environment.
    pub fn from_process_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            warned: Mutex::new(HashSet::new()),
        }
    }

    /// Non-empty, trimmed value of `key`.
    pub fn var(&self, key: &str) -> Option<String> {
        self.vars
            .get(key)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Value of `key`, falling back to the first set legacy alias (warning once per alias).
    pub fn get(&self, key: &str, legacy: &[&str]) -> Option<String> {
        if let Some(v) = self.var(key) {
            return Some(v);
        }
        for old in legacy {
            if let Some(v) = self.var(old) {
                self.warn_deprecated(old, key);
                return Some(v);
            }
        }
        None
    }

    fn warn_deprecated(&self, old: &str, new: &str) {
        let mut warned = self.warned.lock().unwrap_or_else(|e| e.into_inner());
        if warned.insert(old.to_string()) {
            log::warn!("{} is deprecated; use {} instead", old, new);
        }
    }

    /// Deprecated keys that have been warned about so far.
    #[cfg(test)]
    pub(crate) fn warned_keys(&self) -> Vec<String> {
        let warned = self.warned.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = warned.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// All captured variables (used to build the child environment).
    pub fn vars(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }
}

/// How to invoke the openclaw CLI: a program plus leading arguments (e.g. `node /openclaw/dist/entry.js`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliCommand {
    pub program: PathBuf,
    pub prefix_args: Vec<String>,
}

impl CliCommand {
    pub fn new(program: impl Into<PathBuf>, prefix_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            prefix_args,
        }
    }
}

/// Internal host:port the gateway binds to and the proxy forwards to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
}

impl ProxyTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `http://host:port` without trailing slash.
    pub fn http_base(&self) -> String {
        format!("http://{}", self)
    }

    /// `ws://host:port` without trailing slash.
    pub fn ws_base(&self) -> String {
        format!("ws://{}", self)
    }

    /// Bind mode passed to openclaw (`loopback` for loopback hosts, `lan` otherwise).
    pub fn bind_mode(&self) -> &'static str {
        if is_loopback_bind(&self.host) {
            "loopback"
        } else {
            "lan"
        }
    }
}

impl std::fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Effective runtime configuration for the wrapper.
#[derive(Debug, Clone)]
pub struct WrapperConfig {
    /// Public listen port for the wrapper HTTP server.
    pub listen_port: u16,
    pub state_dir: PathBuf,
    pub workspace_dir: PathBuf,
    /// Root of the persistent volume; imports may only write beneath it.
    pub volume_root: PathBuf,
    /// openclaw config file. Its existence is the "configured" signal.
    pub config_path: PathBuf,
    /// Password for the setup surface. `None` disables the setup routes.
    pub setup_password: Option<String>,
    pub gateway_token: String,
    pub gateway: ProxyTarget,
    /// Port of the voice-call plugin webhook listener (same host as the gateway).
    pub voice_webhook_port: u16,
    pub cli: CliCommand,
    /// Public domain reported by the platform, if any.
    pub public_domain: Option<String>,
}

impl WrapperConfig {
    /// True when the openclaw config file exists.
    pub fn is_configured(&self) -> bool {
        self.config_path.exists()
    }
}

/// Directories chosen by the platform heuristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformDirs {
    pub state_dir: PathBuf,
    pub workspace_dir: PathBuf,
    /// Set only when a persistent volume was detected.
    pub volume_root: Option<PathBuf>,
}

/// Pick defaults that land on a persistent volume when one is detected.
pub fn platform_dirs(env: &EnvResolver) -> PlatformDirs {
    let root = if let Some(mount) = env.var("RAILWAY_VOLUME_MOUNT_PATH") {
        Some(PathBuf::from(mount))
    } else if env.var("RAILWAY_ENVIRONMENT").is_some() || env.var("RAILWAY_PROJECT_ID").is_some() {
        Some(PathBuf::from("/data"))
    } else {
        None
    };
    match root {
        Some(root) => PlatformDirs {
            state_dir: root.join(".openclaw"),
            workspace_dir: root.join("workspace"),
            volume_root: Some(root),
        },
        None => {
            let state_dir = dirs::home_dir()
                .map(|h| h.join(".openclaw"))
                .unwrap_or_else(|| PathBuf::from(".openclaw"));
            PlatformDirs {
                workspace_dir: state_dir.join("workspace"),
                state_dir,
                volume_root: None,
            }
        }
    }
}

fn parent_or_dot(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf()
}

/// Listen port: the wrapper-specific variable wins over the platform-injected `PORT`.
pub fn resolve_listen_port(env: &EnvResolver) -> Result<u16> {
    match env.var("OPENCLAW_PUBLIC_PORT").or_else(|| env.var("PORT")) {
        Some(p) => p
            .parse()
            .with_context(|| format!("invalid listen port: {}", p)),
        None => Ok(DEFAULT_LISTEN_PORT),
    }
}

/// Config file path: explicit override, else `openclaw.json` in the state dir.
/// A legacy `clawdbot.json` is reused when it is the only one present.
pub fn resolve_config_path(env: &EnvResolver, state_dir: &Path) -> PathBuf {
    if let Some(p) = env.get("OPENCLAW_CONFIG_PATH", &["CLAWDBOT_CONFIG_PATH"]) {
        return PathBuf::from(p);
    }
    let current = state_dir.join(CONFIG_FILE_NAME);
    let legacy = state_dir.join(LEGACY_CONFIG_FILE_NAME);
    if !current.exists() && legacy.exists() {
        log::warn!(
            "using legacy config file {}; rename it to {}",
            legacy.display(),
            CONFIG_FILE_NAME
        );
        return legacy;
    }
    current
}

/// Resolve the gateway token: env override, else the persisted file, else a fresh token
/// written to `<state_dir>/gateway.token` with owner-only permissions.
pub fn resolve_gateway_token(env: &EnvResolver, state_dir: &Path) -> Result<String> {
    if let Some(t) = env.get("OPENCLAW_GATEWAY_TOKEN", &["CLAWDBOT_GATEWAY_TOKEN"]) {
        return Ok(t);
    }
    let path = state_dir.join(TOKEN_FILE_NAME);
    match std::fs::read_to_string(&path) {
        Ok(s) if !s.trim().is_empty() => return Ok(s.trim().to_string()),
        Ok(_) => log::warn!("{} is empty; generating a new token", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("reading gateway token from {}", path.display()))
        }
    }
    let token = generate_token()?;
    write_secret_file(&path, &token)?;
    log::info!("generated gateway token at {}", path.display());
    Ok(token)
}

/// 32 random bytes, hex-encoded.
pub fn generate_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    getrandom::getrandom(&mut bytes).map_err(|e| anyhow::anyhow!("getrandom: {}", e))?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

fn write_secret_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    std::io::Write::write_all(&mut file, contents.as_bytes())
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn parse_port(env: &EnvResolver, key: &str, default: u16) -> Result<u16> {
    match env.var(key) {
        Some(p) => p
            .parse()
            .with_context(|| format!("invalid {}: {}", key, p)),
        None => Ok(default),
    }
}

/// Resolve the full runtime configuration. Creates the state dir (for the token file).
pub fn resolve(env: &EnvResolver) -> Result<WrapperConfig> {
    let platform = platform_dirs(env);
    let state_dir = env
        .get("OPENCLAW_STATE_DIR", &["CLAWDBOT_STATE_DIR"])
        .map(PathBuf::from)
        .unwrap_or(platform.state_dir);
    let workspace_dir = env
        .get("OPENCLAW_WORKSPACE_DIR", &["CLAWDBOT_WORKSPACE_DIR"])
        .map(PathBuf::from)
        .unwrap_or(platform.workspace_dir);
    let volume_root = platform
        .volume_root
        .unwrap_or_else(|| parent_or_dot(&state_dir));
    let config_path = resolve_config_path(env, &state_dir);
    let gateway_token = resolve_gateway_token(env, &state_dir)?;
    let gateway = ProxyTarget::new(
        env.var("INTERNAL_GATEWAY_HOST")
            .unwrap_or_else(|| DEFAULT_GATEWAY_HOST.to_string()),
        parse_port(env, "INTERNAL_GATEWAY_PORT", DEFAULT_GATEWAY_PORT)?,
    );
    let cli = CliCommand::new(
        env.var("OPENCLAW_NODE")
            .unwrap_or_else(|| DEFAULT_RUNTIME.to_string()),
        vec![env
            .var("OPENCLAW_ENTRY")
            .unwrap_or_else(|| DEFAULT_ENTRY.to_string())],
    );
    Ok(WrapperConfig {
        listen_port: resolve_listen_port(env)?,
        state_dir,
        workspace_dir,
        volume_root,
        config_path,
        setup_password: env.var("SETUP_PASSWORD"),
        gateway_token,
        gateway,
        voice_webhook_port: parse_port(env, "OPENCLAW_VOICE_WEBHOOK_PORT", DEFAULT_VOICE_WEBHOOK_PORT)?,
        cli,
        public_domain: env.var("RAILWAY_PUBLIC_DOMAIN"),
    })
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Config rooted at `root` (state `root/.openclaw`, workspace `root/workspace`), for tests.
#[cfg(test)]
pub(crate) fn test_config(root: &Path) -> WrapperConfig {
    let state_dir = root.join(".openclaw");
    WrapperConfig {
        listen_port: 0,
        config_path: state_dir.join(CONFIG_FILE_NAME),
        state_dir,
        workspace_dir: root.join("workspace"),
        volume_root: root.to_path_buf(),
        setup_password: Some("pw".to_string()),
        gateway_token: "tok".to_string(),
        gateway: ProxyTarget::new(DEFAULT_GATEWAY_HOST, DEFAULT_GATEWAY_PORT),
        voice_webhook_port: DEFAULT_VOICE_WEBHOOK_PORT,
        cli: CliCommand::new("sh", vec![]),
        public_domain: None,
    }
}
