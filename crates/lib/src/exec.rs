//! Command runner: invoke the openclaw CLI as a child process and capture its output.
//! No shell is used; arguments are passed as a list to avoid injection.
//!
//! Every invocation gets the same shaped environment (see [`ChildEnv`]): state and workspace
//! overrides are set and wrapper-only secrets are removed, because openclaw may expose its
//! environment to agent-executed shell commands.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::{CliCommand, EnvResolver, WrapperConfig, WRAPPER_ONLY_VARS};

/// Exit code reported when the program could not be started at all.
pub const SPAWN_FAILED_CODE: i32 = 127;
/// Exit code reported when a bounded invocation ran past its deadline.
pub const TIMED_OUT_CODE: i32 = 124;

/// Environment handed to every openclaw child process.
#[derive(Debug, Clone, Default)]
pub struct ChildEnv {
    vars: Vec<(String, String)>,
}

impl ChildEnv {
    /// Start from `base`, drop wrapper-only secrets, and point openclaw at our directories.
    pub fn shaped<'a, I>(base: I, config: &WrapperConfig) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut vars: Vec<(String, String)> = base
            .into_iter()
            .filter(|(k, _)| !WRAPPER_ONLY_VARS.contains(&k.as_str()))
            .filter(|(k, _)| !is_overridden(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        vars.push((
            "OPENCLAW_STATE_DIR".to_string(),
            config.state_dir.to_string_lossy().into_owned(),
        ));
        vars.push((
            "OPENCLAW_WORKSPACE_DIR".to_string(),
            config.workspace_dir.to_string_lossy().into_owned(),
        ));
        vars.push((
            "OPENCLAW_CONFIG_PATH".to_string(),
            config.config_path.to_string_lossy().into_owned(),
        ));
        vars.sort();
        Self { vars }
    }

    pub fn from_resolver(env: &EnvResolver, config: &WrapperConfig) -> Self {
        Self::shaped(env.vars(), config)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Replace the command's environment with this one.
    pub fn apply(&self, cmd: &mut Command) {
        cmd.env_clear();
        cmd.envs(self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
}

fn is_overridden(key: &str) -> bool {
    matches!(
        key,
        "OPENCLAW_STATE_DIR"
            | "OPENCLAW_WORKSPACE_DIR"
            | "OPENCLAW_CONFIG_PATH"
            | "CLAWDBOT_STATE_DIR"
            | "CLAWDBOT_WORKSPACE_DIR"
            | "CLAWDBOT_CONFIG_PATH"
    )
}

/// Exit code plus merged stdout/stderr of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn ok(&self) -> bool {
        self.code == 0
    }
}

/// Runs openclaw CLI invocations. Never fails: problems are reported through the exit code and text.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, args: &[String]) -> CommandOutput;
}

/// [`CommandRunner`] that spawns the real openclaw binary.
#[derive(Clone)]
pub struct ProcessRunner {
    cli: CliCommand,
    env: Arc<ChildEnv>,
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(cli: CliCommand, env: Arc<ChildEnv>) -> Self {
        Self {
            cli,
            env,
            timeout: None,
        }
    }

    /// Kill invocations that run longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the base command (program, prefix args, shaped env). Also used for `gateway run`.
    pub fn command(cli: &CliCommand, env: &ChildEnv, args: &[String]) -> Command {
        let mut cmd = Command::new(&cli.program);
        cmd.args(&cli.prefix_args).args(args);
        env.apply(&mut cmd);
        cmd
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, args: &[String]) -> CommandOutput {
        let mut cmd = Self::command(&self.cli, &self.env, args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        log::debug!("running openclaw {}", args.join(" "));
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                log::warn!("failed to spawn {}: {}", self.cli.program.display(), e);
                return CommandOutput {
                    code: SPAWN_FAILED_CODE,
                    output: format!("[spawn error] {}: {}\n", self.cli.program.display(), e),
                };
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        if let Some(out) = child.stdout.take() {
            tokio::spawn(pump(out, tx.clone()));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(pump(err, tx.clone()));
        }
        drop(tx);

        let collect = async {
            let mut merged = Vec::new();
            while let Some(chunk) = rx.recv().await {
                merged.extend_from_slice(&chunk);
            }
            merged
        };
        let wait = async {
            let (merged, status) = tokio::join!(collect, child.wait());
            (merged, status)
        };

        let (merged, code) = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok((merged, status)) => (merged, exit_code(status)),
                Err(_) => {
                    // kill_on_drop reaps the child once `wait` is dropped.
                    return CommandOutput {
                        code: TIMED_OUT_CODE,
                        output: format!("[timeout] openclaw {} exceeded {:?}\n", args.join(" "), limit),
                    };
                }
            },
            None => {
                let (merged, status) = wait.await;
                (merged, exit_code(status))
            }
        };
        CommandOutput {
            code,
            output: String::from_utf8_lossy(&merged).into_owned(),
        }
    }
}

fn exit_code(status: std::io::Result<std::process::ExitStatus>) -> i32 {
    match status {
        Ok(s) => s.code().unwrap_or(1),
        Err(e) => {
            log::warn!("waiting for openclaw failed: {}", e);
            1
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::UnboundedSender<Vec<u8>>) {
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

/// Convenience for building argument vectors from string literals.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
