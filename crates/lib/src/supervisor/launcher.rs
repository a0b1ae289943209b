//! Spawning the long-lived `gateway run` child.

use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};

use crate::config::{CliCommand, ProxyTarget};
use crate::exec::{ChildEnv, ProcessRunner};

/// How a gateway process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    /// Exit we did not observe (e.g. the wait itself failed).
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    /// Clean exit or termination by SIGTERM.
    pub fn is_expected(&self) -> bool {
        if self.code == Some(0) {
            return true;
        }
        #[cfg(unix)]
        {
            self.signal == Some(libc::SIGTERM)
        }
        #[cfg(not(unix))]
        {
            false
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(c), _) => write!(f, "code {}", c),
            (None, Some(s)) => write!(f, "signal {}", s),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// A freshly spawned gateway, as seen by the supervisor.
///
/// The process itself is owned by whatever task the launcher set up; the supervisor only
/// gets a way to ask for termination and a notification when the process is gone.
pub struct SpawnedGateway {
    pub pid: Option<u32>,
    /// Each message asks for graceful termination.
    pub terminate: mpsc::UnboundedSender<()>,
    /// Resolves once the process has exited.
    pub exited: oneshot::Receiver<ExitInfo>,
}

/// Starts gateway processes. Swapped out for fakes in tests.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self) -> std::io::Result<SpawnedGateway>;
}

/// Launches `openclaw gateway run` with the shaped child environment.
pub struct ProcessLauncher {
    cli: CliCommand,
    env: Arc<ChildEnv>,
    target: ProxyTarget,
    token: String,
}

impl ProcessLauncher {
    pub fn new(cli: CliCommand, env: Arc<ChildEnv>, target: ProxyTarget, token: String) -> Self {
        Self {
            cli,
            env,
            target,
            token,
        }
    }

    /// Arguments after the CLI prefix.
    pub fn gateway_args(&self) -> Vec<String> {
        vec![
            "gateway".to_string(),
            "run".to_string(),
            "--bind".to_string(),
            self.target.bind_mode().to_string(),
            "--port".to_string(),
            self.target.port.to_string(),
            "--auth".to_string(),
            "token".to_string(),
            "--token".to_string(),
            self.token.clone(),
        ]
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self) -> std::io::Result<SpawnedGateway> {
        let mut cmd = ProcessRunner::command(&self.cli, &self.env, &self.gateway_args());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()?;
        let pid = child.id();
        log::info!("spawned gateway (pid {:?}) for {}", pid, self.target);

        if let Some(out) = child.stdout.take() {
            tokio::spawn(forward_lines(out));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(forward_lines(err));
        }

        let (terminate_tx, terminate_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(watch_child(child, terminate_rx, exit_tx));
        Ok(SpawnedGateway {
            pid,
            terminate: terminate_tx,
            exited: exit_rx,
        })
    }
}

/// Owns the child until it exits, honoring termination requests along the way.
async fn watch_child(
    mut child: Child,
    mut terminate: mpsc::UnboundedReceiver<()>,
    exited: oneshot::Sender<ExitInfo>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            req = terminate.recv() => {
                if req.is_none() {
                    // Supervisor let go of the handle; keep waiting for the exit.
                    break child.wait().await;
                }
                send_terminate(&mut child);
            }
        }
    };
    let info = match status {
        Ok(s) => ExitInfo::from_status(s),
        Err(e) => {
            log::warn!("waiting for gateway process failed: {}", e);
            ExitInfo::unknown()
        }
    };
    let _ = exited.send(info);
}

fn send_terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                log::warn!(
                    "SIGTERM to gateway pid {} failed: {}",
                    pid,
                    std::io::Error::last_os_error()
                );
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = child.start_kill() {
            log::warn!("killing gateway failed: {}", e);
        }
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log::info!("[gateway] {}", line);
    }
}
