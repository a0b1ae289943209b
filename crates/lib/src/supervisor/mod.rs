//! Gateway supervisor: the single owner of the openclaw gateway child process.
//!
//! States are explicit (see [`State`]). At most one start attempt exists at any time; concurrent
//! [`Supervisor::ensure_running`] callers join the same attempt. The attempt body runs in its own
//! task, so a caller going away (e.g. an HTTP client disconnecting) never strands a half-done start.
//!
//! An attempt is: sync config (best effort) → spawn `gateway run` → poll readiness. A readiness
//! timeout fails the attempt but leaves the child running (state `Unready`); the next
//! `ensure_running` re-polls instead of spawning again. A child exit at any point clears the
//! state back to `Stopped`.
//!
//! Stopping an in-flight attempt cancels it and waits for it to settle. An attempt begun while a
//! cancelled one is still winding down waits for it first, so sync commands and spawns never
//! overlap.

mod launcher;
mod probe;
mod sync;

pub use launcher::{ExitInfo, Launcher, ProcessLauncher, SpawnedGateway};
pub use probe::{HttpProbe, ReadinessProbe, PROBE_PATHS};
pub use sync::{sync_commands, sync_gateway_config, SyncStep};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use crate::config::ProxyTarget;
use crate::exec::CommandRunner;

/// Why the gateway is not (yet) usable. `Clone` so every joined caller gets the same value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("gateway not configured (missing {})", .0.display())]
    NotConfigured(PathBuf),
    #[error("failed to spawn gateway: {0}")]
    Spawn(String),
    #[error("gateway did not become ready within {timeout:?}: {last_error}")]
    ReadinessTimeout { timeout: Duration, last_error: String },
    #[error("gateway exited during startup ({0})")]
    Exited(ExitInfo),
    #[error("gateway start cancelled by stop")]
    Cancelled,
    #[error("gateway supervisor error: {0}")]
    Internal(String),
}

/// Timing and location settings for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// openclaw config file; the gateway is never started while it is missing.
    pub config_path: PathBuf,
    pub target: ProxyTarget,
    pub token: String,
    /// Overall readiness budget per attempt.
    pub ready_timeout: Duration,
    /// Pause between probe cycles.
    pub poll_interval: Duration,
    /// How long stop/restart waits after asking the child to terminate.
    pub stop_grace: Duration,
}

impl SupervisorOptions {
    pub fn new(config_path: PathBuf, target: ProxyTarget, token: String) -> Self {
        Self {
            config_path,
            target,
            token,
            ready_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
            stop_grace: Duration::from_millis(750),
        }
    }
}

type AttemptFuture = Shared<BoxFuture<'static, Result<(), SupervisorError>>>;

/// The supervisor's view of one live child.
#[derive(Clone)]
struct ProcessHandle {
    spawn_id: u64,
    pid: Option<u32>,
    terminate: mpsc::UnboundedSender<()>,
    exit: watch::Receiver<Option<ExitInfo>>,
    stop_requested: Arc<AtomicBool>,
}

impl ProcessHandle {
    fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        let _ = self.terminate.send(());
    }

    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Wait until the child is gone (or `limit` elapses).
    async fn wait_exit(&self, limit: Duration) {
        let mut rx = self.exit.clone();
        let _ = tokio::time::timeout(limit, rx.wait_for(|e| e.is_some())).await;
    }
}

enum State {
    Stopped,
    /// An attempt is in flight; `process` is set once the child has been spawned.
    Starting {
        attempt_id: u64,
        attempt: AttemptFuture,
        cancel: watch::Sender<bool>,
        process: Option<ProcessHandle>,
    },
    Running {
        process: ProcessHandle,
    },
    /// Readiness timed out but the child is still alive.
    Unready {
        process: ProcessHandle,
    },
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Stopped => "stopped",
            State::Starting { .. } => "starting",
            State::Running { .. } => "running",
            State::Unready { .. } => "unready",
        }
    }

    fn process(&self) -> Option<&ProcessHandle> {
        match self {
            State::Stopped => None,
            State::Starting { process, .. } => process.as_ref(),
            State::Running { process } | State::Unready { process } => Some(process),
        }
    }
}

/// Point-in-time view for health and status endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    pub state: &'static str,
    pub running: bool,
    pub pid: Option<u32>,
    pub target: String,
    pub last_sync: Vec<SyncStep>,
}

struct Inner {
    options: SupervisorOptions,
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn ReadinessProbe>,
    runner: Arc<dyn CommandRunner>,
    state: Mutex<State>,
    /// A cancelled attempt that has not settled yet. Lock order: `state` before `retiring`.
    retiring: Mutex<Option<(u64, AttemptFuture)>>,
    last_sync: Mutex<Vec<SyncStep>>,
    next_id: AtomicU64,
}

/// Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        options: SupervisorOptions,
        launcher: Arc<dyn Launcher>,
        probe: Arc<dyn ReadinessProbe>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                launcher,
                probe,
                runner,
                state: Mutex::new(State::Stopped),
                retiring: Mutex::new(None),
                last_sync: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.inner.options
    }

    pub fn is_configured(&self) -> bool {
        self.inner.options.config_path.exists()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn retiring(&self) -> MutexGuard<'_, Option<(u64, AttemptFuture)>> {
        self.inner.retiring.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn status(&self) -> GatewayStatus {
        let (state, pid) = {
            let guard = self.state();
            (guard.name(), guard.process().and_then(|p| p.pid))
        };
        let last_sync = self
            .inner
            .last_sync
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        GatewayStatus {
            state,
            running: state == "running",
            pid,
            target: self.inner.options.target.to_string(),
            last_sync,
        }
    }

    /// Start the gateway if needed and wait until it serves HTTP.
    ///
    /// No-op when already running; joins the in-flight attempt when one exists.
    pub async fn ensure_running(&self) -> Result<(), SupervisorError> {
        if !self.is_configured() {
            return Err(SupervisorError::NotConfigured(
                self.inner.options.config_path.clone(),
            ));
        }
        let attempt = {
            let mut state = self.state();
            match &*state {
                State::Running { process } => {
                    log::debug!("gateway already running (pid {:?})", process.pid);
                    return Ok(());
                }
                State::Starting { attempt, .. } => attempt.clone(),
                State::Unready { process } => {
                    let process = process.clone();
                    self.begin_attempt(&mut state, Some(process))
                }
                State::Stopped => self.begin_attempt(&mut state, None),
            }
        };
        attempt.await
    }

    /// Install a new `Starting` state. Caller holds the state lock.
    fn begin_attempt(&self, state: &mut State, existing: Option<ProcessHandle>) -> AttemptFuture {
        let attempt_id = self.next_id();
        let (cancel, cancelled) = watch::channel(false);
        let previous = self.retiring().as_ref().map(|(_, attempt)| attempt.clone());
        let task = tokio::spawn(self.clone().run_attempt(
            attempt_id,
            existing.clone(),
            previous,
            cancelled,
        ));
        let attempt = async move {
            task.await
                .unwrap_or_else(|e| Err(SupervisorError::Internal(format!("start task failed: {}", e))))
        }
        .boxed()
        .shared();
        *state = State::Starting {
            attempt_id,
            attempt: attempt.clone(),
            cancel,
            process: existing,
        };
        attempt
    }

    async fn run_attempt(
        self,
        attempt_id: u64,
        existing: Option<ProcessHandle>,
        previous: Option<AttemptFuture>,
        mut cancelled: watch::Receiver<bool>,
    ) -> Result<(), SupervisorError> {
        if let Some(previous) = previous {
            log::debug!("waiting for the cancelled gateway start to settle");
            let _ = previous.await;
        }
        let cancelled_early = *cancelled.borrow();
        if cancelled_early {
            return Err(SupervisorError::Cancelled);
        }
        let process = match existing {
            Some(process) => {
                log::info!("re-checking readiness of gateway (pid {:?})", process.pid);
                process
            }
            None => self.spawn(attempt_id, &cancelled).await?,
        };

        match self.wait_ready(&process, &mut cancelled).await {
            Ok(()) => {
                let mut state = self.state();
                if matches!(&*state, State::Starting { attempt_id: id, .. } if *id == attempt_id) {
                    *state = State::Running {
                        process: process.clone(),
                    };
                    log::info!(
                        "gateway ready at {} (pid {:?})",
                        self.inner.options.target,
                        process.pid
                    );
                    Ok(())
                } else {
                    // stop() or an exit replaced us while the last probe was in flight.
                    Err(SupervisorError::Cancelled)
                }
            }
            Err(e) => {
                if e == SupervisorError::Cancelled || process.stop_requested.load(Ordering::SeqCst) {
                    return Err(SupervisorError::Cancelled);
                }
                let mut state = self.state();
                if matches!(&*state, State::Starting { attempt_id: id, .. } if *id == attempt_id) {
                    *state = if process.has_exited() {
                        State::Stopped
                    } else {
                        State::Unready {
                            process: process.clone(),
                        }
                    };
                }
                drop(state);
                log::warn!("gateway start failed: {}", e);
                Err(e)
            }
        }
    }

    /// Sync config and spawn the child, recording it in the `Starting` state.
    async fn spawn(
        &self,
        attempt_id: u64,
        cancelled: &watch::Receiver<bool>,
    ) -> Result<ProcessHandle, SupervisorError> {
        let opts = &self.inner.options;
        let report = sync_gateway_config(self.inner.runner.as_ref(), &opts.token, &opts.target, || {
            *cancelled.borrow()
        })
        .await;
        *self.inner.last_sync.lock().unwrap_or_else(|e| e.into_inner()) = report;
        let cancelled_now = *cancelled.borrow();
        if cancelled_now {
            log::info!("gateway start cancelled before spawn");
            return Err(SupervisorError::Cancelled);
        }

        let spawned = match self.inner.launcher.launch().await {
            Ok(s) => s,
            Err(e) => {
                log::error!("failed to spawn gateway: {}", e);
                self.clear_attempt(attempt_id);
                return Err(SupervisorError::Spawn(e.to_string()));
            }
        };
        let process = self.adopt(spawned);

        let recorded = {
            let mut state = self.state();
            match &mut *state {
                State::Starting {
                    attempt_id: id,
                    process: slot,
                    ..
                } if *id == attempt_id => {
                    *slot = Some(process.clone());
                    true
                }
                _ => false,
            }
        };
        if !recorded {
            log::info!("gateway start superseded; terminating pid {:?}", process.pid);
            process.request_stop();
            process.wait_exit(opts.stop_grace).await;
            return Err(SupervisorError::Cancelled);
        }
        Ok(process)
    }

    /// Wrap a spawned child in a handle and watch for its exit.
    fn adopt(&self, spawned: SpawnedGateway) -> ProcessHandle {
        let (exit_tx, exit_rx) = watch::channel(None);
        let process = ProcessHandle {
            spawn_id: self.next_id(),
            pid: spawned.pid,
            terminate: spawned.terminate,
            exit: exit_rx,
            stop_requested: Arc::new(AtomicBool::new(false)),
        };
        let supervisor = self.clone();
        let spawn_id = process.spawn_id;
        let stop_requested = process.stop_requested.clone();
        let pid = process.pid;
        let exited = spawned.exited;
        tokio::spawn(async move {
            let info = exited.await.unwrap_or_else(|_| ExitInfo::unknown());
            let _ = exit_tx.send(Some(info));
            if stop_requested.load(Ordering::SeqCst) || info.is_expected() {
                log::info!("gateway (pid {:?}) exited ({})", pid, info);
            } else {
                log::error!("gateway (pid {:?}) exited unexpectedly ({})", pid, info);
            }
            supervisor.on_exit(spawn_id);
        });
        process
    }

    /// Exit callback: forget the process (and any attempt built on it).
    fn on_exit(&self, spawn_id: u64) {
        let mut state = self.state();
        if state.process().map(|p| p.spawn_id) == Some(spawn_id) {
            *state = State::Stopped;
        }
    }

    fn clear_attempt(&self, attempt_id: u64) {
        let mut state = self.state();
        if matches!(&*state, State::Starting { attempt_id: id, .. } if *id == attempt_id) {
            *state = State::Stopped;
        }
    }

    /// Poll until the gateway answers HTTP, the child exits, the attempt is cancelled, or the
    /// timeout elapses.
    async fn wait_ready(
        &self,
        process: &ProcessHandle,
        cancelled: &mut watch::Receiver<bool>,
    ) -> Result<(), SupervisorError> {
        let opts = &self.inner.options;
        let deadline = Instant::now() + opts.ready_timeout;
        let mut exit = process.exit.clone();
        loop {
            let exited = *exit.borrow();
            if let Some(info) = exited {
                return Err(SupervisorError::Exited(info));
            }
            let probed = tokio::select! {
                probed = self.inner.probe.probe(&opts.target) => probed,
                _ = cancellation(cancelled) => return Err(SupervisorError::Cancelled),
            };
            let last_error = match probed {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            let now = Instant::now();
            if now >= deadline {
                return Err(SupervisorError::ReadinessTimeout {
                    timeout: opts.ready_timeout,
                    last_error,
                });
            }
            let pause = opts.poll_interval.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = cancellation(cancelled) => return Err(SupervisorError::Cancelled),
                changed = exit.changed() => {
                    if changed.is_err() {
                        return Err(SupervisorError::Exited(ExitInfo::unknown()));
                    }
                }
            }
        }
    }

    /// Ask the child to terminate, wait out the grace period, and forget it. An in-flight
    /// attempt is cancelled and awaited; its current sync command is allowed to finish.
    pub async fn stop(&self) {
        let (process, attempt) = {
            let mut state = self.state();
            match std::mem::replace(&mut *state, State::Stopped) {
                State::Stopped => (None, None),
                State::Starting {
                    attempt_id,
                    attempt,
                    cancel,
                    process,
                } => {
                    cancel.send_replace(true);
                    *self.retiring() = Some((attempt_id, attempt.clone()));
                    (process, Some((attempt_id, attempt)))
                }
                State::Running { process } | State::Unready { process } => (Some(process), None),
            }
        };
        if let Some(process) = &process {
            log::info!("stopping gateway (pid {:?})", process.pid);
            process.request_stop();
        }
        if let Some((attempt_id, attempt)) = attempt {
            log::info!("waiting for the in-flight gateway start to wind down");
            let _ = attempt.await;
            let mut retiring = self.retiring();
            if retiring.as_ref().map(|(id, _)| *id) == Some(attempt_id) {
                *retiring = None;
            }
        }
        if let Some(process) = process {
            process.wait_exit(self.inner.options.stop_grace).await;
        }
    }

    /// Stop (if running) then start again.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        self.stop().await;
        self.ensure_running().await
    }
}

/// Completes once the attempt is cancelled; never completes if the sender is gone.
async fn cancellation(cancelled: &mut watch::Receiver<bool>) {
    let result = cancelled.wait_for(|c| *c).await.map(|_| ());
    if result.is_err() {
        std::future::pending::<()>().await;
    }
}
