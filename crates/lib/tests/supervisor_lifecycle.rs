//! Supervisor lifecycle against fake launchers and probes (no real openclaw binary needed).

use async_trait::async_trait;
use clawhost::config::ProxyTarget;
use clawhost::exec::{CommandOutput, CommandRunner};
use clawhost::supervisor::{
    ExitInfo, HttpProbe, Launcher, ReadinessProbe, SpawnedGateway, Supervisor, SupervisorError,
    SupervisorOptions,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("clawhost-supervisor-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Config path inside a fresh temp dir; written only when `configured`.
fn config_path(configured: bool) -> PathBuf {
    let path = temp_dir().join("openclaw.json");
    if configured {
        std::fs::write(&path, "{}").expect("write config");
    }
    path
}

struct OkRunner;

#[async_trait]
impl CommandRunner for OkRunner {
    async fn run(&self, _args: &[String]) -> CommandOutput {
        CommandOutput {
            code: 0,
            output: String::new(),
        }
    }
}

/// Each command takes a while; tracks how many run at once.
#[derive(Default)]
struct SlowRunner {
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl CommandRunner for SlowRunner {
    async fn run(&self, _args: &[String]) -> CommandOutput {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        CommandOutput {
            code: 0,
            output: String::new(),
        }
    }
}

/// Stand-in for `openclaw gateway run`.
#[derive(Default)]
struct FakeLauncher {
    spawns: AtomicUsize,
    fail: AtomicBool,
    /// Child exits on its own with code 1 after this long.
    exit_after: Option<Duration>,
    /// Child serves HTTP 404s on this port after a delay.
    serve_on: Option<(u16, Duration)>,
    /// One sender per spawned child; sending an exit code crashes it.
    crash: Mutex<Vec<mpsc::UnboundedSender<i32>>>,
}

impl FakeLauncher {
    fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    fn crash_latest(&self, code: i32) {
        let crash = self.crash.lock().unwrap();
        crash.last().expect("a spawned child").send(code).unwrap();
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self) -> std::io::Result<SpawnedGateway> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "openclaw: not found",
            ));
        }
        let n = self.spawns.fetch_add(1, Ordering::SeqCst) as u32;
        let (terminate, mut term_rx) = mpsc::unbounded_channel::<()>();
        let (crash_tx, mut crash_rx) = mpsc::unbounded_channel::<i32>();
        let (exit_tx, exited) = oneshot::channel();
        self.crash.lock().unwrap().push(crash_tx);

        let server = self.serve_on.map(|(port, delay)| {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
                    .await
                    .expect("bind fake gateway port");
                let app = axum::Router::new()
                    .fallback(|| async { axum::http::StatusCode::NOT_FOUND });
                let _ = axum::serve(listener, app).await;
            })
        });
        let exit_after = self.exit_after;
        tokio::spawn(async move {
            let self_exit = async {
                match exit_after {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending::<()>().await,
                }
            };
            let info = tokio::select! {
                _ = term_rx.recv() => ExitInfo { code: Some(0), signal: None },
                Some(code) = crash_rx.recv() => ExitInfo { code: Some(code), signal: None },
                _ = self_exit => ExitInfo { code: Some(1), signal: None },
            };
            if let Some(server) = server {
                server.abort();
            }
            let _ = exit_tx.send(info);
        });
        Ok(SpawnedGateway {
            pid: Some(4000 + n),
            terminate,
            exited,
        })
    }
}

/// Ready after a fixed delay per probe.
struct SlowReady(Duration);

#[async_trait]
impl ReadinessProbe for SlowReady {
    async fn probe(&self, _target: &ProxyTarget) -> Result<(), String> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

struct NeverReady;

#[async_trait]
impl ReadinessProbe for NeverReady {
    async fn probe(&self, target: &ProxyTarget) -> Result<(), String> {
        Err(format!("{}: connection refused", target))
    }
}

fn supervisor(
    config_path: PathBuf,
    target: ProxyTarget,
    launcher: Arc<FakeLauncher>,
    probe: Arc<dyn ReadinessProbe>,
    ready_timeout: Duration,
) -> Supervisor {
    let mut options = SupervisorOptions::new(config_path, target, "test-token".to_string());
    options.ready_timeout = ready_timeout;
    options.poll_interval = Duration::from_millis(20);
    options.stop_grace = Duration::from_millis(100);
    Supervisor::new(options, launcher, probe, Arc::new(OkRunner))
}

fn local_target() -> ProxyTarget {
    ProxyTarget::new("127.0.0.1", free_port())
}

#[tokio::test]
async fn concurrent_callers_share_one_spawn() {
    let launcher = Arc::new(FakeLauncher::default());
    let sup = supervisor(
        config_path(true),
        local_target(),
        launcher.clone(),
        Arc::new(SlowReady(Duration::from_millis(100))),
        Duration::from_secs(5),
    );

    let calls: Vec<_> = (0..16)
        .map(|_| {
            let sup = sup.clone();
            tokio::spawn(async move { sup.ensure_running().await })
        })
        .collect();
    for call in calls {
        assert_eq!(call.await.unwrap(), Ok(()));
    }
    assert_eq!(launcher.spawns(), 1);
    assert_eq!(sup.status().state, "running");
}

#[tokio::test]
async fn concurrent_callers_share_one_failure() {
    let launcher = Arc::new(FakeLauncher::default());
    let sup = supervisor(
        config_path(true),
        local_target(),
        launcher.clone(),
        Arc::new(NeverReady),
        Duration::from_millis(200),
    );
    let results: Vec<_> = futures_util::future::join_all((0..8).map(|_| sup.ensure_running())).await;
    assert_eq!(launcher.spawns(), 1);
    let first = results[0].clone().unwrap_err();
    assert!(matches!(first, SupervisorError::ReadinessTimeout { .. }));
    assert!(results.iter().all(|r| r.as_ref().err() == Some(&first)));
}

#[tokio::test]
async fn missing_config_never_spawns() {
    let launcher = Arc::new(FakeLauncher::default());
    let sup = supervisor(
        config_path(false),
        local_target(),
        launcher.clone(),
        Arc::new(SlowReady(Duration::ZERO)),
        Duration::from_secs(1),
    );
    let results = futures_util::future::join_all((0..4).map(|_| sup.ensure_running())).await;
    for r in results {
        assert!(matches!(r, Err(SupervisorError::NotConfigured(_))));
    }
    assert!(matches!(sup.restart().await, Err(SupervisorError::NotConfigured(_))));
    assert_eq!(launcher.spawns(), 0);
    assert_eq!(sup.status().state, "stopped");
}

#[tokio::test]
async fn restart_when_stopped_is_a_plain_start() {
    let launcher = Arc::new(FakeLauncher::default());
    let sup = supervisor(
        config_path(true),
        local_target(),
        launcher.clone(),
        Arc::new(SlowReady(Duration::ZERO)),
        Duration::from_secs(1),
    );
    sup.restart().await.unwrap();
    assert_eq!(launcher.spawns(), 1);
    assert_eq!(sup.status().state, "running");
    assert_eq!(sup.status().pid, Some(4000));

    sup.restart().await.unwrap();
    assert_eq!(launcher.spawns(), 2);
    assert_eq!(sup.status().pid, Some(4001));
}

#[tokio::test]
async fn any_http_response_counts_as_ready() {
    let port = free_port();
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let app = axum::Router::new().fallback(|| async { axum::http::StatusCode::NOT_FOUND });
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let launcher = Arc::new(FakeLauncher::default());
    let sup = supervisor(
        config_path(true),
        ProxyTarget::new("127.0.0.1", port),
        launcher.clone(),
        Arc::new(HttpProbe::new(Duration::from_millis(500))),
        Duration::from_secs(5),
    );
    let started = Instant::now();
    sup.ensure_running().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(sup.status().state, "running");
}

#[tokio::test]
async fn readiness_timeout_keeps_the_child() {
    let launcher = Arc::new(FakeLauncher::default());
    let timeout = Duration::from_millis(300);
    let sup = supervisor(
        config_path(true),
        local_target(),
        launcher.clone(),
        Arc::new(HttpProbe::new(Duration::from_millis(100))),
        timeout,
    );
    let started = Instant::now();
    let err = sup.ensure_running().await.unwrap_err();
    assert!(started.elapsed() >= timeout);
    match err {
        SupervisorError::ReadinessTimeout { last_error, .. } => assert!(!last_error.is_empty()),
        other => panic!("expected readiness timeout, got {:?}", other),
    }
    let status = sup.status();
    assert_eq!(status.state, "unready");
    assert_eq!(status.pid, Some(4000));

    // Retrying re-polls the same child instead of spawning a second one.
    let _ = sup.ensure_running().await;
    assert_eq!(launcher.spawns(), 1);
}

#[tokio::test]
async fn unexpected_exit_clears_state() {
    let launcher = Arc::new(FakeLauncher::default());
    let sup = supervisor(
        config_path(true),
        local_target(),
        launcher.clone(),
        Arc::new(SlowReady(Duration::ZERO)),
        Duration::from_secs(1),
    );
    sup.ensure_running().await.unwrap();
    launcher.crash_latest(1);

    let deadline = Instant::now() + Duration::from_secs(2);
    while sup.status().state != "stopped" {
        assert!(Instant::now() < deadline, "exit was never observed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    sup.ensure_running().await.unwrap();
    assert_eq!(launcher.spawns(), 2);
}

#[tokio::test]
async fn exit_during_readiness_fails_fast() {
    let launcher = Arc::new(FakeLauncher {
        exit_after: Some(Duration::from_millis(50)),
        ..Default::default()
    });
    let sup = supervisor(
        config_path(true),
        local_target(),
        launcher.clone(),
        Arc::new(NeverReady),
        Duration::from_secs(10),
    );
    let started = Instant::now();
    let err = sup.ensure_running().await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(
        err,
        SupervisorError::Exited(ExitInfo {
            code: Some(1),
            signal: None
        })
    );
    assert_eq!(sup.status().state, "stopped");
}

#[tokio::test]
async fn spawn_failure_is_reported_and_not_retried() {
    let launcher = Arc::new(FakeLauncher::default());
    launcher.fail.store(true, Ordering::SeqCst);
    let sup = supervisor(
        config_path(true),
        local_target(),
        launcher.clone(),
        Arc::new(SlowReady(Duration::ZERO)),
        Duration::from_secs(1),
    );
    let err = sup.ensure_running().await.unwrap_err();
    assert!(matches!(err, SupervisorError::Spawn(ref m) if m.contains("not found")));
    assert_eq!(sup.status().state, "stopped");

    launcher.fail.store(false, Ordering::SeqCst);
    sup.ensure_running().await.unwrap();
    assert_eq!(launcher.spawns(), 1);
}

#[tokio::test]
async fn stop_during_start_cancels_the_attempt() {
    let launcher = Arc::new(FakeLauncher::default());
    let sup = supervisor(
        config_path(true),
        local_target(),
        launcher.clone(),
        Arc::new(NeverReady),
        Duration::from_secs(10),
    );
    let pending = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.ensure_running().await })
    };
    let deadline = Instant::now() + Duration::from_secs(2);
    while sup.status().pid.is_none() {
        assert!(Instant::now() < deadline, "child never spawned");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    sup.stop().await;
    assert_eq!(sup.status().state, "stopped");
    assert_eq!(pending.await.unwrap(), Err(SupervisorError::Cancelled));
}

#[tokio::test]
async fn delayed_gateway_becomes_ready() {
    let port = free_port();
    let launcher = Arc::new(FakeLauncher {
        serve_on: Some((port, Duration::from_millis(300))),
        ..Default::default()
    });
    let sup = supervisor(
        config_path(true),
        ProxyTarget::new("127.0.0.1", port),
        launcher.clone(),
        Arc::new(HttpProbe::new(Duration::from_millis(500))),
        Duration::from_secs(10),
    );
    sup.ensure_running().await.unwrap();
    let status = sup.status();
    assert_eq!(status.state, "running");
    assert_eq!(status.pid, Some(4000));
    assert_eq!(status.last_sync.len(), 5);
    assert!(status.last_sync.iter().all(|s| s.ok));
    sup.stop().await;
}

#[tokio::test]
async fn restart_during_config_sync_waits_for_the_cancelled_attempt() {
    let launcher = Arc::new(FakeLauncher::default());
    let runner = Arc::new(SlowRunner {
        delay: Duration::from_millis(30),
        ..Default::default()
    });
    let mut options =
        SupervisorOptions::new(config_path(true), local_target(), "test-token".to_string());
    options.ready_timeout = Duration::from_secs(2);
    options.poll_interval = Duration::from_millis(20);
    options.stop_grace = Duration::from_millis(100);
    let sup = Supervisor::new(
        options,
        launcher.clone(),
        Arc::new(SlowReady(Duration::ZERO)),
        runner.clone(),
    );

    let first = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.ensure_running().await })
    };
    tokio::time::sleep(Duration::from_millis(40)).await;
    let restarted = sup.restart().await;

    assert_eq!(first.await.unwrap(), Err(SupervisorError::Cancelled));
    assert_eq!(restarted, Ok(()));
    assert_eq!(launcher.spawns(), 1);
    assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);
    // The cancelled attempt stopped after its in-flight step; the new one ran all five.
    assert!(runner.calls.load(Ordering::SeqCst) < 10);
    assert_eq!(sup.status().state, "running");
}

#[tokio::test]
async fn start_during_stop_waits_for_the_cancelled_attempt() {
    let launcher = Arc::new(FakeLauncher::default());
    let runner = Arc::new(SlowRunner {
        delay: Duration::from_millis(30),
        ..Default::default()
    });
    let mut options =
        SupervisorOptions::new(config_path(true), local_target(), "test-token".to_string());
    options.ready_timeout = Duration::from_secs(2);
    options.stop_grace = Duration::from_millis(100);
    let sup = Supervisor::new(
        options,
        launcher.clone(),
        Arc::new(SlowReady(Duration::ZERO)),
        runner.clone(),
    );

    let first = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.ensure_running().await })
    };
    tokio::time::sleep(Duration::from_millis(40)).await;
    let stopping = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.stop().await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    // A caller arriving while the cancelled attempt winds down must not overlap with it.
    sup.ensure_running().await.unwrap();
    stopping.await.unwrap();

    assert_eq!(first.await.unwrap(), Err(SupervisorError::Cancelled));
    assert_eq!(launcher.spawns(), 1);
    assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);
}
