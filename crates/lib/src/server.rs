//! Public HTTP server: setup surface, voice webhook, and the catch-all gateway proxy on one port.

use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    response::Response,
    routing::any,
    Router,
};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{EnvResolver, ProxyTarget, WrapperConfig};
use crate::exec::{ChildEnv, CommandRunner, ProcessRunner};
use crate::proxy::ReverseProxy;
use crate::setup::{self, auth::SetupAuth, redact::Redactor, CONSOLE_TIMEOUT};
use crate::supervisor::{HttpProbe, ProcessLauncher, Supervisor, SupervisorOptions};

/// Per-request timeout of a readiness probe.
const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_millis(1500);

/// Shared by every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<WrapperConfig>,
    pub supervisor: Supervisor,
    /// Unbounded runner for onboarding.
    pub runner: Arc<dyn CommandRunner>,
    /// Time-limited runner for status and console commands.
    pub console_runner: Arc<dyn CommandRunner>,
    pub proxy: Arc<ReverseProxy>,
    pub redactor: Arc<Redactor>,
    /// Serializes mutating admin operations (onboarding, config writes, reset, import).
    pub admin_lock: Arc<tokio::sync::Mutex<()>>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire up the real process launcher, HTTP probe, and CLI runner.
    pub fn new(config: WrapperConfig, env: &EnvResolver) -> Result<Self> {
        let child_env = Arc::new(ChildEnv::from_resolver(env, &config));
        let runner = ProcessRunner::new(config.cli.clone(), child_env.clone());
        let launcher = ProcessLauncher::new(
            config.cli.clone(),
            child_env,
            config.gateway.clone(),
            config.gateway_token.clone(),
        );
        let runner: Arc<dyn CommandRunner> = Arc::new(runner);
        let supervisor = Supervisor::new(
            SupervisorOptions::new(
                config.config_path.clone(),
                config.gateway.clone(),
                config.gateway_token.clone(),
            ),
            Arc::new(launcher),
            Arc::new(HttpProbe::new(PROBE_REQUEST_TIMEOUT)),
            runner.clone(),
        );
        let console_runner = Arc::new(
            ProcessRunner::new(config.cli.clone(), Arc::new(ChildEnv::from_resolver(env, &config)))
                .with_timeout(CONSOLE_TIMEOUT),
        );
        Self::assemble(config, supervisor, runner, console_runner)
    }

    /// Build state around an existing supervisor and runners (tests pass fakes here).
    pub fn assemble(
        config: WrapperConfig,
        supervisor: Supervisor,
        runner: Arc<dyn CommandRunner>,
        console_runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let voice = ProxyTarget::new(config.gateway.host.clone(), config.voice_webhook_port);
        let proxy = ReverseProxy::new(
            supervisor.clone(),
            config.gateway.clone(),
            voice,
            config.gateway_token.clone(),
        )
        .context("building proxy client")?;
        let redactor = Redactor::new([config.gateway_token.clone()]);
        Ok(Self {
            config: Arc::new(config),
            supervisor,
            runner,
            console_runner,
            proxy: Arc::new(proxy),
            redactor: Arc::new(redactor),
            admin_lock: Arc::new(tokio::sync::Mutex::new(())),
            started_at: Instant::now(),
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let auth = SetupAuth::new(state.config.setup_password.clone());
    Router::new()
        .merge(setup::routes(auth))
        .route("/voice/webhook", any(voice_webhook))
        .fallback(proxy_fallback)
        .with_state(state)
}

async fn voice_webhook(State(state): State<AppState>, req: Request) -> Response {
    state.proxy.handle_voice_webhook(req).await
}

async fn proxy_fallback(State(state): State<AppState>, req: Request) -> Response {
    state.proxy.handle(req).await
}

/// Serve on `listener` until `shutdown` resolves, then stop the gateway.
pub async fn serve<F>(listener: tokio::net::TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let supervisor = state.supervisor.clone();
    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("wrapper server exited")?;
    supervisor.stop().await;
    log::info!("gateway stopped");
    Ok(())
}

/// Bind the public port, start the gateway in the background when configured, and serve.
pub async fn run_server(state: AppState) -> Result<()> {
    let config = state.config.clone();
    if !config.setup_password.as_deref().is_some_and(|p| !p.is_empty()) {
        log::warn!("SETUP_PASSWORD is not set; /setup will refuse requests");
    }
    log::info!(
        "state dir {}, workspace {}, config {}",
        config.state_dir.display(),
        config.workspace_dir.display(),
        config.config_path.display()
    );

    let bind_addr = format!("0.0.0.0:{}", config.listen_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("listening on {} (gateway target {})", bind_addr, config.gateway);

    if config.is_configured() {
        let supervisor = state.supervisor.clone();
        tokio::spawn(async move {
            if let Err(e) = supervisor.ensure_running().await {
                log::warn!("initial gateway start failed: {}", e);
            }
        });
    } else {
        log::info!("not configured yet; open /setup to run onboarding");
    }

    serve(listener, state, shutdown_signal()).await
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, stopping gateway and draining connections");
}
