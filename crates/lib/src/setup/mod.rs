//! Setup/admin HTTP surface under `/setup`: wizard, status, onboarding, raw config editing,
//! debug console, pairing, reset, and export/import. Everything except `/setup/healthz`
//! sits behind Basic auth.

pub mod auth;
pub mod backup;
pub mod console;
pub mod onboard;
pub mod providers;
pub mod redact;

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Query, State},
    http::{header, StatusCode},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::exec::args;
use crate::server::AppState;
use crate::supervisor::SupervisorError;
use auth::SetupAuth;
use console::{ConsoleAction, ConsoleRequest, GatewayOp};
use onboard::OnboardRequest;

const SETUP_HTML: &str = include_str!("../../assets/setup.html");
const APP_JS: &str = include_str!("../../assets/app.js");

/// Largest accepted import archive.
pub const IMPORT_BODY_LIMIT: usize = 512 * 1024 * 1024;

/// Upper bound for a single console command.
pub const CONSOLE_TIMEOUT: Duration = Duration::from_secs(60);

pub fn routes(auth: SetupAuth) -> Router<AppState> {
    let protected = Router::new()
        .route("/setup", get(page))
        .route("/setup/", get(page))
        .route("/setup/app.js", get(app_js))
        .route("/setup/api/status", get(status))
        .route("/setup/api/run", post(run_setup))
        .route("/setup/api/config/raw", get(read_config).post(write_config))
        .route("/setup/api/console/run", post(console_run))
        .route("/setup/api/pairing", get(pairing_list))
        .route("/setup/api/pairing/approve", post(pairing_approve))
        .route("/setup/api/reset", post(reset))
        .route("/setup/export", get(export))
        .route(
            "/setup/import",
            post(import).layer(DefaultBodyLimit::max(IMPORT_BODY_LIMIT)),
        )
        .route_layer(middleware::from_fn_with_state(auth, auth::require_password));

    Router::new()
        .route("/setup/healthz", get(healthz))
        .merge(protected)
}

fn error_json(status: StatusCode, error: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "ok": false, "error": error.to_string() }))).into_response()
}

fn restart_json(result: &Result<(), SupervisorError>) -> Value {
    match result {
        Ok(()) => json!({ "ok": true }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    }
}

/// Resident set size of this process, where the platform exposes it.
fn rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

/// `VmRSS:    1234 kB` to bytes.
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    let gateway = state.supervisor.status();
    Json(json!({
        "ok": true,
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "pid": std::process::id(),
        "memory": { "rssBytes": rss_bytes() },
        "configured": state.config.is_configured(),
        "gateway": gateway,
    }))
}

async fn page() -> Html<&'static str> {
    Html(SETUP_HTML)
}

async fn app_js() -> Response {
    (
        [(header::CONTENT_TYPE, "application/javascript; charset=utf-8")],
        APP_JS,
    )
        .into_response()
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let version_args = args(["--version"]);
    let help_args = args(["channels", "add", "--help"]);
    let (version, help) = tokio::join!(
        state.console_runner.run(&version_args),
        state.console_runner.run(&help_args),
    );
    let version = version
        .ok()
        .then(|| state.redactor.redact(version.output.trim()));
    Json(json!({
        "configured": state.config.is_configured(),
        "gatewayTarget": state.config.gateway.http_base(),
        "openclawVersion": version,
        "channelsAddHelp": state.redactor.redact(&help.output),
        "authGroups": providers::auth_groups(),
        "consoleCommands": console::command_names(),
        "publicDomain": state.config.public_domain,
    }))
}

async fn run_setup(State(state): State<AppState>, Json(req): Json<OnboardRequest>) -> Response {
    let _guard = state.admin_lock.lock().await;
    if state.config.is_configured() {
        return Json(json!({
            "ok": true,
            "output": "Already configured.\nUse Reset to rerun onboarding.\n",
        }))
        .into_response();
    }
    if let Err(e) = tokio::fs::create_dir_all(&state.config.state_dir).await {
        return error_json(StatusCode::INTERNAL_SERVER_ERROR, e);
    }
    if let Err(e) = tokio::fs::create_dir_all(&state.config.workspace_dir).await {
        return error_json(StatusCode::INTERNAL_SERVER_ERROR, e);
    }

    let mut outcome = onboard::run_onboarding(state.runner.as_ref(), &req, &state.config).await;
    let mut restart = Value::Null;
    if outcome.ok {
        let result = state.supervisor.restart().await;
        if let Err(e) = &result {
            outcome.output.push_str(&format!("[gateway] restart failed: {}\n", e));
        } else {
            outcome.output.push_str("[gateway] running\n");
        }
        restart = restart_json(&result);
    }
    let status = if outcome.ok {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        Json(json!({
            "ok": outcome.ok,
            "output": state.redactor.redact(&outcome.output),
            "restart": restart,
        })),
    )
        .into_response()
}

async fn read_config(State(state): State<AppState>) -> Response {
    let path = &state.config.config_path;
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Json(json!({
            "ok": true,
            "path": path,
            "exists": true,
            "content": content,
        }))
        .into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Json(json!({
            "ok": true,
            "path": path,
            "exists": false,
            "content": "",
        }))
        .into_response(),
        Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

#[derive(Debug, Deserialize)]
struct RawConfigBody {
    content: String,
}

async fn write_config(State(state): State<AppState>, Json(body): Json<RawConfigBody>) -> Response {
    let _guard = state.admin_lock.lock().await;
    let path = &state.config.config_path;
    let backup = match backup::save_with_backup(path, &body.content).await {
        Ok(b) => b,
        Err(e) => {
            log::error!("saving config failed: {:#}", e);
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e));
        }
    };
    let restart = state.supervisor.restart().await;
    Json(json!({
        "ok": true,
        "path": path,
        "backup": backup,
        "restart": restart_json(&restart),
    }))
    .into_response()
}

async fn console_run(State(state): State<AppState>, Json(req): Json<ConsoleRequest>) -> Response {
    let action = match console::resolve(req.cmd.trim(), req.arg.as_deref()) {
        Ok(a) => a,
        Err(e) => return error_json(StatusCode::BAD_REQUEST, e),
    };
    let (ok, output) = match action {
        ConsoleAction::Gateway(op) => {
            let result = match op {
                GatewayOp::Start => state.supervisor.ensure_running().await,
                GatewayOp::Restart => state.supervisor.restart().await,
                GatewayOp::Stop => {
                    state.supervisor.stop().await;
                    Ok(())
                }
            };
            let status = state.supervisor.status();
            match result {
                Ok(()) => (true, format!("gateway {} (pid {:?})", status.state, status.pid)),
                Err(e) => (false, e.to_string()),
            }
        }
        ConsoleAction::Cli(argv) => {
            let out = state.console_runner.run(&argv).await;
            (out.ok(), format!("{}\n[exit {}]", out.output.trim_end(), out.code))
        }
    };
    Json(json!({
        "ok": ok,
        "output": state.redactor.redact(&output),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct PairingQuery {
    channel: String,
}

async fn pairing_list(State(state): State<AppState>, Query(q): Query<PairingQuery>) -> Response {
    let channel = q.channel.trim();
    if let Err(e) = console::validate_arg(channel) {
        return error_json(StatusCode::BAD_REQUEST, e);
    }
    let out = state
        .console_runner
        .run(&args(["pairing", "list", channel]))
        .await;
    Json(json!({ "ok": out.ok(), "output": state.redactor.redact(&out.output) })).into_response()
}

#[derive(Debug, Deserialize)]
struct PairingApprove {
    channel: String,
    code: String,
}

async fn pairing_approve(
    State(state): State<AppState>,
    Json(body): Json<PairingApprove>,
) -> Response {
    let (channel, code) = (body.channel.trim(), body.code.trim());
    for value in [channel, code] {
        if let Err(e) = console::validate_arg(value) {
            return error_json(StatusCode::BAD_REQUEST, e);
        }
    }
    let out = state
        .console_runner
        .run(&args(["pairing", "approve", channel, code]))
        .await;
    let status = if out.ok() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        Json(json!({ "ok": out.ok(), "output": state.redactor.redact(&out.output) })),
    )
        .into_response()
}

async fn reset(State(state): State<AppState>) -> Response {
    let _guard = state.admin_lock.lock().await;
    state.supervisor.stop().await;
    let path = &state.config.config_path;
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            log::info!("config reset: removed {}", path.display());
            Json(json!({
                "ok": true,
                "output": format!("Deleted {}. You can rerun setup now.", path.display()),
            }))
            .into_response()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Json(json!({
            "ok": true,
            "output": "No config file to delete.",
        }))
        .into_response(),
        Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn export(State(state): State<AppState>) -> Response {
    let config = &state.config;
    let stream = backup::export_stream(
        config.state_dir.clone(),
        config.workspace_dir.clone(),
        config.volume_root.clone(),
    );
    let name = backup::export_file_name(chrono::Utc::now());
    (
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", name),
            ),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

/// Bring the gateway back after an aborted import.
async fn resume_gateway(state: &AppState) {
    if state.config.is_configured() {
        if let Err(e) = state.supervisor.ensure_running().await {
            log::warn!("gateway did not come back after failed import: {}", e);
        }
    }
}

async fn import(State(state): State<AppState>, body: Bytes) -> Response {
    if body.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "empty upload");
    }
    let _guard = state.admin_lock.lock().await;
    state.supervisor.stop().await;

    let root = state.config.volume_root.clone();
    let report = match tokio::task::spawn_blocking(move || backup::import_archive(&body, &root)).await {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => {
            log::warn!("import rejected: {:#}", e);
            resume_gateway(&state).await;
            return error_json(StatusCode::BAD_REQUEST, format!("{:#}", e));
        }
        Err(e) => {
            resume_gateway(&state).await;
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, e);
        }
    };
    log::info!(
        "imported {} file(s) into {} ({} skipped)",
        report.files,
        state.config.volume_root.display(),
        report.skipped
    );

    let restart = if state.config.is_configured() {
        restart_json(&state.supervisor.restart().await)
    } else {
        Value::Null
    };
    Json(json!({
        "ok": true,
        "files": report.files,
        "skipped": report.skipped,
        "restart": restart,
    }))
    .into_response()
}
