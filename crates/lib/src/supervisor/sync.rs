//! Best-effort config sync run before each spawn: token, bind, and port written via `config set`.

use serde::Serialize;

use crate::config::ProxyTarget;
use crate::exec::{args, CommandRunner};

/// Outcome of one `config set` step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStep {
    pub step: String,
    pub ok: bool,
    pub detail: String,
}

/// Settings the wrapper forces onto openclaw's config so the gateway binds where the proxy expects.
pub fn sync_commands(token: &str, target: &ProxyTarget) -> Vec<(String, Vec<String>)> {
    vec![
        (
            "gateway.mode".to_string(),
            args(["config", "set", "gateway.mode", "local"]),
        ),
        (
            "gateway.auth.mode".to_string(),
            args(["config", "set", "gateway.auth.mode", "token"]),
        ),
        (
            "gateway.auth.token".to_string(),
            args(["config", "set", "gateway.auth.token", token]),
        ),
        (
            "gateway.bind".to_string(),
            args(["config", "set", "gateway.bind", target.bind_mode()]),
        ),
        (
            "gateway.port".to_string(),
            args([
                "config".to_string(),
                "set".to_string(),
                "--json".to_string(),
                "gateway.port".to_string(),
                target.port.to_string(),
            ]),
        ),
    ]
}

/// Run every sync command in order. A failing step is logged and the rest still run.
/// `cancelled` is checked before each step; once it returns true no further commands start.
pub async fn sync_gateway_config(
    runner: &dyn CommandRunner,
    token: &str,
    target: &ProxyTarget,
    cancelled: impl Fn() -> bool,
) -> Vec<SyncStep> {
    let mut report = Vec::new();
    for (step, argv) in sync_commands(token, target) {
        if cancelled() {
            log::info!("config sync cancelled before step {}", step);
            break;
        }
        let out = runner.run(&argv).await;
        if !out.ok() {
            log::warn!(
                "config sync step {} failed (exit {}): {}",
                step,
                out.code,
                out.output.trim()
            );
        }
        report.push(SyncStep {
            step,
            ok: out.ok(),
            detail: out.output.trim().to_string(),
        });
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl CommandRunner for Recorder {
        async fn run(&self, args: &[String]) -> CommandOutput {
            self.calls.lock().unwrap().push(args.to_vec());
            let failing = args.iter().any(|a| a == "gateway.bind");
            CommandOutput {
                code: if failing { 1 } else { 0 },
                output: if failing { "boom".into() } else { String::new() },
            }
        }
    }

    #[tokio::test]
    async fn failures_do_not_stop_later_steps() {
        let runner = Recorder::default();
        let report = sync_gateway_config(&runner, "tok", &ProxyTarget::new("127.0.0.1", 18789), || false)
            .await;
        let steps: Vec<&str> = report.iter().map(|s| s.step.as_str()).collect();
        assert_eq!(
            steps,
            vec!["gateway.mode", "gateway.auth.mode", "gateway.auth.token", "gateway.bind", "gateway.port"]
        );
        let bind = report.iter().find(|s| s.step == "gateway.bind").unwrap();
        assert!(!bind.ok);
        assert_eq!(bind.detail, "boom");
        assert!(report.iter().filter(|s| s.step != "gateway.bind").all(|s| s.ok));

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 5);
        assert_eq!(
            calls.last().unwrap(),
            &vec!["config", "set", "--json", "gateway.port", "18789"]
        );
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_step() {
        let runner = Recorder::default();
        let report = sync_gateway_config(&runner, "tok", &ProxyTarget::new("127.0.0.1", 1), || {
            runner.calls.lock().unwrap().len() >= 2
        })
        .await;
        assert_eq!(report.len(), 2);
        assert_eq!(runner.calls.lock().unwrap().len(), 2);
    }
}
