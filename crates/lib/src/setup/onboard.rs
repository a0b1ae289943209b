//! One-time onboarding: `openclaw onboard --non-interactive` plus channel and plugin setup.

use serde::Deserialize;
use serde_json::json;

use super::console::validate_arg;
use super::providers::{find_auth_option, SecretFlag};
use crate::config::WrapperConfig;
use crate::exec::{args, CommandRunner};

const FLOWS: &[&str] = &["quickstart", "advanced", "manual"];

/// Body of `POST /setup/api/run`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OnboardRequest {
    pub flow: Option<String>,
    pub auth_choice: Option<String>,
    pub auth_secret: Option<String>,
    pub telegram_token: Option<String>,
    pub discord_token: Option<String>,
    pub slack_bot_token: Option<String>,
    pub slack_app_token: Option<String>,
    pub plugins: Vec<String>,
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Arguments for `openclaw onboard`. Rejects unknown flows and auth choices.
pub fn onboard_args(req: &OnboardRequest, config: &WrapperConfig) -> Result<Vec<String>, String> {
    let flow = non_empty(&req.flow).unwrap_or("quickstart");
    if !FLOWS.contains(&flow) {
        return Err(format!("unknown onboarding flow: {}", flow));
    }
    let mut argv = args([
        "onboard",
        "--non-interactive",
        "--accept-risk",
        "--json",
        "--no-install-daemon",
        "--skip-health",
        "--flow",
        flow,
    ]);
    argv.push("--workspace".to_string());
    argv.push(config.workspace_dir.to_string_lossy().into_owned());
    argv.extend(args(["--gateway-bind", config.gateway.bind_mode()]));
    argv.push("--gateway-port".to_string());
    argv.push(config.gateway.port.to_string());
    argv.extend(args(["--gateway-auth", "token", "--gateway-token"]));
    argv.push(config.gateway_token.clone());

    if let Some(choice) = non_empty(&req.auth_choice) {
        let option = find_auth_option(choice).ok_or_else(|| format!("unknown auth choice: {}", choice))?;
        argv.extend(args(["--auth-choice", choice]));
        let secret = non_empty(&req.auth_secret);
        match (option.secret, secret) {
            (SecretFlag::ApiKey(flag), Some(secret)) => {
                argv.push(format!("--{}", flag));
                argv.push(secret.to_string());
            }
            (SecretFlag::SetupToken(provider), Some(secret)) => {
                argv.extend(args(["--token-provider", provider, "--token", secret]));
            }
            (SecretFlag::ApiKey(_) | SecretFlag::SetupToken(_), None) => {
                return Err(format!("auth choice {} needs a key or token", choice));
            }
            (SecretFlag::Interactive, _) => {}
        }
    }
    Ok(argv)
}

/// `config set --json channels.<name> <json>` for each channel with credentials.
pub fn channel_commands(req: &OnboardRequest) -> Vec<(String, Vec<String>)> {
    let mut out = Vec::new();
    if let Some(token) = non_empty(&req.telegram_token) {
        let cfg = json!({
            "enabled": true,
            "dmPolicy": "pairing",
            "botToken": token,
            "groupPolicy": "allowlist",
            "streamMode": "partial",
        });
        out.push(("telegram".to_string(), set_json("channels.telegram", &cfg)));
    }
    if let Some(token) = non_empty(&req.discord_token) {
        let cfg = json!({
            "enabled": true,
            "token": token,
            "groupPolicy": "allowlist",
            "dm": { "policy": "pairing" },
        });
        out.push(("discord".to_string(), set_json("channels.discord", &cfg)));
    }
    if non_empty(&req.slack_bot_token).is_some() || non_empty(&req.slack_app_token).is_some() {
        let mut cfg = json!({ "enabled": true });
        if let Some(t) = non_empty(&req.slack_bot_token) {
            cfg["botToken"] = json!(t);
        }
        if let Some(t) = non_empty(&req.slack_app_token) {
            cfg["appToken"] = json!(t);
        }
        out.push(("slack".to_string(), set_json("channels.slack", &cfg)));
    }
    out
}

fn set_json(key: &str, value: &serde_json::Value) -> Vec<String> {
    args(["config", "set", "--json", key]).into_iter().chain([value.to_string()]).collect()
}

/// Result of an onboarding run; `output` is annotated per step (not yet redacted).
#[derive(Debug, Clone, Default)]
pub struct OnboardOutcome {
    pub ok: bool,
    pub output: String,
}

impl OnboardOutcome {
    fn step(&mut self, title: &str, code: i32, text: &str) {
        self.output.push_str(&format!("[{}] exit={}\n", title, code));
        let text = text.trim_end();
        if !text.is_empty() {
            self.output.push_str(text);
            self.output.push('\n');
        }
    }
}

/// Run onboarding, then channel and plugin configuration. Stops after a failed `onboard`.
pub async fn run_onboarding(
    runner: &dyn CommandRunner,
    req: &OnboardRequest,
    config: &WrapperConfig,
) -> OnboardOutcome {
    let mut outcome = OnboardOutcome::default();
    let argv = match onboard_args(req, config) {
        Ok(a) => a,
        Err(e) => {
            outcome.output = format!("{}\n", e);
            return outcome;
        }
    };
    for plugin in &req.plugins {
        if let Err(e) = validate_arg(plugin) {
            outcome.output = format!("invalid plugin name {:?}: {}\n", plugin, e);
            return outcome;
        }
    }

    let res = runner.run(&argv).await;
    outcome.step("onboard", res.code, &res.output);
    if !res.ok() || !config.is_configured() {
        if res.ok() {
            outcome.step("onboard", res.code, "onboard finished but no config file was written");
        }
        log::warn!("onboarding failed (exit {})", res.code);
        return outcome;
    }
    outcome.ok = true;

    for (name, argv) in channel_commands(req) {
        let res = runner.run(&argv).await;
        outcome.step(&format!("channels.{}", name), res.code, &res.output);
        if !res.ok() {
            log::warn!("configuring channel {} failed (exit {})", name, res.code);
        }
    }
    for plugin in &req.plugins {
        let res = runner.run(&args(["plugins", "enable", plugin.as_str()])).await;
        outcome.step(&format!("plugins.enable {}", plugin), res.code, &res.output);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn config() -> WrapperConfig {
        crate::config::test_config(std::path::Path::new("/data"))
    }

    #[test]
    fn api_key_choice_adds_its_flag() {
        let req = OnboardRequest {
            auth_choice: Some("openai-api-key".into()),
            auth_secret: Some(" sk-test ".into()),
            ..Default::default()
        };
        let argv = onboard_args(&req, &config()).unwrap();
        assert_eq!(&argv[..2], &["onboard", "--non-interactive"]);
        let i = argv.iter().position(|a| a == "--openai-api-key").unwrap();
        assert_eq!(argv[i + 1], "sk-test");
        let i = argv.iter().position(|a| a == "--gateway-token").unwrap();
        assert_eq!(argv[i + 1], "tok");
    }

    #[test]
    fn rejects_unknown_flow_and_missing_secret() {
        let req = OnboardRequest {
            flow: Some("yolo".into()),
            ..Default::default()
        };
        assert!(onboard_args(&req, &config()).is_err());
        let req = OnboardRequest {
            auth_choice: Some("apiKey".into()),
            ..Default::default()
        };
        assert!(onboard_args(&req, &config()).unwrap_err().contains("needs a key"));
    }

    #[test]
    fn slack_combines_both_tokens() {
        let req = OnboardRequest {
            slack_bot_token: Some("xoxb-1".into()),
            slack_app_token: Some("xapp-1".into()),
            ..Default::default()
        };
        let cmds = channel_commands(&req);
        assert_eq!(cmds.len(), 1);
        let (name, argv) = &cmds[0];
        assert_eq!(name, "slack");
        let v: serde_json::Value = serde_json::from_str(argv.last().unwrap()).unwrap();
        assert_eq!(v["botToken"], "xoxb-1");
        assert_eq!(v["appToken"], "xapp-1");
    }

    /// Runner whose `onboard` writes the config file like the real CLI does.
    struct Recorder {
        config_path: std::path::PathBuf,
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl CommandRunner for Recorder {
        async fn run(&self, args: &[String]) -> CommandOutput {
            self.calls.lock().unwrap().push(args.to_vec());
            if args.first().map(String::as_str) == Some("onboard") {
                std::fs::write(&self.config_path, "{}").unwrap();
            }
            CommandOutput {
                code: 0,
                output: "done\n".into(),
            }
        }
    }

    #[tokio::test]
    async fn onboarding_runs_channels_and_plugins_in_order() {
        let root = std::env::temp_dir().join(format!("clawhost-onboard-{}", uuid::Uuid::new_v4()));
        let config = crate::config::test_config(&root);
        std::fs::create_dir_all(&config.state_dir).unwrap();
        let runner = Recorder {
            config_path: config.config_path.clone(),
            calls: Mutex::new(Vec::new()),
        };
        let req = OnboardRequest {
            telegram_token: Some("123:abc".into()),
            plugins: vec!["voice-call".into()],
            ..Default::default()
        };
        let outcome = run_onboarding(&runner, &req, &config).await;
        assert!(outcome.ok, "{}", outcome.output);
        assert!(outcome.output.contains("[channels.telegram] exit=0"));
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0][0], "onboard");
        assert_eq!(calls[1][3], "channels.telegram");
        assert_eq!(calls[2], vec!["plugins", "enable", "voice-call"]);
        let _ = std::fs::remove_dir_all(&root);
    }
}
