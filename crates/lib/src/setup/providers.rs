//! AI-provider auth choices offered by the setup wizard, and how each maps onto
//! `openclaw onboard` flags.

use serde::Serialize;

/// How the wizard's secret field is passed to `onboard`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretFlag {
    /// No secret (OAuth or device flows finished later in the Control UI).
    Interactive,
    /// `--<flag> <secret>`
    ApiKey(&'static str),
    /// `--token-provider <provider> --token <secret>`
    SetupToken(&'static str),
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthOption {
    pub value: &'static str,
    pub label: &'static str,
    #[serde(skip)]
    pub secret: SecretFlag,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthGroup {
    pub value: &'static str,
    pub label: &'static str,
    pub hint: &'static str,
    pub options: Vec<AuthOption>,
}

fn opt(value: &'static str, label: &'static str, secret: SecretFlag) -> AuthOption {
    AuthOption {
        value,
        label,
        secret,
    }
}

pub fn auth_groups() -> Vec<AuthGroup> {
    use SecretFlag::*;
    vec![
        AuthGroup {
            value: "openai",
            label: "OpenAI",
            hint: "Codex OAuth + API key",
            options: vec![
                opt("codex-cli", "OpenAI Codex OAuth (Codex CLI)", Interactive),
                opt("openai-codex", "OpenAI Codex (ChatGPT OAuth)", Interactive),
                opt("openai-api-key", "OpenAI API key", ApiKey("openai-api-key")),
            ],
        },
        AuthGroup {
            value: "anthropic",
            label: "Anthropic",
            hint: "Claude Code CLI + API key",
            options: vec![
                opt("claude-cli", "Anthropic token (Claude Code CLI)", Interactive),
                opt("token", "Anthropic token (paste setup-token)", SetupToken("anthropic")),
                opt("apiKey", "Anthropic API key", ApiKey("anthropic-api-key")),
            ],
        },
        AuthGroup {
            value: "google",
            label: "Google",
            hint: "Gemini API key + OAuth",
            options: vec![
                opt("gemini-api-key", "Google Gemini API key", ApiKey("gemini-api-key")),
                opt("google-antigravity", "Google Antigravity OAuth", Interactive),
                opt("google-gemini-cli", "Google Gemini CLI OAuth", Interactive),
            ],
        },
        AuthGroup {
            value: "openrouter",
            label: "OpenRouter",
            hint: "API key",
            options: vec![opt(
                "openrouter-api-key",
                "OpenRouter API key",
                ApiKey("openrouter-api-key"),
            )],
        },
        AuthGroup {
            value: "ai-gateway",
            label: "Vercel AI Gateway",
            hint: "API key",
            options: vec![opt(
                "ai-gateway-api-key",
                "Vercel AI Gateway API key",
                ApiKey("ai-gateway-api-key"),
            )],
        },
        AuthGroup {
            value: "moonshot",
            label: "Moonshot AI",
            hint: "Kimi K2 + Kimi Code",
            options: vec![
                opt("moonshot-api-key", "Moonshot AI API key", ApiKey("moonshot-api-key")),
                opt("kimi-code-api-key", "Kimi Code API key", ApiKey("kimi-code-api-key")),
            ],
        },
        AuthGroup {
            value: "zai",
            label: "Z.AI (GLM)",
            hint: "API key",
            options: vec![opt("zai-api-key", "Z.AI (GLM) API key", ApiKey("zai-api-key"))],
        },
        AuthGroup {
            value: "minimax",
            label: "MiniMax",
            hint: "M2.1 (recommended)",
            options: vec![opt("minimax-api", "MiniMax M2.1", ApiKey("minimax-api-key"))],
        },
        AuthGroup {
            value: "qwen",
            label: "Qwen",
            hint: "OAuth",
            options: vec![opt("qwen-portal", "Qwen OAuth", Interactive)],
        },
        AuthGroup {
            value: "copilot",
            label: "Copilot",
            hint: "GitHub + local proxy",
            options: vec![
                opt("github-copilot", "GitHub Copilot (GitHub device login)", Interactive),
                opt("copilot-proxy", "Copilot Proxy (local)", Interactive),
            ],
        },
        AuthGroup {
            value: "synthetic",
            label: "Synthetic",
            hint: "Anthropic-compatible (multi-model)",
            options: vec![opt(
                "synthetic-api-key",
                "Synthetic API key",
                ApiKey("synthetic-api-key"),
            )],
        },
        AuthGroup {
            value: "opencode-zen",
            label: "OpenCode Zen",
            hint: "API key",
            options: vec![opt(
                "opencode-zen",
                "OpenCode Zen (multi-model proxy)",
                ApiKey("opencode-zen-api-key"),
            )],
        },
    ]
}

/// Look up an auth choice across all groups.
pub fn find_auth_option(choice: &str) -> Option<AuthOption> {
    auth_groups()
        .into_iter()
        .flat_map(|g| g.options)
        .find(|o| o.value == choice)
}
