//! Scrubbing secrets out of CLI output before it is shown in the browser.

use regex::Regex;

const MASK: &str = "[REDACTED]";

const PATTERNS: &[&str] = &[
    // OpenAI / Anthropic style keys (sk-..., sk-ant-..., sk-proj-...)
    r"sk-[A-Za-z0-9_\-]{16,}",
    // GitHub tokens
    r"gh[opsur]_[A-Za-z0-9]{20,}",
    r"github_pat_[A-Za-z0-9_]{20,}",
    // Slack bot/app/user tokens
    r"xox[abposr]-[A-Za-z0-9\-]{10,}",
    r"xapp-[A-Za-z0-9\-]{10,}",
    // Telegram bot tokens: <bot id>:<secret>
    r"\b[0-9]{6,12}:[A-Za-z0-9_\-]{30,}",
    // Google API keys
    r"AIza[0-9A-Za-z_\-]{30,}",
];

pub struct Redactor {
    patterns: Vec<Regex>,
    literals: Vec<String>,
}

impl Redactor {
    /// `literals` are exact secrets (e.g. the gateway token) masked wherever they appear.
    pub fn new(literals: impl IntoIterator<Item = String>) -> Self {
        let patterns = PATTERNS
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    log::error!("invalid redaction pattern {}: {}", p, e);
                    None
                }
            })
            .collect();
        let literals = literals
            .into_iter()
            .filter(|s| s.len() >= 8)
            .collect();
        Self { patterns, literals }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for lit in &self.literals {
            out = out.replace(lit.as_str(), MASK);
        }
        for re in &self.patterns {
            out = re.replace_all(&out, MASK).into_owned();
        }
        out
    }
}
