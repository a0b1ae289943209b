//! Readiness probing of the gateway's internal HTTP port.

use async_trait::async_trait;
use std::time::Duration;

use crate::config::ProxyTarget;

/// Paths tried in order on each probe: current UI base, legacy base, root.
pub const PROBE_PATHS: &[&str] = &["/openclaw", "/clawdbot", "/"];

/// One probe cycle against the gateway. `Ok` means the port is serving HTTP.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, target: &ProxyTarget) -> Result<(), String>;
}

/// Probes over plain HTTP GET. Any response counts as ready, whatever its status.
#[derive(Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|e| {
                log::warn!("building probe client failed ({}); using defaults", e);
                reqwest::Client::new()
            });
        Self { client }
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn probe(&self, target: &ProxyTarget) -> Result<(), String> {
        let base = target.http_base();
        let mut last_err = String::from("no probe paths");
        for path in PROBE_PATHS {
            let url = format!("{}{}", base, path);
            match self.client.get(&url).send().await {
                Ok(res) => {
                    log::debug!("gateway probe {} -> {}", url, res.status());
                    return Ok(());
                }
                Err(e) => last_err = format!("{}: {}", url, e),
            }
        }
        Err(last_err)
    }
}
