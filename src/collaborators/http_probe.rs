//! HTTP probe collaborator (§6.6), used by C7 health-check jobs and C6's
//! VERIFY phase.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

/// Outcome of a probe call.
#[derive(Debug, Clone)]
pub struct HttpProbeResult {
    pub ok: bool,
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait HttpProbe: Send + Sync {
    /// GET `url` with `timeout`, returning the observed status/body rather
    /// than erroring on non-2xx (the caller decides what `ok` means).
    async fn probe(&self, url: &str, timeout: Duration) -> anyhow::Result<HttpProbeResult>;
}

/// Real implementation backed by `reqwest`.
pub struct ReqwestHttpProbe {
    client: reqwest::Client,
}

impl ReqwestHttpProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestHttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpProbe for ReqwestHttpProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> anyhow::Result<HttpProbeResult> {
        let resp = self.client.get(url).timeout(timeout).send().await?;
        let status = resp.status().as_u16();
        let ok = resp.status().is_success();
        let body = resp.text().await.unwrap_or_default();
        Ok(HttpProbeResult { ok, status, body })
    }
}

/// In-process fake with canned responses keyed by URL.
#[derive(Default)]
pub struct InMemoryHttpProbe {
    responses: Mutex<HashMap<String, HttpProbeResult>>,
}

impl InMemoryHttpProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stub(&self, url: &str, result: HttpProbeResult) {
        self.responses.lock().await.insert(url.to_string(), result);
    }
}

#[async_trait]
impl HttpProbe for InMemoryHttpProbe {
    async fn probe(&self, url: &str, _timeout: Duration) -> anyhow::Result<HttpProbeResult> {
        self.responses
            .lock()
            .await
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no stubbed response for {url}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_stubbed_response() {
        let probe = InMemoryHttpProbe::new();
        probe
            .stub(
                "http://site/health",
                HttpProbeResult {
                    ok: true,
                    status: 200,
                    body: "ok".to_string(),
                },
            )
            .await;
        let result = probe.probe("http://site/health", Duration::from_secs(5)).await.unwrap();
        assert!(result.ok);
        assert_eq!(result.status, 200);
    }
}
