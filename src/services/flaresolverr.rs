//! FlareSolverr client used to generate DNS traffic for warm-start
//!
//! FlareSolverr drives a real browser, so fetching a page through it resolves
//! the site's domain (and its CDNs) through the router's resolver even when the
//! site blocks plain HTTP clients.
//!
//! # API Endpoint
//! `POST {base}/v1` with `{"cmd": "request.get", "url": ..., "maxTimeout": ms}`

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{PbrSyncError, Result};

/// Extra time on top of `maxTimeout` for FlareSolverr to answer
const RESPONSE_MARGIN: Duration = Duration::from_secs(5);

/// Something that can load a page so that its domain gets resolved.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// A disabled fetcher makes warm-start inert.
    fn is_enabled(&self) -> bool {
        true
    }

    async fn fetch(&self, url: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct FlareSolverrResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    solution: Option<Solution>,
}

#[derive(Debug, Deserialize)]
struct Solution {
    #[serde(default)]
    status: Option<u16>,
}

pub struct FlareSolverrClient {
    http_client: Client,
    base_url: String,
    max_timeout: Duration,
}

impl FlareSolverrClient {
    pub fn new(http_client: Client, base_url: impl Into<String>, max_timeout: Duration) -> Self {
        Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_timeout,
        }
    }
}

#[async_trait]
impl PageFetcher for FlareSolverrClient {
    fn name(&self) -> &'static str {
        "flaresolverr"
    }

    async fn fetch(&self, url: &str) -> Result<()> {
        let endpoint = format!("{}/v1", self.base_url);

        let response = self
            .http_client
            .post(&endpoint)
            .timeout(self.max_timeout + RESPONSE_MARGIN)
            .json(&serde_json::json!({
                "cmd": "request.get",
                "url": url,
                "maxTimeout": self.max_timeout.as_millis() as u64,
            }))
            .send()
            .await
            .map_err(|e| PbrSyncError::Proxy(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PbrSyncError::Proxy(format!(
                "{}: FlareSolverr returned {} - {}",
                url, status, body
            )));
        }

        let data: FlareSolverrResponse = response
            .json()
            .await
            .map_err(|e| PbrSyncError::Proxy(format!("{}: {}", url, e)))?;

        if data.status != "ok" {
            return Err(PbrSyncError::Proxy(format!(
                "{}: {}",
                url,
                data.message.unwrap_or(data.status)
            )));
        }

        log::debug!(
            "FlareSolverr fetched {} (upstream status {:?})",
            url,
            data.solution.and_then(|s| s.status)
        );
        Ok(())
    }
}

/// Stand-in used when warm-start is switched off.
#[derive(Debug, Default, Clone)]
pub struct DisabledFetcher;

#[async_trait]
impl PageFetcher for DisabledFetcher {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn fetch(&self, _url: &str) -> Result<()> {
        Ok(())
    }
}
