//! Client for the downstream build service

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Build request forwarded to the build service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub repo: String,
    pub branch: String,
    #[serde(default)]
    pub commit: String,
}

/// Narrow contract with the build service
#[async_trait]
pub trait BuildTrigger: Send + Sync {
    async fn trigger_build(&self, request: &BuildRequest) -> Result<()>;

    /// Builds known to the build service, passed through as opaque JSON
    async fn list_builds(&self) -> Result<Vec<serde_json::Value>>;
}

/// HTTP client for the Forge build service
pub struct ForgeClient {
    base_url: String,
    client: reqwest::Client,
}

impl ForgeClient {
    pub fn new(base_url: String, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl BuildTrigger for ForgeClient {
    async fn trigger_build(&self, request: &BuildRequest) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/build", self.base_url))
            .json(request)
            .send()
            .await
            .context("Failed to connect to build service")?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            anyhow::bail!("Failed to trigger build: {}", error_text);
        }

        info!("Build triggered for {}@{}", request.repo, request.branch);
        Ok(())
    }

    async fn list_builds(&self) -> Result<Vec<serde_json::Value>> {
        let url = format!("{}/api/builds", self.base_url);
        debug!("Fetching builds: {}", url);

        let builds = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to connect to build service")?
            .json()
            .await
            .context("Failed to parse builds response")?;

        Ok(builds)
    }
}
