//! Client for the container image registry (Docker Registry HTTP API v2)

use anyhow::{Context, Result};
use async_trait::async_trait;
use deploy_common::Digest;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tracing::debug;

/// Manifest media types accepted when resolving a tag to its digest
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.oci.image.index.v1+json";

const DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Narrow registry contract used by the digest tracker and the images endpoint
#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// List all repositories in the registry catalog
    async fn list_repositories(&self) -> Result<Vec<String>>;

    /// List the tags of one repository
    async fn list_tags(&self, repository: &str) -> Result<Vec<String>>;

    /// Resolve a tag to its manifest digest
    async fn manifest_digest(&self, repository: &str, tag: &str) -> Result<Digest>;
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    repositories: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Registry client over HTTP
pub struct HttpRegistry {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRegistry {
    /// Create a new registry client; `base_url` includes the scheme
    pub fn new(base_url: String, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl RegistryApi for HttpRegistry {
    async fn list_repositories(&self) -> Result<Vec<String>> {
        let url = format!("{}/v2/_catalog", self.base_url);
        debug!("Listing registry catalog: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to connect to registry")?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to list repositories: {}", response.status());
        }

        let catalog: CatalogResponse = response
            .json()
            .await
            .context("Failed to parse catalog response")?;

        Ok(catalog.repositories.unwrap_or_default())
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let url = format!("{}/v2/{}/tags/list", self.base_url, repository);
        debug!("Listing tags: {}", url);

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Failed to list tags for {}: {}",
                repository,
                response.status()
            );
        }

        let tags: TagsResponse = response
            .json()
            .await
            .context("Failed to parse tags response")?;

        Ok(tags.tags.unwrap_or_default())
    }

    async fn manifest_digest(&self, repository: &str, tag: &str) -> Result<Digest> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, repository, tag);

        let response = self
            .client
            .head(&url)
            .header(ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Failed to resolve {}:{}: {}",
                repository,
                tag,
                response.status()
            );
        }

        let digest = response
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(Digest::from)
            .filter(|digest| !digest.is_empty())
            .with_context(|| format!("No digest header for {}:{}", repository, tag))?;

        Ok(digest)
    }
}
