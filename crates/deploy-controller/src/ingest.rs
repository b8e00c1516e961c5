//! Event ingestion
//!
//! Normalizes the three webhook sources into internal shapes: registry push
//! notifications become [`ImagePush`]es, git pushes become [`GitPush`]es for
//! the build service, and build completions become deploy candidates.

use deploy_common::{Digest, ImageReference, Trigger};
use serde::Deserialize;

/// Canonical "image published" signal, from a webhook or the poll loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePush {
    pub repository: String,
    pub tag: String,
    pub digest: Digest,
    pub source: Trigger,
}

/// Registry notification envelope (Docker distribution format)
#[derive(Debug, Default, Deserialize)]
pub struct RegistryNotification {
    #[serde(default)]
    pub events: Vec<NotificationEvent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub target: NotificationTarget,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationTarget {
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub tag: String,
}

impl RegistryNotification {
    /// Tagged push events; pulls, deletes and untagged manifest pushes are dropped
    pub fn pushes(&self) -> Vec<ImagePush> {
        self.events
            .iter()
            .filter(|event| event.action == "push" && !event.target.tag.is_empty())
            .map(|event| ImagePush {
                repository: event.target.repository.clone(),
                tag: event.target.tag.clone(),
                digest: Digest::new(event.target.digest.as_str()),
                source: Trigger::RegistryWebhook,
            })
            .collect()
    }
}

/// Git push webhook payload (Gitea/GitHub compatible subset)
#[derive(Debug, Default, Deserialize)]
pub struct GitWebhookPayload {
    #[serde(default)]
    pub repository: Option<GitRepository>,
    #[serde(default, rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub after: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct GitRepository {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub full_name: String,
}

/// Normalized git push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitPush {
    pub repo: String,
    pub branch: String,
    pub commit: String,
}

impl From<GitWebhookPayload> for GitPush {
    fn from(payload: GitWebhookPayload) -> Self {
        let repo = payload
            .repository
            .map(|r| if r.full_name.is_empty() { r.name } else { r.full_name })
            .unwrap_or_default();

        let branch = payload
            .git_ref
            .strip_prefix("refs/heads/")
            .unwrap_or(&payload.git_ref)
            .to_string();

        let commit = match payload.after.get(..12) {
            Some(short) => short.to_string(),
            None => String::new(),
        };

        GitPush {
            repo,
            branch,
            commit,
        }
    }
}

/// Build completion webhook payload
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildNotification {
    #[serde(default)]
    pub build_id: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub deployment: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl BuildNotification {
    /// Whether the build produced an image that should be deployed
    pub fn is_deployable(&self) -> bool {
        self.status == "success" && !self.image.is_empty()
    }

    /// Explicit deployment, or the image's last path segment without its tag
    pub fn target_deployment(&self) -> Option<String> {
        self.deployment
            .clone()
            .filter(|d| !d.is_empty())
            .or_else(|| {
                let name = ImageReference::parse(&self.image).short_name().to_string();
                (!name.is_empty()).then_some(name)
            })
    }

    pub fn target_namespace(&self, default: &str) -> String {
        self.namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| default.to_string())
    }
}
