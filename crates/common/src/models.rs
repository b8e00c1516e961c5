//! Data model shared by the controller stores and the HTTP API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::digest::Digest;

/// Short random identifier for audit records
pub fn new_record_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

/// What caused a deploy or history record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    Manual,
    RegistryWebhook,
    RegistryPoll,
    BuildWebhook,
    Rollback,
    AutoCreate,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::RegistryWebhook => "registry-webhook",
            Trigger::RegistryPoll => "registry-poll",
            Trigger::BuildWebhook => "build-webhook",
            Trigger::Rollback => "rollback",
            Trigger::AutoCreate => "auto-create",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a deploy attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStatus {
    Success,
    Failed,
}

/// Live state of a workload as derived from its replica counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadStatus {
    Running,
    Updating,
    NotReady,
}

impl WorkloadStatus {
    /// Derive the status from desired and ready replica counts
    pub fn from_replicas(desired: i32, ready: i32) -> Self {
        if ready <= 0 {
            WorkloadStatus::NotReady
        } else if ready < desired {
            WorkloadStatus::Updating
        } else {
            WorkloadStatus::Running
        }
    }
}

/// User-configured binding from an image/tag pattern to a workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoDeployRule {
    /// Substring matched against the repository or the full image reference
    pub image_pattern: String,

    /// Optional tag pattern: empty or `*` match anything, `prefix*` matches by prefix
    #[serde(default)]
    pub tag_pattern: String,

    #[serde(default)]
    pub namespace: String,

    /// Target workload name, also the rule key
    #[serde(alias = "deploymentName")]
    pub deployment: String,

    #[serde(default)]
    pub enabled: bool,

    /// Create the workload when it does not exist yet
    #[serde(default)]
    pub auto_create: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered: Option<DateTime<Utc>>,
}

/// Audit record of a single deploy attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployEvent {
    pub id: String,
    pub deployment: String,
    pub namespace: String,
    pub image: String,
    #[serde(default)]
    pub previous_image: String,
    pub trigger: Trigger,
    pub status: DeployStatus,
    #[serde(default)]
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub duration_seconds: f64,
}

impl DeployEvent {
    /// Create a successful event; use [`DeployEvent::mark_failed`] for failures
    pub fn new(
        deployment: impl Into<String>,
        namespace: impl Into<String>,
        image: impl Into<String>,
        trigger: Trigger,
    ) -> Self {
        Self {
            id: new_record_id(),
            deployment: deployment.into(),
            namespace: namespace.into(),
            image: image.into(),
            previous_image: String::new(),
            trigger,
            status: DeployStatus::Success,
            message: String::new(),
            timestamp: Utc::now(),
            duration_seconds: 0.0,
        }
    }

    pub fn with_previous_image(mut self, previous_image: impl Into<String>) -> Self {
        self.previous_image = previous_image.into();
        self
    }

    pub fn with_duration(mut self, duration_seconds: f64) -> Self {
        self.duration_seconds = duration_seconds;
        self
    }

    pub fn mark_succeeded(mut self, message: impl Into<String>) -> Self {
        self.status = DeployStatus::Success;
        self.message = message.into();
        self
    }

    pub fn mark_failed(mut self, error: impl Into<String>) -> Self {
        self.status = DeployStatus::Failed;
        self.message = error.into();
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == DeployStatus::Success
    }
}

/// Entry of a deployment's version history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentVersion {
    /// Monotonic per deployment, starting at 1
    pub version: u64,
    pub image: String,
    pub trigger: Trigger,
    pub status: DeployStatus,
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
}

/// A registry push observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEvent {
    pub id: String,
    pub action: String,
    pub repository: String,
    pub tag: String,
    pub digest: Digest,
    pub timestamp: DateTime<Utc>,
    /// Set once rule evaluation for this push has finished
    pub processed: bool,
    pub auto_deployed: bool,
}

impl RegistryEvent {
    pub fn new(
        action: impl Into<String>,
        repository: impl Into<String>,
        tag: impl Into<String>,
        digest: Digest,
    ) -> Self {
        Self {
            id: new_record_id(),
            action: action.into(),
            repository: repository.into(),
            tag: tag.into(),
            digest,
            timestamp: Utc::now(),
            processed: false,
            auto_deployed: false,
        }
    }

    /// Settle the event after rule evaluation
    pub fn mark_processed(&mut self, auto_deployed: bool) {
        self.processed = true;
        self.auto_deployed = auto_deployed;
    }
}

/// Kind of non-registry webhook observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WebhookKind {
    GitPush,
    BuildComplete,
}

/// A git push or build-completion webhook observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub id: String,
    pub kind: WebhookKind,
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn new(kind: WebhookKind, source: impl Into<String>) -> Self {
        Self {
            id: new_record_id(),
            kind,
            source: source.into(),
            repo: String::new(),
            branch: String::new(),
            commit: String::new(),
            image: String::new(),
            status: String::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Read-model entry describing a live workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentInfo {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub status: WorkloadStatus,
    pub replicas: i32,
    pub ready_replicas: i32,
    /// Whether an auto-deploy rule is keyed by this workload's name
    pub auto_deploy: bool,
}
