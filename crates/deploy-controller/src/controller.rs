//! Deploy controller
//!
//! Wires the stores, the registry tracker and the deployer together and
//! exposes the operations behind the HTTP API and the background loops.
//!
//! **Data Flow:**
//! 1. A push is observed (registry webhook or digest poll)
//! 2. The rule set selects zero or more targets
//! 3. Each target is deployed independently by the [`Deployer`]
//! 4. Outcomes land in the audit log and the per-deployment history

use anyhow::Result as AnyResult;
use deploy_common::{
    Digest, Error, ImageReference, RegistryEvent, Result, Trigger, WebhookEvent, WebhookKind,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::build_trigger::{BuildRequest, BuildTrigger};
use crate::cluster::ClusterApi;
use crate::config::Config;
use crate::history;
use crate::ingest::{BuildNotification, GitPush, ImagePush, RegistryNotification};
use crate::mutator::{DeployOutcome, DeployRequest, Deployer};
use crate::registry_client::RegistryApi;
use crate::stores::{AuditLog, DedupWindow, DigestCache, HistoryStore, ReadModel, RuleSet};
use crate::sync;
use crate::tracker::RegistryTracker;

/// Static settings of a controller instance
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Registry host[:port] used to build image references
    pub registry_host: String,
    /// Managed namespace, also the default namespace of requests
    pub namespace: String,
    pub dedup_window: Duration,
}

impl From<&Config> for ControllerSettings {
    fn from(config: &Config) -> Self {
        Self {
            registry_host: config.registry_url.clone(),
            namespace: config.namespace.clone(),
            dedup_window: config.dedup_window(),
        }
    }
}

/// External collaborators
pub struct Backends {
    pub registry: Arc<dyn RegistryApi>,
    /// `None` when no orchestration client could be configured
    pub cluster: Option<Arc<dyn ClusterApi>>,
    pub builds: Arc<dyn BuildTrigger>,
}

/// Result of evaluating one push against the rule set
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PushReport {
    /// Targets selected by the rules
    pub matched: usize,
    /// Targets actually dispatched after de-duplication
    pub dispatched: usize,
    /// Dispatches that ended in a new deployed version
    pub deployed: usize,
}

pub struct Controller {
    settings: ControllerSettings,
    registry: Arc<dyn RegistryApi>,
    cluster: Option<Arc<dyn ClusterApi>>,
    builds: Arc<dyn BuildTrigger>,
    tracker: RegistryTracker,
    deployer: Arc<Deployer>,
    digests: Arc<DigestCache>,
    rules: Arc<RuleSet>,
    audit: Arc<AuditLog>,
    history: Arc<HistoryStore>,
    read_model: Arc<ReadModel>,
    dedup: DedupWindow,
}

impl Controller {
    pub fn new(settings: ControllerSettings, backends: Backends) -> Self {
        let digests = Arc::new(DigestCache::new());
        let audit = Arc::new(AuditLog::new());
        let history = Arc::new(HistoryStore::new());

        let tracker = RegistryTracker::new(
            Arc::clone(&backends.registry),
            Arc::clone(&digests),
            settings.registry_host.clone(),
        );
        let deployer = Arc::new(Deployer::new(
            backends.cluster.clone(),
            Arc::clone(&audit),
            Arc::clone(&history),
        ));

        Self {
            dedup: DedupWindow::new(settings.dedup_window),
            settings,
            registry: backends.registry,
            cluster: backends.cluster,
            builds: backends.builds,
            tracker,
            deployer,
            digests,
            rules: Arc::new(RuleSet::new()),
            audit,
            history,
            read_model: Arc::new(ReadModel::new()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.settings.namespace
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn read_model(&self) -> &ReadModel {
        &self.read_model
    }

    pub fn registry(&self) -> &dyn RegistryApi {
        self.registry.as_ref()
    }

    pub fn builds(&self) -> &dyn BuildTrigger {
        self.builds.as_ref()
    }

    /// Fully-qualified reference of `repository:tag` in the watched registry
    pub fn image_ref(&self, repository: &str, tag: &str) -> String {
        ImageReference::new(&self.settings.registry_host, repository, tag).to_string()
    }

    /// Record every tagged push of a registry notification and evaluate it in the background.
    ///
    /// Returns the number of events in the notification.
    pub async fn ingest_registry_notification(
        self: &Arc<Self>,
        notification: RegistryNotification,
    ) -> usize {
        let total = notification.events.len();

        for push in notification.pushes() {
            let event_id = self.observe_push(&push).await;
            let controller = Arc::clone(self);
            tokio::spawn(async move {
                controller.process_push(push, Some(event_id)).await;
            });
        }

        total
    }

    /// Log a webhook push and record its digest so the poll path does not report it again
    async fn observe_push(&self, push: &ImagePush) -> String {
        let event = RegistryEvent::new("push", &push.repository, &push.tag, push.digest.clone());
        let event_id = event.id.clone();
        self.audit.record_registry(event).await;

        info!(
            "Registry push: {}:{} (digest: {})",
            push.repository,
            push.tag,
            push.digest.short()
        );

        if !push.digest.is_empty() {
            let image_ref = self.image_ref(&push.repository, &push.tag);
            self.digests.record(&image_ref, &push.digest).await;
        }

        event_id
    }

    /// Evaluate a push against the rule set and deploy every matching target.
    ///
    /// Each target is handled by its own task; the registry event (if any)
    /// is settled once all of them have finished.
    pub async fn process_push(&self, push: ImagePush, event_id: Option<String>) -> PushReport {
        let image_ref = self.image_ref(&push.repository, &push.tag);
        let targets = self
            .rules
            .match_and_touch(&push.repository, &push.tag, &image_ref)
            .await;

        let mut report = PushReport {
            matched: targets.len(),
            ..Default::default()
        };
        let mut tasks = JoinSet::new();

        for target in targets {
            if !self.dedup.should_dispatch(&target.key(), &push.digest).await {
                info!(
                    "Skipping duplicate dispatch of {} ({}) to {}",
                    image_ref,
                    push.digest.short(),
                    target.key()
                );
                continue;
            }

            info!(
                "Auto-deploy triggered ({}): {} -> {}",
                push.source,
                image_ref,
                target.key()
            );
            report.dispatched += 1;

            let deployer = Arc::clone(&self.deployer);
            let request = DeployRequest::new(
                &target.namespace,
                &target.deployment,
                &image_ref,
                push.source,
            )
            .with_digest(Some(push.digest.clone()));

            tasks.spawn(async move {
                if target.auto_create {
                    if let Err(e) = deployer.ensure_exists(&target, &request.image).await {
                        warn!("Auto-create of {} failed: {}", target.key(), e);
                    }
                }
                deployer.apply(&request).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(DeployOutcome::Deployed { .. })) => report.deployed += 1,
                Ok(Ok(DeployOutcome::Unchanged)) | Ok(Err(_)) => {}
                Err(e) => warn!("Deploy task failed: {}", e),
            }
        }

        if let Some(id) = event_id {
            self.audit.settle_registry(&id, report.dispatched > 0).await;
        }

        report
    }

    /// Scan the registry once and return the detected digest changes
    pub async fn poll_registry(&self) -> AnyResult<Vec<ImagePush>> {
        self.tracker.scan().await
    }

    /// Record a git push and forward it to the build service in the background
    pub async fn ingest_git_push(self: &Arc<Self>, push: GitPush) -> String {
        let mut event = WebhookEvent::new(WebhookKind::GitPush, "git");
        event.repo = push.repo.clone();
        event.branch = push.branch.clone();
        event.commit = push.commit.clone();
        let event_id = event.id.clone();

        info!(
            "Git webhook: repo={} branch={} commit={}",
            push.repo, push.branch, push.commit
        );

        self.audit.record_webhook(event).await;

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            controller
                .trigger_build(BuildRequest {
                    repo: push.repo,
                    branch: push.branch,
                    commit: push.commit,
                })
                .await;
        });

        event_id
    }

    /// Forward a build request to the build service, logging failures
    pub async fn trigger_build(&self, request: BuildRequest) {
        if let Err(e) = self.builds.trigger_build(&request).await {
            warn!("Failed to trigger build for {}: {:#}", request.repo, e);
        }
    }

    /// Record a build completion and deploy its image in the background when it succeeded.
    ///
    /// Returns the dispatched request, if any.
    pub async fn ingest_build_completion(
        self: &Arc<Self>,
        build: BuildNotification,
    ) -> Option<DeployRequest> {
        let mut event = WebhookEvent::new(WebhookKind::BuildComplete, "build");
        event.image = build.image.clone();
        event.status = build.status.clone();

        info!("Build webhook: image={} status={}", build.image, build.status);

        let request = build
            .target_deployment()
            .filter(|_| build.is_deployable())
            .map(|deployment| {
                DeployRequest::new(
                    build.target_namespace(self.namespace()),
                    deployment,
                    &build.image,
                    Trigger::BuildWebhook,
                )
            });

        self.audit.record_webhook(event).await;

        if let Some(request) = request.clone() {
            let deployer = Arc::clone(&self.deployer);
            tokio::spawn(async move {
                // Failures are already recorded as failed deploy events
                let _ = deployer.apply(&request).await;
            });
        }

        request
    }

    /// Manually deploy an image
    pub async fn deploy(
        &self,
        namespace: &str,
        deployment: &str,
        image: &str,
    ) -> Result<DeployOutcome> {
        if deployment.is_empty() || image.is_empty() {
            return Err(Error::InvalidPayload(
                "deployment and image are required".to_string(),
            ));
        }

        self.deployer
            .apply(&DeployRequest::new(namespace, deployment, image, Trigger::Manual))
            .await
    }

    /// Roll a deployment back to a given version, or to the image it replaced last.
    ///
    /// Returns the target image together with the deploy outcome.
    pub async fn rollback(
        &self,
        namespace: &str,
        deployment: &str,
        version: Option<u64>,
    ) -> Result<(String, DeployOutcome)> {
        let history = self.history.history(deployment).await;
        let events = self.audit.deploy_events().await;

        let image = history::resolve_rollback_target(deployment, version, &history, &events)?;
        info!(
            "Rolling back {}/{} to {}",
            namespace, deployment, image
        );

        let digest = version.and_then(|v| {
            history
                .iter()
                .find(|entry| entry.version == v)
                .and_then(|entry| entry.digest.clone())
        });

        let outcome = self
            .deployer
            .apply(
                &DeployRequest::new(namespace, deployment, &image, Trigger::Rollback)
                    .with_digest(digest),
            )
            .await?;

        Ok((image, outcome))
    }

    /// Rebuild the read model from the cluster once
    pub async fn refresh_read_model(&self) -> AnyResult<usize> {
        match &self.cluster {
            Some(cluster) => {
                sync::refresh(
                    cluster.as_ref(),
                    &self.rules,
                    &self.read_model,
                    &self.settings.namespace,
                )
                .await
            }
            None => Ok(0),
        }
    }

    /// Last digest observed for `repository:tag`
    pub async fn known_digest(&self, repository: &str, tag: &str) -> Option<Digest> {
        self.digests.get(&self.image_ref(repository, tag)).await
    }
}
