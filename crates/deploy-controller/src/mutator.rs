//! Deployment mutator
//!
//! Applies an image change to a named workload, idempotently, and records the
//! outcome in the audit log and the deployment history. Deploys to the same
//! `namespace/deployment` are serialized through a per-key lock.

use chrono::Utc;
use deploy_common::{
    DeployEvent, DeployStatus, DeploymentVersion, Digest, Error, Result, Trigger,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::cluster::{ClusterApi, ImageUpdate, NewWorkload, Workload};
use crate::matcher::Target;
use crate::stores::{AuditLog, HistoryStore};

pub const ANNOTATION_DEPLOYED_AT: &str = "deploy-controller/deployed-at";
pub const ANNOTATION_TRIGGER: &str = "deploy-controller/trigger";
pub const ANNOTATION_PREVIOUS_IMAGE: &str = "deploy-controller/previous-image";
pub const ANNOTATION_CREATED_AT: &str = "deploy-controller/created-at";
pub const LABEL_AUTO_CREATED: &str = "deploy-controller/auto-created";

/// Container port exposed by auto-created workloads
const AUTO_CREATE_PORT: i32 = 8080;

/// A request to move a workload to a new image
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub namespace: String,
    pub deployment: String,
    pub image: String,
    pub trigger: Trigger,
    /// Digest of the pushed image, when known
    pub digest: Option<Digest>,
}

impl DeployRequest {
    pub fn new(
        namespace: impl Into<String>,
        deployment: impl Into<String>,
        image: impl Into<String>,
        trigger: Trigger,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            deployment: deployment.into(),
            image: image.into(),
            trigger,
            digest: None,
        }
    }

    pub fn with_digest(mut self, digest: Option<Digest>) -> Self {
        self.digest = digest.filter(|d| !d.is_empty());
        self
    }

    fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.deployment)
    }
}

/// Outcome of a successful apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    /// The workload already ran the requested image; nothing was recorded
    Unchanged,
    Deployed { previous_image: String, version: u64 },
}

/// Lazily created async mutex per key; entries are dropped once nobody holds or awaits them
#[derive(Default)]
pub struct KeyedLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Exclusive access to one key of a [`KeyedLocks`]
pub struct KeyedGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    owner: &'a KeyedLocks,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let lock = Arc::clone(self.entries().entry(key.to_string()).or_default());

        KeyedGuard {
            guard: Some(lock.lock_owned().await),
            key: key.to_string(),
            owner: self,
        }
    }

    /// Number of keys currently held or awaited
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut entries = self.owner.entries();
        if entries
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            entries.remove(&self.key);
        }
    }
}

/// Applies image changes to workloads
pub struct Deployer {
    cluster: Option<Arc<dyn ClusterApi>>,
    audit: Arc<AuditLog>,
    history: Arc<HistoryStore>,
    locks: KeyedLocks,
}

impl Deployer {
    pub fn new(
        cluster: Option<Arc<dyn ClusterApi>>,
        audit: Arc<AuditLog>,
        history: Arc<HistoryStore>,
    ) -> Self {
        Self {
            cluster,
            audit,
            history,
            locks: KeyedLocks::new(),
        }
    }

    fn cluster(&self) -> Result<&Arc<dyn ClusterApi>> {
        self.cluster.as_ref().ok_or(Error::ClusterUnavailable)
    }

    /// Move the workload to `request.image`.
    ///
    /// A workload already running the image is a no-op success without a
    /// history entry. Failures are recorded as failed events and returned.
    pub async fn apply(&self, request: &DeployRequest) -> Result<DeployOutcome> {
        let _guard = self.locks.lock(&request.key()).await;
        let start = Instant::now();

        let workload = match self.fetch(request).await {
            Ok(workload) => workload,
            Err(e) => {
                self.record_failure(request, "", &e, start).await;
                return Err(e);
            }
        };

        let previous_image = workload.image.clone();
        if previous_image == request.image {
            info!("Skipping deploy - image unchanged: {}", request.image);
            return Ok(DeployOutcome::Unchanged);
        }

        let update = ImageUpdate {
            container: workload.container.clone(),
            image: request.image.clone(),
            annotations: provenance_annotations(request.trigger, &previous_image),
        };

        if let Err(e) = self.submit(request, &update).await {
            self.record_failure(request, &previous_image, &e, start).await;
            return Err(e);
        }

        let duration = start.elapsed().as_secs_f64();

        self.audit
            .record_deploy(
                DeployEvent::new(
                    &request.deployment,
                    &request.namespace,
                    &request.image,
                    request.trigger,
                )
                .with_previous_image(&previous_image)
                .with_duration(duration)
                .mark_succeeded("Deployment updated"),
            )
            .await;

        let entry = self
            .history
            .append(
                &request.deployment,
                DeploymentVersion {
                    version: 0,
                    image: request.image.clone(),
                    trigger: request.trigger,
                    status: DeployStatus::Success,
                    timestamp: Utc::now(),
                    duration_seconds: duration,
                    message: format!("Updated from {}", previous_image),
                    digest: request.digest.clone(),
                },
            )
            .await;

        info!(
            "Deployed {} to {}/{} (trigger: {}, version: {})",
            request.image, request.namespace, request.deployment, request.trigger, entry.version
        );

        Ok(DeployOutcome::Deployed {
            previous_image,
            version: entry.version,
        })
    }

    /// Create the target workload running `image` if it does not exist yet.
    ///
    /// Returns whether a workload was created.
    pub async fn ensure_exists(&self, target: &Target, image: &str) -> Result<bool> {
        let _guard = self.locks.lock(&target.key()).await;
        let cluster = self.cluster()?;

        match cluster
            .get_workload(&target.namespace, &target.deployment)
            .await
        {
            Ok(Some(_)) => return Ok(false),
            Ok(None) => {}
            Err(e) => {
                warn!("Error checking deployment {}: {:#}", target.key(), e);
                return Err(Error::Cluster(format!("{:#}", e)));
            }
        }

        info!(
            "Auto-creating deployment {} with image {}",
            target.key(),
            image
        );

        let workload = NewWorkload {
            name: target.deployment.clone(),
            namespace: target.namespace.clone(),
            image: image.to_string(),
            replicas: 1,
            port: AUTO_CREATE_PORT,
            labels: BTreeMap::from([
                ("app".to_string(), target.deployment.clone()),
                (LABEL_AUTO_CREATED.to_string(), "true".to_string()),
            ]),
            annotations: BTreeMap::from([(
                ANNOTATION_CREATED_AT.to_string(),
                Utc::now().to_rfc3339(),
            )]),
        };

        let event = DeployEvent::new(
            &target.deployment,
            &target.namespace,
            image,
            Trigger::AutoCreate,
        );

        if let Err(e) = cluster.create_workload(&workload).await {
            warn!("Failed to create deployment {}: {:#}", target.key(), e);
            let error = Error::Cluster(format!("{:#}", e));
            self.audit
                .record_deploy(event.mark_failed(error.to_string()))
                .await;
            return Err(error);
        }

        self.audit
            .record_deploy(event.mark_succeeded("Deployment auto-created"))
            .await;
        info!("Created deployment {}", target.key());

        Ok(true)
    }

    async fn fetch(&self, request: &DeployRequest) -> Result<Workload> {
        let cluster = self.cluster()?;

        let workload = cluster
            .get_workload(&request.namespace, &request.deployment)
            .await
            .map_err(|e| Error::Cluster(format!("{:#}", e)))?
            .ok_or_else(|| Error::DeploymentNotFound {
                namespace: request.namespace.clone(),
                name: request.deployment.clone(),
            })?;

        if workload.container.is_empty() {
            return Err(Error::Cluster(format!(
                "deployment {} has no containers",
                request.key()
            )));
        }

        Ok(workload)
    }

    async fn submit(&self, request: &DeployRequest, update: &ImageUpdate) -> Result<()> {
        self.cluster()?
            .update_workload_image(&request.namespace, &request.deployment, update)
            .await
            .map_err(|e| Error::Cluster(format!("{:#}", e)))
    }

    async fn record_failure(
        &self,
        request: &DeployRequest,
        previous_image: &str,
        error: &Error,
        start: Instant,
    ) {
        warn!(
            "Deploy of {} to {}/{} failed: {}",
            request.image, request.namespace, request.deployment, error
        );

        self.audit
            .record_deploy(
                DeployEvent::new(
                    &request.deployment,
                    &request.namespace,
                    &request.image,
                    request.trigger,
                )
                .with_previous_image(previous_image)
                .with_duration(start.elapsed().as_secs_f64())
                .mark_failed(error.to_string()),
            )
            .await;
    }
}

/// Provenance stamped on the pod template of every update
fn provenance_annotations(trigger: Trigger, previous_image: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (ANNOTATION_DEPLOYED_AT.to_string(), Utc::now().to_rfc3339()),
        (ANNOTATION_TRIGGER.to_string(), trigger.to_string()),
        (
            ANNOTATION_PREVIOUS_IMAGE.to_string(),
            previous_image.to_string(),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCluster;

    fn deployer_with(cluster: Arc<MockCluster>) -> (Deployer, Arc<AuditLog>, Arc<HistoryStore>) {
        let audit = Arc::new(AuditLog::new());
        let history = Arc::new(HistoryStore::new());
        let deployer = Deployer::new(
            Some(cluster as Arc<dyn ClusterApi>),
            Arc::clone(&audit),
            Arc::clone(&history),
        );
        (deployer, audit, history)
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let cluster = Arc::new(MockCluster::new());
        cluster.seed("holm", "svc-a", "reg/svc-a:v1").await;
        let (deployer, audit, history) = deployer_with(Arc::clone(&cluster));

        let request = DeployRequest::new("holm", "svc-a", "reg/svc-a:v2", Trigger::Manual);
        let first = deployer.apply(&request).await.unwrap();
        let second = deployer.apply(&request).await.unwrap();

        assert_eq!(
            first,
            DeployOutcome::Deployed {
                previous_image: "reg/svc-a:v1".to_string(),
                version: 1
            }
        );
        assert_eq!(second, DeployOutcome::Unchanged);
        assert_eq!(history.history("svc-a").await.len(), 1);
        assert_eq!(audit.deploy_events().await.len(), 1);
        assert_eq!(cluster.update_count(), 1);
    }

    #[tokio::test]
    async fn test_apply_stamps_provenance() {
        let cluster = Arc::new(MockCluster::new());
        cluster.seed("holm", "svc-a", "reg/svc-a:v1").await;
        let (deployer, _, _) = deployer_with(Arc::clone(&cluster));

        deployer
            .apply(&DeployRequest::new("holm", "svc-a", "reg/svc-a:v2", Trigger::BuildWebhook))
            .await
            .unwrap();

        let workload = cluster.workload("holm", "svc-a").await.unwrap();
        assert_eq!(workload.image, "reg/svc-a:v2");
        assert_eq!(workload.annotations[ANNOTATION_TRIGGER], "build-webhook");
        assert_eq!(workload.annotations[ANNOTATION_PREVIOUS_IMAGE], "reg/svc-a:v1");
        assert!(workload.annotations.contains_key(ANNOTATION_DEPLOYED_AT));
    }

    #[tokio::test]
    async fn test_versions_are_sequential() {
        let cluster = Arc::new(MockCluster::new());
        cluster.seed("holm", "svc-a", "reg/svc-a:v0").await;
        let (deployer, _, history) = deployer_with(cluster);

        for i in 1..=5 {
            let image = format!("reg/svc-a:v{}", i);
            deployer
                .apply(&DeployRequest::new("holm", "svc-a", image, Trigger::Manual))
                .await
                .unwrap();
        }

        let versions: Vec<u64> = history
            .history("svc-a")
            .await
            .iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(versions, vec![5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn test_missing_deployment_records_failure() {
        let cluster = Arc::new(MockCluster::new());
        let (deployer, audit, history) = deployer_with(cluster);

        let err = deployer
            .apply(&DeployRequest::new("holm", "ghost", "reg/ghost:v1", Trigger::Manual))
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        let events = audit.deploy_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, DeployStatus::Failed);
        assert!(history.history("ghost").await.is_empty());
    }

    #[tokio::test]
    async fn test_cluster_failure_records_failure() {
        let cluster = Arc::new(MockCluster::new());
        cluster.seed("holm", "svc-a", "reg/svc-a:v1").await;
        cluster.set_unavailable(true);
        let (deployer, audit, history) = deployer_with(cluster);

        let result = deployer
            .apply(&DeployRequest::new("holm", "svc-a", "reg/svc-a:v2", Trigger::Manual))
            .await;

        assert!(matches!(result, Err(Error::Cluster(_))));
        assert_eq!(audit.deploy_events().await[0].status, DeployStatus::Failed);
        assert!(history.history("svc-a").await.is_empty());
    }

    #[tokio::test]
    async fn test_without_cluster_fails_cleanly() {
        let deployer = Deployer::new(
            None,
            Arc::new(AuditLog::new()),
            Arc::new(HistoryStore::new()),
        );

        let result = deployer
            .apply(&DeployRequest::new("holm", "svc-a", "img", Trigger::Manual))
            .await;
        assert!(matches!(result, Err(Error::ClusterUnavailable)));
    }

    #[tokio::test]
    async fn test_ensure_exists_creates_once() {
        let cluster = Arc::new(MockCluster::new());
        let (deployer, audit, _) = deployer_with(Arc::clone(&cluster));
        let target = Target {
            namespace: "holm".to_string(),
            deployment: "svc-new".to_string(),
            auto_create: true,
        };

        assert!(deployer.ensure_exists(&target, "reg/svc-new:v1").await.unwrap());
        assert!(!deployer.ensure_exists(&target, "reg/svc-new:v1").await.unwrap());

        let workload = cluster.workload("holm", "svc-new").await.unwrap();
        assert_eq!(workload.replicas, 1);
        assert_eq!(workload.labels[LABEL_AUTO_CREATED], "true");

        let events = audit.deploy_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trigger, Trigger::AutoCreate);
    }

    #[tokio::test]
    async fn test_concurrent_applies_serialize() {
        let cluster = Arc::new(MockCluster::new());
        cluster.seed("holm", "svc-a", "reg/svc-a:v1").await;
        let (deployer, _, history) = deployer_with(cluster);
        let deployer = Arc::new(deployer);

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let deployer = Arc::clone(&deployer);
            tasks.push(tokio::spawn(async move {
                deployer
                    .apply(&DeployRequest::new("holm", "svc-a", "reg/svc-a:v2", Trigger::RegistryPoll))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(history.history("svc-a").await.len(), 1);
    }

    #[tokio::test]
    async fn test_keyed_locks_release_idle_keys() {
        let locks = Arc::new(KeyedLocks::new());

        {
            let _guard = locks.lock("holm/ghost").await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());

        let first = locks.lock("holm/svc-a").await;
        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock("holm/svc-a").await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // The waiting task keeps the entry alive after the first holder leaves
        drop(first);
        assert_eq!(locks.len(), 1);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_failed_deploys_do_not_leak_locks() {
        let cluster = Arc::new(MockCluster::new());
        let (deployer, _, _) = deployer_with(cluster);

        for i in 0..10 {
            let request =
                DeployRequest::new("holm", format!("ghost-{}", i), "reg/x:v1", Trigger::Manual);
            assert!(deployer.apply(&request).await.is_err());
        }

        assert!(deployer.locks.is_empty());
    }
}
