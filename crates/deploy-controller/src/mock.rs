//! In-memory registry, cluster and build service for development and testing
//!
//! Used when `MOCK_MODE=true` and by the test suites. Each mock can be
//! switched to an unavailable state to simulate upstream outages.

use anyhow::Result;
use async_trait::async_trait;
use deploy_common::Digest;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

use crate::build_trigger::{BuildRequest, BuildTrigger};
use crate::cluster::{ClusterApi, ImageUpdate, NewWorkload, Workload};
use crate::registry_client::RegistryApi;

/// Mock registry: repository -> tag -> digest
#[derive(Default)]
pub struct MockRegistry {
    repositories: Mutex<BTreeMap<String, BTreeMap<String, Digest>>>,
    unavailable: AtomicBool,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `repository:tag` with the given digest, replacing any previous one
    pub async fn push(&self, repository: &str, tag: &str, digest: impl Into<Digest>) {
        let digest = digest.into();
        debug!("Mock registry: push {}:{} -> {}", repository, tag, digest);
        self.repositories
            .lock()
            .await
            .entry(repository.to_string())
            .or_default()
            .insert(tag.to_string(), digest);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("Mock registry unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryApi for MockRegistry {
    async fn list_repositories(&self) -> Result<Vec<String>> {
        self.check_available()?;
        Ok(self.repositories.lock().await.keys().cloned().collect())
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let repositories = self.repositories.lock().await;
        match repositories.get(repository) {
            Some(tags) => Ok(tags.keys().cloned().collect()),
            None => anyhow::bail!("Repository not found: {}", repository),
        }
    }

    async fn manifest_digest(&self, repository: &str, tag: &str) -> Result<Digest> {
        self.check_available()?;
        let repositories = self.repositories.lock().await;
        repositories
            .get(repository)
            .and_then(|tags| tags.get(tag))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Manifest not found: {}:{}", repository, tag))
    }
}

/// Mock cluster keyed by (namespace, name)
#[derive(Default)]
pub struct MockCluster {
    workloads: Mutex<BTreeMap<(String, String), Workload>>,
    unavailable: AtomicBool,
    updates: AtomicUsize,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a ready single-replica workload running `image`
    pub async fn seed(&self, namespace: &str, name: &str, image: &str) {
        let workload = Workload {
            name: name.to_string(),
            namespace: namespace.to_string(),
            container: name.to_string(),
            image: image.to_string(),
            replicas: 1,
            ready_replicas: 1,
            labels: [("app".to_string(), name.to_string())].into(),
            annotations: BTreeMap::new(),
        };
        self.insert(workload).await;
    }

    pub async fn insert(&self, workload: Workload) {
        self.workloads.lock().await.insert(
            (workload.namespace.clone(), workload.name.clone()),
            workload,
        );
    }

    /// Current state of a workload
    pub async fn workload(&self, namespace: &str, name: &str) -> Option<Workload> {
        self.workloads
            .lock()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Number of image updates applied so far
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("Mock cluster unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<Workload>> {
        self.check_available()?;
        Ok(self.workload(namespace, name).await)
    }

    async fn update_workload_image(
        &self,
        namespace: &str,
        name: &str,
        update: &ImageUpdate,
    ) -> Result<()> {
        self.check_available()?;
        let mut workloads = self.workloads.lock().await;
        let workload = workloads
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| anyhow::anyhow!("deployments \"{}\" not found", name))?;

        workload.image = update.image.clone();
        workload
            .annotations
            .extend(update.annotations.clone());
        self.updates.fetch_add(1, Ordering::SeqCst);

        debug!("Mock cluster: {}/{} -> {}", namespace, name, update.image);
        Ok(())
    }

    async fn create_workload(&self, workload: &NewWorkload) -> Result<()> {
        self.check_available()?;
        let mut workloads = self.workloads.lock().await;
        let key = (workload.namespace.clone(), workload.name.clone());
        if workloads.contains_key(&key) {
            anyhow::bail!("deployments \"{}\" already exists", workload.name);
        }

        workloads.insert(
            key,
            Workload {
                name: workload.name.clone(),
                namespace: workload.namespace.clone(),
                container: workload.name.clone(),
                image: workload.image.clone(),
                replicas: workload.replicas,
                ready_replicas: 0,
                labels: workload.labels.clone(),
                annotations: workload.annotations.clone(),
            },
        );
        Ok(())
    }

    async fn list_workloads(&self, namespace: &str) -> Result<Vec<Workload>> {
        self.check_available()?;
        Ok(self
            .workloads
            .lock()
            .await
            .values()
            .filter(|w| w.namespace == namespace)
            .cloned()
            .collect())
    }
}

/// Mock build service recording every triggered build
#[derive(Default)]
pub struct MockBuilds {
    requests: Mutex<Vec<BuildRequest>>,
    unavailable: AtomicBool,
}

impl MockBuilds {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn requests(&self) -> Vec<BuildRequest> {
        self.requests.lock().await.clone()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("Mock build service unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl BuildTrigger for MockBuilds {
    async fn trigger_build(&self, request: &BuildRequest) -> Result<()> {
        self.check_available()?;
        self.requests.lock().await.push(request.clone());
        Ok(())
    }

    async fn list_builds(&self) -> Result<Vec<serde_json::Value>> {
        self.check_available()?;
        let requests = self.requests.lock().await;
        Ok(requests
            .iter()
            .map(|r| serde_json::json!({ "repo": r.repo, "branch": r.branch, "commit": r.commit }))
            .collect())
    }
}
