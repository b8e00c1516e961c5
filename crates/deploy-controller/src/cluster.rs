//! Orchestration platform contract and its Kubernetes implementation
//!
//! The controller only needs four operations on workloads: get, update the
//! image, create and list. `KubeClient` speaks the `apps/v1` Deployments
//! REST API directly with the in-cluster service account.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;
use tracing::{debug, info};

const TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const STRATEGIC_MERGE_PATCH: &str = "application/strategic-merge-patch+json";

/// Snapshot of a workload as seen by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub name: String,
    pub namespace: String,
    /// Name of the first container, the one whose image is managed
    pub container: String,
    pub image: String,
    /// Desired replica count
    pub replicas: i32,
    pub ready_replicas: i32,
    pub labels: BTreeMap<String, String>,
    /// Pod template annotations
    pub annotations: BTreeMap<String, String>,
}

/// Image change for an existing workload
#[derive(Debug, Clone)]
pub struct ImageUpdate {
    pub container: String,
    pub image: String,
    /// Annotations merged into the pod template
    pub annotations: BTreeMap<String, String>,
}

/// Definition of a workload to create
#[derive(Debug, Clone)]
pub struct NewWorkload {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub replicas: i32,
    pub port: i32,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// Narrow contract with the orchestration platform
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch a workload; `Ok(None)` when it does not exist
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<Workload>>;

    /// Replace the managed container image and stamp template annotations
    async fn update_workload_image(
        &self,
        namespace: &str,
        name: &str,
        update: &ImageUpdate,
    ) -> Result<()>;

    async fn create_workload(&self, workload: &NewWorkload) -> Result<()>;

    async fn list_workloads(&self, namespace: &str) -> Result<Vec<Workload>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerPort {
    container_port: i32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Container {
    #[serde(default)]
    name: String,
    #[serde(default)]
    image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    ports: Vec<ContainerPort>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PodTemplate {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: PodSpec,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LabelSelector {
    #[serde(default)]
    match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DeploymentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    replicas: Option<i32>,
    #[serde(default)]
    selector: LabelSelector,
    #[serde(default)]
    template: PodTemplate,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentStatus {
    #[serde(default)]
    replicas: i32,
    #[serde(default)]
    ready_replicas: i32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubeDeployment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: DeploymentSpec,
    #[serde(default, skip_serializing)]
    status: DeploymentStatus,
}

#[derive(Debug, Deserialize)]
struct DeploymentList {
    #[serde(default)]
    items: Vec<KubeDeployment>,
}

impl From<KubeDeployment> for Workload {
    fn from(deployment: KubeDeployment) -> Self {
        let KubeDeployment {
            metadata,
            spec,
            status,
            ..
        } = deployment;

        let (container, image) = spec
            .template
            .spec
            .containers
            .into_iter()
            .next()
            .map(|c| (c.name, c.image))
            .unwrap_or_default();

        Workload {
            name: metadata.name,
            namespace: metadata.namespace,
            container,
            image,
            replicas: spec.replicas.unwrap_or(status.replicas),
            ready_replicas: status.ready_replicas,
            labels: metadata.labels,
            annotations: spec.template.metadata.annotations,
        }
    }
}

impl From<&NewWorkload> for KubeDeployment {
    fn from(workload: &NewWorkload) -> Self {
        let selector: BTreeMap<String, String> =
            [("app".to_string(), workload.name.clone())].into();

        KubeDeployment {
            api_version: Some("apps/v1".to_string()),
            kind: Some("Deployment".to_string()),
            metadata: ObjectMeta {
                name: workload.name.clone(),
                namespace: workload.namespace.clone(),
                labels: workload.labels.clone(),
                annotations: BTreeMap::new(),
            },
            spec: DeploymentSpec {
                replicas: Some(workload.replicas),
                selector: LabelSelector {
                    match_labels: selector.clone(),
                },
                template: PodTemplate {
                    metadata: ObjectMeta {
                        labels: selector,
                        annotations: workload.annotations.clone(),
                        ..Default::default()
                    },
                    spec: PodSpec {
                        containers: vec![Container {
                            name: workload.name.clone(),
                            image: workload.image.clone(),
                            ports: vec![ContainerPort {
                                container_port: workload.port,
                            }],
                        }],
                    },
                },
            },
            status: DeploymentStatus::default(),
        }
    }
}

/// Kubernetes API client for `apps/v1` Deployments
pub struct KubeClient {
    base_url: String,
    client: reqwest::Client,
}

impl KubeClient {
    /// Create a client against an explicit API server with a prepared HTTP client
    pub fn new(base_url: String, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Build a client from the in-cluster service account
    pub fn in_cluster(timeout: Duration) -> Result<Self> {
        let host = env::var("KUBERNETES_SERVICE_HOST")
            .context("KUBERNETES_SERVICE_HOST not set, not running inside a cluster")?;
        let port = env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let token = std::fs::read_to_string(TOKEN_PATH)
            .context("Failed to read service account token")?;
        let ca = std::fs::read(CA_PATH).context("Failed to read service account CA")?;
        let certificate =
            reqwest::Certificate::from_pem(&ca).context("Invalid service account CA")?;

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
            .context("Invalid service account token")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .add_root_certificate(certificate)
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("Failed to build Kubernetes HTTP client")?;

        let base_url = if host.contains(':') {
            format!("https://[{}]:{}", host, port)
        } else {
            format!("https://{}:{}", host, port)
        };

        info!("Using in-cluster Kubernetes API at {}", base_url);

        Ok(Self::new(base_url, client))
    }

    fn deployments_url(&self, namespace: &str) -> String {
        format!(
            "{}/apis/apps/v1/namespaces/{}/deployments",
            self.base_url, namespace
        )
    }

    fn deployment_url(&self, namespace: &str, name: &str) -> String {
        format!("{}/{}", self.deployments_url(namespace), name)
    }
}

/// Turn a non-success response into an error carrying the API's message
async fn ensure_success(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    anyhow::bail!("Failed to {}: {} {}", action, status, body)
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<Workload>> {
        let url = self.deployment_url(namespace, name);
        debug!("Fetching deployment: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to connect to Kubernetes API")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let deployment: KubeDeployment = ensure_success(response, "get deployment")
            .await?
            .json()
            .await
            .context("Failed to parse deployment")?;

        Ok(Some(deployment.into()))
    }

    async fn update_workload_image(
        &self,
        namespace: &str,
        name: &str,
        update: &ImageUpdate,
    ) -> Result<()> {
        let patch = serde_json::json!({
            "spec": {
                "template": {
                    "metadata": { "annotations": update.annotations },
                    "spec": {
                        "containers": [{ "name": update.container, "image": update.image }]
                    }
                }
            }
        });

        let response = self
            .client
            .patch(self.deployment_url(namespace, name))
            .header(CONTENT_TYPE, STRATEGIC_MERGE_PATCH)
            .body(serde_json::to_vec(&patch)?)
            .send()
            .await
            .context("Failed to connect to Kubernetes API")?;

        ensure_success(response, "update deployment").await?;
        Ok(())
    }

    async fn create_workload(&self, workload: &NewWorkload) -> Result<()> {
        let body = KubeDeployment::from(workload);

        let response = self
            .client
            .post(self.deployments_url(&workload.namespace))
            .json(&body)
            .send()
            .await
            .context("Failed to connect to Kubernetes API")?;

        ensure_success(response, "create deployment").await?;
        Ok(())
    }

    async fn list_workloads(&self, namespace: &str) -> Result<Vec<Workload>> {
        let response = self
            .client
            .get(self.deployments_url(namespace))
            .send()
            .await
            .context("Failed to connect to Kubernetes API")?;

        let list: DeploymentList = ensure_success(response, "list deployments")
            .await?
            .json()
            .await
            .context("Failed to parse deployment list")?;

        Ok(list.items.into_iter().map(Workload::from).collect())
    }
}
