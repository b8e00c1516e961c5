//! Read-model sync
//!
//! Periodically lists the workloads of the managed namespace and rebuilds the
//! deployment snapshot served by `GET /api/deployments`.

use anyhow::Result;
use deploy_common::{DeploymentInfo, WorkloadStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::controller::Controller;
use crate::stores::{ReadModel, RuleSet};

/// List workloads once and replace the read model with the result
pub async fn refresh(
    cluster: &dyn ClusterApi,
    rules: &RuleSet,
    read_model: &ReadModel,
    namespace: &str,
) -> Result<usize> {
    let workloads = cluster.list_workloads(namespace).await?;
    let rule_names = rules.list().await;

    let deployments: Vec<DeploymentInfo> = workloads
        .into_iter()
        .map(|workload| DeploymentInfo {
            auto_deploy: rule_names.contains_key(&workload.name),
            status: WorkloadStatus::from_replicas(workload.replicas, workload.ready_replicas),
            name: workload.name,
            namespace: workload.namespace,
            image: workload.image,
            replicas: workload.replicas,
            ready_replicas: workload.ready_replicas,
        })
        .collect();

    let count = deployments.len();
    read_model.replace(deployments).await;
    debug!("Synced {} deployment(s) from {}", count, namespace);

    Ok(count)
}

/// Refresh the read model forever; a missing cluster client leaves it empty
pub async fn run(controller: Arc<Controller>, interval: Duration) {
    info!("Starting deployment sync (every {} seconds)", interval.as_secs());

    loop {
        sleep(interval).await;

        if let Err(e) = controller.refresh_read_model().await {
            warn!("Failed to list deployments: {:#}", e);
        }
    }
}
