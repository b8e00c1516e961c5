//! Rollback target resolution
//!
//! With an explicit version the deployment's history is searched for a
//! successful entry with that number. Without one, the recent deploy events
//! are searched for the newest successful deploy of the deployment that
//! replaced a known image, and that previous image becomes the target.

use deploy_common::{DeployEvent, DeployStatus, DeploymentVersion, Error, Result};

/// Resolve the image a rollback should deploy
pub fn resolve_rollback_target(
    deployment: &str,
    version: Option<u64>,
    history: &[DeploymentVersion],
    events: &[DeployEvent],
) -> Result<String> {
    match version {
        Some(version) => history
            .iter()
            .find(|entry| entry.version == version && entry.status == DeployStatus::Success)
            .map(|entry| entry.image.clone())
            .ok_or_else(|| Error::NoMatchingVersion {
                deployment: deployment.to_string(),
                version,
            }),
        None => events
            .iter()
            .find(|event| {
                event.deployment == deployment
                    && event.is_success()
                    && !event.previous_image.is_empty()
            })
            .map(|event| event.previous_image.clone())
            .ok_or_else(|| Error::NoRollbackTarget(deployment.to_string())),
    }
}
