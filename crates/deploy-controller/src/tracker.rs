//! Registry digest tracker
//!
//! Walks the registry catalog, resolves every `repository:tag` to its
//! manifest digest and compares it with the digest cache. The first sighting
//! of a reference only records a baseline; a changed digest is reported as a
//! push. This is the fallback path for registries that do not send (or lose)
//! push notifications.

use anyhow::{Context, Result};
use deploy_common::{ImageReference, Trigger};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::controller::Controller;
use crate::ingest::ImagePush;
use crate::registry_client::RegistryApi;
use crate::stores::{DigestCache, Observation};

/// Scans the registry and detects digest changes
pub struct RegistryTracker {
    registry: Arc<dyn RegistryApi>,
    digests: Arc<DigestCache>,
    registry_host: String,
}

impl RegistryTracker {
    pub fn new(
        registry: Arc<dyn RegistryApi>,
        digests: Arc<DigestCache>,
        registry_host: String,
    ) -> Self {
        Self {
            registry,
            digests,
            registry_host,
        }
    }

    /// Scan every repository and tag once, returning the references whose digest changed.
    ///
    /// Failing to list the catalog fails the scan; failures for a single
    /// repository or tag only skip that item.
    pub async fn scan(&self) -> Result<Vec<ImagePush>> {
        let repositories = self
            .registry
            .list_repositories()
            .await
            .context("Registry scan failed")?;

        let mut changes = Vec::new();
        let mut baselines = 0usize;

        for repository in repositories {
            let tags = match self.registry.list_tags(&repository).await {
                Ok(tags) => tags,
                Err(e) => {
                    warn!("Skipping repository {}: {:#}", repository, e);
                    continue;
                }
            };

            for tag in tags {
                let digest = match self.registry.manifest_digest(&repository, &tag).await {
                    Ok(digest) => digest,
                    Err(e) => {
                        debug!("Skipping {}:{}: {:#}", repository, tag, e);
                        continue;
                    }
                };

                let image_ref =
                    ImageReference::new(&self.registry_host, &repository, &tag).to_string();

                match self.digests.observe(&image_ref, &digest).await {
                    Observation::Baseline => baselines += 1,
                    Observation::Unchanged => {}
                    Observation::Changed { previous } => {
                        info!(
                            "Image updated (poll): {} ({} -> {})",
                            image_ref,
                            previous.short(),
                            digest.short()
                        );
                        changes.push(ImagePush {
                            repository: repository.clone(),
                            tag,
                            digest,
                            source: Trigger::RegistryPoll,
                        });
                    }
                }
            }
        }

        if baselines > 0 {
            debug!("Recorded {} baseline digest(s)", baselines);
        }

        Ok(changes)
    }
}

/// Poll the registry forever, dispatching every detected change in the background
pub async fn watch(controller: Arc<Controller>, interval: Duration) {
    info!(
        "Starting registry watcher (polling every {} seconds)",
        interval.as_secs()
    );

    loop {
        match controller.poll_registry().await {
            Ok(changes) => {
                for push in changes {
                    let controller = Arc::clone(&controller);
                    tokio::spawn(async move {
                        controller.process_push(push, None).await;
                    });
                }
            }
            Err(e) => {
                error!("{:#}", e);
                // Continue despite errors - retried on the next cycle
            }
        }

        sleep(interval).await;
    }
}
