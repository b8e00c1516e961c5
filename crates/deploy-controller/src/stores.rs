//! Owned in-memory stores
//!
//! Each logical store wraps its own lock and is only reachable through its
//! accessor methods. No accessor awaits anything but its own lock, so no
//! lock is ever held across registry or cluster I/O.

use chrono::Utc;
use deploy_common::{
    AutoDeployRule, BoundedLog, DeployEvent, DeploymentInfo, DeploymentVersion, Digest,
    RegistryEvent, WebhookEvent,
};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use crate::matcher::{self, Target};

pub const DEPLOY_EVENT_CAP: usize = 100;
pub const REGISTRY_EVENT_CAP: usize = 100;
pub const WEBHOOK_EVENT_CAP: usize = 50;
pub const HISTORY_CAP: usize = 50;

/// Result of comparing a freshly resolved digest with the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// First time this reference is seen; recorded without triggering
    Baseline,
    Unchanged,
    Changed { previous: Digest },
}

/// Last known digest per fully-qualified image reference
#[derive(Default)]
pub struct DigestCache {
    digests: RwLock<HashMap<String, Digest>>,
}

impl DigestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare and record `digest` for `image_ref` in one critical section
    pub async fn observe(&self, image_ref: &str, digest: &Digest) -> Observation {
        let mut digests = self.digests.write().await;
        match digests.insert(image_ref.to_string(), digest.clone()) {
            None => Observation::Baseline,
            Some(previous) if previous == *digest => Observation::Unchanged,
            Some(previous) => Observation::Changed { previous },
        }
    }

    /// Unconditionally record a digest reported by a push notification
    pub async fn record(&self, image_ref: &str, digest: &Digest) -> Option<Digest> {
        self.digests
            .write()
            .await
            .insert(image_ref.to_string(), digest.clone())
    }

    pub async fn get(&self, image_ref: &str) -> Option<Digest> {
        self.digests.read().await.get(image_ref).cloned()
    }

    pub async fn len(&self) -> usize {
        self.digests.read().await.len()
    }
}

/// Auto-deploy rules keyed by deployment name
#[derive(Default)]
pub struct RuleSet {
    rules: RwLock<BTreeMap<String, AutoDeployRule>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace the rule keyed by its deployment name
    pub async fn upsert(&self, rule: AutoDeployRule) -> Option<AutoDeployRule> {
        self.rules
            .write()
            .await
            .insert(rule.deployment.clone(), rule)
    }

    pub async fn remove(&self, deployment: &str) -> Option<AutoDeployRule> {
        self.rules.write().await.remove(deployment)
    }

    pub async fn list(&self) -> BTreeMap<String, AutoDeployRule> {
        self.rules.read().await.clone()
    }

    /// Select every target for an image and stamp `lastTriggered` on the matching rules
    pub async fn match_and_touch(&self, repository: &str, tag: &str, image_ref: &str) -> Vec<Target> {
        let mut rules = self.rules.write().await;
        let now = Utc::now();

        let mut targets = Vec::new();
        for rule in rules.values_mut() {
            if matcher::rule_matches(rule, repository, tag, image_ref) {
                rule.last_triggered = Some(now);
                targets.push(Target::from(&*rule));
            }
        }
        targets
    }
}

/// Bounded audit logs of deploys, registry pushes and other webhooks
pub struct AuditLog {
    deploys: RwLock<BoundedLog<DeployEvent>>,
    registry: RwLock<BoundedLog<RegistryEvent>>,
    webhooks: RwLock<BoundedLog<WebhookEvent>>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self {
            deploys: RwLock::new(BoundedLog::new(DEPLOY_EVENT_CAP)),
            registry: RwLock::new(BoundedLog::new(REGISTRY_EVENT_CAP)),
            webhooks: RwLock::new(BoundedLog::new(WEBHOOK_EVENT_CAP)),
        }
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_deploy(&self, event: DeployEvent) {
        self.deploys.write().await.push(event);
    }

    /// Recent deploy events, newest first
    pub async fn deploy_events(&self) -> Vec<DeployEvent> {
        self.deploys.read().await.to_vec()
    }

    pub async fn record_registry(&self, event: RegistryEvent) {
        self.registry.write().await.push(event);
    }

    /// Mark a registry event as processed; false if it was already evicted
    pub async fn settle_registry(&self, id: &str, auto_deployed: bool) -> bool {
        let mut registry = self.registry.write().await;
        match registry.find_mut(|event| event.id == id) {
            Some(event) => {
                event.mark_processed(auto_deployed);
                true
            }
            None => false,
        }
    }

    pub async fn registry_events(&self) -> Vec<RegistryEvent> {
        self.registry.read().await.to_vec()
    }

    pub async fn record_webhook(&self, event: WebhookEvent) {
        self.webhooks.write().await.push(event);
    }

    pub async fn webhook_events(&self) -> Vec<WebhookEvent> {
        self.webhooks.read().await.to_vec()
    }
}

#[derive(Default)]
struct HistoryInner {
    entries: HashMap<String, BoundedLog<DeploymentVersion>>,
    next_version: HashMap<String, u64>,
}

/// Per-deployment version history
#[derive(Default)]
pub struct HistoryStore {
    inner: RwLock<HistoryInner>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, assigning the next version number for the deployment.
    ///
    /// Numbering comes from a counter rather than the log length, so it stays
    /// gap-free after old entries are evicted.
    pub async fn append(&self, deployment: &str, mut entry: DeploymentVersion) -> DeploymentVersion {
        let mut inner = self.inner.write().await;

        let counter = inner.next_version.entry(deployment.to_string()).or_insert(0);
        *counter += 1;
        entry.version = *counter;

        inner
            .entries
            .entry(deployment.to_string())
            .or_insert_with(|| BoundedLog::new(HISTORY_CAP))
            .push(entry.clone());

        entry
    }

    /// History of one deployment, newest first; empty when unknown
    pub async fn history(&self, deployment: &str) -> Vec<DeploymentVersion> {
        self.inner
            .read()
            .await
            .entries
            .get(deployment)
            .map(BoundedLog::to_vec)
            .unwrap_or_default()
    }

    pub async fn all(&self) -> BTreeMap<String, Vec<DeploymentVersion>> {
        self.inner
            .read()
            .await
            .entries
            .iter()
            .map(|(name, log)| (name.clone(), log.to_vec()))
            .collect()
    }
}

/// Cached snapshot of live workloads, replaced wholesale on every sync
#[derive(Default)]
pub struct ReadModel {
    deployments: RwLock<BTreeMap<String, DeploymentInfo>>,
}

impl ReadModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn replace(&self, deployments: Vec<DeploymentInfo>) {
        let fresh: BTreeMap<_, _> = deployments
            .into_iter()
            .map(|info| (info.name.clone(), info))
            .collect();
        *self.deployments.write().await = fresh;
    }

    /// Current snapshot sorted by name
    pub async fn snapshot(&self) -> Vec<DeploymentInfo> {
        self.deployments.read().await.values().cloned().collect()
    }
}

/// Suppresses repeated dispatches of the same digest to the same target
pub struct DedupWindow {
    window: Duration,
    seen: Mutex<HashMap<(String, Digest), Instant>>,
}

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `digest` should be dispatched to `target_key`, recording it if so.
    ///
    /// Always true for an empty digest or a zero window.
    pub async fn should_dispatch(&self, target_key: &str, digest: &Digest) -> bool {
        if self.window.is_zero() || digest.is_empty() {
            return true;
        }

        let now = Instant::now();
        let mut seen = self.seen.lock().await;
        seen.retain(|_, at| now.duration_since(*at) < self.window);

        let key = (target_key.to_string(), digest.clone());
        if seen.contains_key(&key) {
            return false;
        }
        seen.insert(key, now);
        true
    }
}
