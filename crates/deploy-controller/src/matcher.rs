//! Auto-deploy rule matching
//!
//! Every enabled rule whose image pattern occurs in the repository name or in
//! the full image reference, and whose tag pattern accepts the tag, fires.
//! A single push can therefore target several workloads.

use deploy_common::AutoDeployRule;

/// A workload selected by a matching rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
    pub namespace: String,
    pub deployment: String,
    pub auto_create: bool,
}

impl Target {
    /// `namespace/deployment`, the key used for locking and de-duplication
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.deployment)
    }
}

impl From<&AutoDeployRule> for Target {
    fn from(rule: &AutoDeployRule) -> Self {
        Target {
            namespace: rule.namespace.clone(),
            deployment: rule.deployment.clone(),
            auto_create: rule.auto_create,
        }
    }
}

/// Simple wildcard tag matching.
///
/// Empty or `*` matches any tag, `prefix*` matches by prefix, anything else
/// (including `latest`) requires exact equality.
pub fn tag_matches(pattern: &str, tag: &str) -> bool {
    if pattern.is_empty() || pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => tag.starts_with(prefix),
        None => tag == pattern,
    }
}

/// Whether a rule fires for `repository:tag` published as `image_ref`
pub fn rule_matches(rule: &AutoDeployRule, repository: &str, tag: &str, image_ref: &str) -> bool {
    if !rule.enabled {
        return false;
    }

    let image_matches =
        repository.contains(&rule.image_pattern) || image_ref.contains(&rule.image_pattern);

    image_matches && tag_matches(&rule.tag_pattern, tag)
}
