use serde::{Deserialize, Serialize};
use std::fmt;

/// A `registry/repository:tag` image reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    pub fn new(
        registry: impl Into<String>,
        repository: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            registry: registry.into(),
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// Parse an image string such as `10.0.0.1:5000/team/api:v2`.
    ///
    /// The first path segment is treated as the registry host only when it
    /// looks like one (contains `.` or `:`, or is `localhost`). A missing tag
    /// defaults to `latest`; a trailing `@digest` is ignored.
    pub fn parse(image: &str) -> Self {
        let image = image.split('@').next().unwrap_or_default();

        let (name, tag) = match image.rfind(':') {
            Some(idx) if !image[idx..].contains('/') => (&image[..idx], &image[idx + 1..]),
            _ => (image, "latest"),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((host, rest))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host, rest)
            }
            _ => ("", name),
        };

        Self::new(registry, repository, tag)
    }

    /// Last path segment of the repository, used as the default workload name
    pub fn short_name(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.registry.is_empty() {
            write!(f, "{}:{}", self.repository, self.tag)
        } else {
            write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
        }
    }
}
