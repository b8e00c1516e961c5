use serde::{Deserialize, Serialize};
use std::fmt;

/// Content-addressed identifier of an image manifest, e.g. `sha256:4f1c...`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Wrap a digest string as reported by the registry
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Abbreviated form for log lines: the first 12 characters of the hash
    pub fn short(&self) -> &str {
        let hash = self
            .0
            .split_once(':')
            .map(|(_, hash)| hash)
            .unwrap_or(&self.0);
        match hash.char_indices().nth(12) {
            Some((idx, _)) => &hash[..idx],
            None => hash,
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Digest {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Digest {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
