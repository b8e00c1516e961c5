use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Deployment not found: {namespace}/{name}")]
    DeploymentNotFound { namespace: String, name: String },

    #[error("No matching version {version} for deployment {deployment}")]
    NoMatchingVersion { deployment: String, version: u64 },

    #[error("No previous image found for deployment {0}")]
    NoRollbackTarget(String),

    #[error("Auto-deploy rule not found: {0}")]
    RuleNotFound(String),

    #[error("Orchestration client not initialized")]
    ClusterUnavailable,

    #[error("Cluster error: {0}")]
    Cluster(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the error means the requested target does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::DeploymentNotFound { .. }
                | Error::NoMatchingVersion { .. }
                | Error::NoRollbackTarget(_)
                | Error::RuleNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
