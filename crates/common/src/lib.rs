//! Shared types for the deploy controller.
//!
//! Holds the data model exchanged between the controller's stores, its HTTP
//! API and its collaborators, plus the common error type and the bounded
//! most-recent-first log used by every audit store.

pub mod bounded;
pub mod digest;
pub mod error;
pub mod image;
pub mod models;

pub use bounded::BoundedLog;
pub use digest::Digest;
pub use error::{Error, Result};
pub use image::ImageReference;
pub use models::{
    AutoDeployRule, DeployEvent, DeployStatus, DeploymentInfo, DeploymentVersion, RegistryEvent,
    Trigger, WebhookEvent, WebhookKind, WorkloadStatus,
};
