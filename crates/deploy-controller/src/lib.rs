//! Deploy Controller
//!
//! Watches a container registry and webhook sources, decides which workloads
//! should move to a newly published image, applies the change to the cluster
//! and keeps a bounded, queryable history of every deploy and rollback.
//!
//! **Components:**
//! - `tracker`: registry digest polling and change detection
//! - `ingest`: registry, git and build webhook normalization
//! - `matcher`: auto-deploy rule matching
//! - `mutator`: idempotent image updates with per-deployment serialization
//! - `history`: rollback target resolution
//! - `stores`: owned in-memory stores (digests, rules, audit logs, history, read model)
//! - `sync`: periodic read-model refresh from the cluster
//! - `controller`: wiring of the above behind the API
//! - `registry_client`, `cluster`, `build_trigger`: external collaborators
//! - `mock`: in-memory collaborators for development and tests

pub mod build_trigger;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod handlers;
pub mod history;
pub mod ingest;
pub mod matcher;
pub mod mock;
pub mod mutator;
pub mod registry_client;
pub mod stores;
pub mod sync;
pub mod tracker;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use controller::{Backends, Controller, ControllerSettings};
pub use handlers::AppState;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/api/deployments", get(handlers::list_deployments_handler))
        .route("/api/deploy", post(handlers::deploy_handler))
        .route("/api/rollback", post(handlers::rollback_handler))
        .route("/api/events", get(handlers::events_handler))
        .route("/api/history", get(handlers::history_handler))
        .route("/api/registry-events", get(handlers::registry_events_handler))
        .route("/api/webhook", get(handlers::webhook_events_handler))
        .route(
            "/api/webhook/registry",
            post(handlers::registry_webhook_handler),
        )
        .route("/api/webhook/git", post(handlers::git_webhook_handler))
        .route("/api/webhook/build", post(handlers::build_webhook_handler))
        .route(
            "/api/autodeploy",
            get(handlers::list_rules_handler)
                .post(handlers::upsert_rule_handler)
                .delete(handlers::delete_rule_handler),
        )
        .route("/api/images", get(handlers::images_handler))
        .route("/api/forge/builds", get(handlers::forge_builds_handler))
        .route("/api/trigger-build", post(handlers::trigger_build_handler))
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
