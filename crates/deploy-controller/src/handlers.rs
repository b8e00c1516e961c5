//! API handlers for the deploy controller

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use deploy_common::{AutoDeployRule, DeploymentInfo, Error};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::build_trigger::BuildRequest;
use crate::controller::Controller;
use crate::ingest::{BuildNotification, GitPush, GitWebhookPayload, RegistryNotification};
use crate::mutator::DeployOutcome;

/// Shared application state
pub struct AppState {
    pub controller: Arc<Controller>,
}

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = if err.is_not_found() {
            StatusCode::NOT_FOUND
        } else {
            match err {
                Error::InvalidPayload(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
                Error::ClusterUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            }
        };

        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: rejection.body_text(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{:#}", err),
        }
    }
}

/// Manual deploy request
#[derive(Debug, Deserialize)]
pub struct DeployBody {
    pub deployment: String,
    #[serde(default)]
    pub namespace: String,
    pub image: String,
}

/// Rollback request; a missing or zero version rolls back to the previous image
#[derive(Debug, Deserialize)]
pub struct RollbackBody {
    pub deployment: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub version: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct DeploymentQuery {
    pub deployment: Option<String>,
}

/// Request to trigger a build directly
#[derive(Debug, Deserialize)]
pub struct TriggerBuildBody {
    pub repo: String,
    #[serde(default)]
    pub branch: String,
}

/// Registry repository with its tags
#[derive(Debug, serde::Serialize)]
pub struct RegistryImage {
    pub name: String,
    pub tags: Vec<String>,
}

fn or_default_namespace(namespace: String, controller: &Controller) -> String {
    if namespace.is_empty() {
        controller.namespace().to_string()
    } else {
        namespace
    }
}

/// Health check
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "deploy-controller",
        "version": env!("CARGO_PKG_VERSION"),
        "time": Utc::now().to_rfc3339(),
    }))
}

/// Current read-model snapshot, sorted by name
pub async fn list_deployments_handler(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<DeploymentInfo>> {
    Json(state.controller.read_model().snapshot().await)
}

/// Deploy an image manually
pub async fn deploy_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DeployBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(body) = payload?;
    let namespace = or_default_namespace(body.namespace, &state.controller);

    info!(
        "Manual deploy of {} to {}/{}",
        body.image, namespace, body.deployment
    );

    let outcome = state
        .controller
        .deploy(&namespace, &body.deployment, &body.image)
        .await?;

    let version = match outcome {
        DeployOutcome::Deployed { version, .. } => Some(version),
        DeployOutcome::Unchanged => None,
    };

    Ok(Json(serde_json::json!({
        "status": "deployed",
        "version": version,
    })))
}

/// Roll a deployment back
pub async fn rollback_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RollbackBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(body) = payload?;
    let namespace = or_default_namespace(body.namespace, &state.controller);
    let version = body.version.filter(|v| *v > 0);

    let (image, _) = state
        .controller
        .rollback(&namespace, &body.deployment, version)
        .await?;

    Ok(Json(serde_json::json!({
        "status": "rolled back",
        "image": image,
    })))
}

/// Recent deploy events, newest first
pub async fn events_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.audit().deploy_events().await)
}

/// Version history of one deployment, or of all deployments
pub async fn history_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeploymentQuery>,
) -> Response {
    let history = state.controller.history();

    match query.deployment.filter(|d| !d.is_empty()) {
        Some(deployment) => Json(history.history(&deployment).await).into_response(),
        None => Json(history.all().await).into_response(),
    }
}

/// Recent registry push observations
pub async fn registry_events_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.audit().registry_events().await)
}

/// Recent git and build webhook observations
pub async fn webhook_events_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.audit().webhook_events().await)
}

/// Registry push notifications; acknowledged before any deploy runs
pub async fn registry_webhook_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegistryNotification>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(notification) = payload.map_err(|e| {
        warn!("Registry webhook: failed to parse: {}", e.body_text());
        ApiError::from(e)
    })?;

    let events = state
        .controller
        .ingest_registry_notification(notification)
        .await;

    Ok(Json(serde_json::json!({
        "status": "received",
        "events": events,
    })))
}

/// Git push notifications, forwarded to the build service
pub async fn git_webhook_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GitWebhookPayload>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(payload) = payload?;
    let event_id = state
        .controller
        .ingest_git_push(GitPush::from(payload))
        .await;

    Ok(Json(serde_json::json!({
        "status": "received",
        "eventId": event_id,
    })))
}

/// Build completion notifications; successful builds are deployed
pub async fn build_webhook_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<BuildNotification>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(build) = payload?;
    state.controller.ingest_build_completion(build).await;

    Ok(Json(serde_json::json!({ "status": "processed" })))
}

/// All auto-deploy rules keyed by deployment
pub async fn list_rules_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.rules().list().await)
}

/// Create or replace an auto-deploy rule
pub async fn upsert_rule_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AutoDeployRule>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(mut rule) = payload?;

    // An empty image pattern is allowed and matches every push
    if rule.deployment.is_empty() {
        return Err(Error::InvalidPayload("deployment is required".to_string()).into());
    }
    rule.namespace = or_default_namespace(rule.namespace, &state.controller);

    info!(
        "Auto-deploy rule added: {} -> {}/{} (autoCreate: {})",
        rule.image_pattern, rule.namespace, rule.deployment, rule.auto_create
    );
    state.controller.rules().upsert(rule).await;

    Ok(Json(serde_json::json!({ "status": "added" })))
}

/// Delete the auto-deploy rule of a deployment
pub async fn delete_rule_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeploymentQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deployment = query
        .deployment
        .filter(|d| !d.is_empty())
        .ok_or_else(|| Error::InvalidPayload("deployment is required".to_string()))?;

    state
        .controller
        .rules()
        .remove(&deployment)
        .await
        .ok_or_else(|| Error::RuleNotFound(deployment.clone()))?;

    info!("Auto-deploy rule deleted: {}", deployment);

    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

/// Repositories and tags currently in the registry
pub async fn images_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<RegistryImage>>, ApiError> {
    let registry = state.controller.registry();
    let repositories = registry.list_repositories().await?;

    let mut images = Vec::with_capacity(repositories.len());
    for name in repositories {
        let tags = registry.list_tags(&name).await.unwrap_or_default();
        images.push(RegistryImage { name, tags });
    }

    Ok(Json(images))
}

/// Builds known to the build service; empty when it is unreachable
pub async fn forge_builds_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.controller.builds().list_builds().await {
        Ok(builds) => Json(builds),
        Err(e) => {
            warn!("Failed to fetch builds: {:#}", e);
            Json(Vec::new())
        }
    }
}

/// Trigger a build in the background
pub async fn trigger_build_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TriggerBuildBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(body) = payload?;

    let controller = Arc::clone(&state.controller);
    tokio::spawn(async move {
        controller
            .trigger_build(BuildRequest {
                repo: body.repo,
                branch: body.branch,
                commit: String::new(),
            })
            .await;
    });

    Ok(Json(serde_json::json!({ "status": "triggered" })))
}
